use std::collections::HashMap;
use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::body::Body;
use axum::extract::{Form, Path, Query, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use include_dir::{Dir, include_dir};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

const GRID_ROWS: usize = 50;
const GRID_COLS: usize = 50;
const GRID_CELLS: usize = GRID_ROWS * GRID_COLS;
const SPECIES_COUNT: usize = 5;
const REPLACEMENT_COLS: usize = 6;
const MAX_SELECTED_CELLS: usize = 2;
const MATRIX_X_LOCATION: f32 = 5.0;
const MATRIX_Y_LOCATION: f32 = 5.0;
const MATRIX_SPACING: f32 = 5.0;
const SIM_ID_LENGTH: usize = 10;
const LOG_DATA_FIELDS: usize = 7;
const LOAD_CHAT_CHANNEL: u8 = 18;
const RECORD_ID_PROBE_LIMIT: u64 = 3600;
const LOG_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f UTC";
const LOG_REPLY_SUCCESS: &str = "SUCCESS";
const LOG_REPLY_FAILED: &str = "FAILED";
const DEFAULT_DATA_DIR: &str = "data";
const DEFAULT_BIND_HOST: &str = "0.0.0.0";
const DEFAULT_BIND_PORT: u16 = 8780;
const PORT_FALLBACK_ATTEMPTS: u16 = 32;

const SUBMIT_APPLY_CELLS: &str = "Apply cell value to cells";
const SUBMIT_APPLY_AREA: &str = "Apply cell value to area";
const SUBMIT_PARAMETERS: &str = "Submit parameters";

const TERRAIN_MAP_IMAGES: [&str; 4] = [
    "Terrain0_map.svg",
    "Terrain1_map.svg",
    "Terrain2_map.svg",
    "Terrain3_map.svg",
];
const SOIL_MAP_IMAGES: [&str; 3] = ["SoilXmap.svg", "SoilYmap.svg", "SoilZmap.svg"];
const TERRAIN_MAP_COUNT: u8 = TERRAIN_MAP_IMAGES.len() as u8;
const SOIL_MAP_COUNT: u8 = SOIL_MAP_IMAGES.len() as u8;

const PLANT_APPEARANCE_NAMES: [&str; 19] = [
    "Pine1",
    "Pine2",
    "Pine3",
    "Pine4",
    "Oak",
    "Bush1",
    "Bush2",
    "Palm1",
    "Palm2",
    "Dogwood",
    "Cypress1",
    "Cypress2",
    "Plumeria",
    "Aspen",
    "Eucalyptus",
    "Fern",
    "Eelgrass",
    "SeaSword",
    "BeachGrass",
];

static IMAGE_ASSETS: Dir<'_> = include_dir!("$CARGO_MANIFEST_DIR/assets");

//  Community Parameters 

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Cell {
    Random,
    Disturbance,
    Gap,
    Species(u8),
}

impl Cell {
    fn code(self) -> char {
        match self {
            Cell::Random => 'R',
            Cell::Disturbance => 'N',
            Cell::Gap => '0',
            Cell::Species(number) => char::from_digit(u32::from(number), 10).unwrap_or('R'),
        }
    }

    fn from_code(code: char) -> Option<Cell> {
        match code {
            'R' => Some(Cell::Random),
            'N' => Some(Cell::Disturbance),
            '0' => Some(Cell::Gap),
            '1'..='5' => Some(Cell::Species(code as u8 - b'0')),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Level {
    Low,
    Mid,
    High,
}

impl Level {
    const ALL: [Level; 3] = [Level::Low, Level::Mid, Level::High];

    fn code(self) -> char {
        match self {
            Level::Low => 'L',
            Level::Mid => 'M',
            Level::High => 'H',
        }
    }

    fn label(self) -> &'static str {
        match self {
            Level::Low => "Low",
            Level::Mid => "Mid",
            Level::High => "High",
        }
    }

    fn from_field(raw: &str) -> Option<Level> {
        match raw {
            "L" => Some(Level::Low),
            "M" => Some(Level::Mid),
            "H" => Some(Level::High),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Influence {
    None,
    Low,
    Mid,
    High,
}

impl Influence {
    const ALL: [Influence; 4] = [
        Influence::None,
        Influence::Low,
        Influence::Mid,
        Influence::High,
    ];

    fn code(self) -> char {
        match self {
            Influence::None => 'N',
            Influence::Low => 'L',
            Influence::Mid => 'M',
            Influence::High => 'H',
        }
    }

    fn label(self) -> &'static str {
        match self {
            Influence::None => "None",
            Influence::Low => "Low",
            Influence::Mid => "Mid",
            Influence::High => "High",
        }
    }

    fn from_field(raw: &str) -> Option<Influence> {
        match raw {
            "N" => Some(Influence::None),
            "L" => Some(Influence::Low),
            "M" => Some(Influence::Mid),
            "H" => Some(Influence::High),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Lifespan {
    Short,
    Mid,
    Long,
}

impl Lifespan {
    const ALL: [Lifespan; 3] = [Lifespan::Short, Lifespan::Mid, Lifespan::Long];

    fn code(self) -> char {
        match self {
            Lifespan::Short => 'S',
            Lifespan::Mid => 'M',
            Lifespan::Long => 'L',
        }
    }

    fn label(self) -> &'static str {
        match self {
            Lifespan::Short => "Short",
            Lifespan::Mid => "Medium",
            Lifespan::Long => "Long",
        }
    }

    fn from_field(raw: &str) -> Option<Lifespan> {
        match raw {
            "S" => Some(Lifespan::Short),
            "M" => Some(Lifespan::Mid),
            "L" => Some(Lifespan::Long),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FactorResponse {
    optimum: Level,
    effect: Influence,
}

impl Default for FactorResponse {
    fn default() -> FactorResponse {
        FactorResponse {
            optimum: Level::Mid,
            effect: Influence::None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct PlantSpec {
    code: u8,
    lifespan: Lifespan,
    altitude: FactorResponse,
    salinity: FactorResponse,
    drainage: FactorResponse,
    fertility: FactorResponse,
}

impl Default for PlantSpec {
    fn default() -> PlantSpec {
        PlantSpec {
            code: 1,
            lifespan: Lifespan::Mid,
            altitude: FactorResponse::default(),
            salinity: FactorResponse::default(),
            drainage: FactorResponse::default(),
            fertility: FactorResponse::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Grid {
    rows: usize,
    cols: usize,
    cells: Vec<Cell>,
}

impl Grid {
    fn filled(rows: usize, cols: usize) -> Grid {
        Grid {
            rows,
            cols,
            cells: vec![Cell::Random; rows * cols],
        }
    }

    fn from_flat(flat: &str, rows: usize, cols: usize) -> Grid {
        let want = rows * cols;
        let mut cells: Vec<Cell> = flat
            .chars()
            .take(want)
            .map(|code| Cell::from_code(code).unwrap_or(Cell::Random))
            .collect();
        cells.resize(want, Cell::Random);
        Grid { rows, cols, cells }
    }

    fn flatten(&self) -> String {
        self.cells.iter().map(|cell| cell.code()).collect()
    }

    fn cell_count(&self) -> usize {
        self.rows * self.cols
    }

    fn get_linear(&self, index: usize) -> Cell {
        self.cells.get(index).copied().unwrap_or(Cell::Random)
    }

    fn set_linear(&mut self, index: usize, value: Cell) {
        if let Some(cell) = self.cells.get_mut(index) {
            *cell = value;
        }
    }

    // The editor lays the grid out with cell 0 in the northwest corner; the
    // region module expects cell 0 in the southwest corner. Row order is
    // reversed at the storage boundary and nowhere else.
    fn flipped_rows(&self) -> Grid {
        let mut cells = Vec::with_capacity(self.cells.len());
        for row in (0..self.rows).rev() {
            let start = row * self.cols;
            cells.extend_from_slice(&self.cells[start..start + self.cols]);
        }
        Grid {
            rows: self.rows,
            cols: self.cols,
            cells,
        }
    }
}

fn parse_selection(raw: &str, cell_count: usize) -> Vec<usize> {
    let mut selection = Vec::new();
    for piece in raw.split(',') {
        if selection.len() == MAX_SELECTED_CELLS {
            break;
        }
        let Ok(index) = piece.trim().parse::<usize>() else {
            continue;
        };
        if index < cell_count && !selection.contains(&index) {
            selection.push(index);
        }
    }
    selection
}

fn selection_field(selection: &[usize]) -> String {
    selection
        .iter()
        .map(|index| index.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn toggle_selection(selection: &mut Vec<usize>, clicked: usize) {
    if let Some(position) = selection.iter().position(|&index| index == clicked) {
        selection.remove(position);
    } else if selection.len() < MAX_SELECTED_CELLS {
        // A click on a third distinct cell is dropped; the selection holds
        // at most one target cell or two area corners.
        selection.push(clicked);
    }
}

fn area_between(corner_a: usize, corner_b: usize, cols: usize) -> Vec<usize> {
    if cols == 0 {
        return Vec::new();
    }
    let (row_a, col_a) = (corner_a / cols, corner_a % cols);
    let (row_b, col_b) = (corner_b / cols, corner_b % cols);
    let mut indices = Vec::new();
    for row in row_a.min(row_b)..=row_a.max(row_b) {
        for col in col_a.min(col_b)..=col_a.max(col_b) {
            indices.push(row * cols + col);
        }
    }
    indices
}

type FieldMap = HashMap<String, String>;

fn field<'a>(fields: &'a FieldMap, name: &str) -> &'a str {
    fields.get(name).map(String::as_str).unwrap_or("")
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EditorAction {
    Click(usize),
    ApplyToCells,
    ApplyToArea,
    Submit,
    Redraw,
}

fn editor_action(fields: &FieldMap) -> EditorAction {
    match field(fields, "submit_value") {
        SUBMIT_APPLY_CELLS => EditorAction::ApplyToCells,
        SUBMIT_APPLY_AREA => EditorAction::ApplyToArea,
        SUBMIT_PARAMETERS => EditorAction::Submit,
        _ => match field(fields, "clicked").parse::<usize>() {
            Ok(index) => EditorAction::Click(index),
            Err(_) => EditorAction::Redraw,
        },
    }
}

#[derive(Clone, Debug, PartialEq)]
struct CommunityForm {
    disturbance_only: bool,
    natural: bool,
    terrain: u8,
    salinity: u8,
    drainage: u8,
    fertility: u8,
    plants: [PlantSpec; SPECIES_COUNT],
    replacement: [[Level; REPLACEMENT_COLS]; SPECIES_COUNT],
    ongoing_disturbance: Influence,
    grid: Grid,
    selection: Vec<usize>,
}

impl Default for CommunityForm {
    fn default() -> CommunityForm {
        CommunityForm {
            disturbance_only: false,
            natural: true,
            terrain: 0,
            salinity: 0,
            drainage: 1,
            fertility: 0,
            plants: [PlantSpec::default(); SPECIES_COUNT],
            replacement: [[Level::Mid; REPLACEMENT_COLS]; SPECIES_COUNT],
            ongoing_disturbance: Influence::None,
            grid: Grid::filled(GRID_ROWS, GRID_COLS),
            selection: Vec::new(),
        }
    }
}

impl CommunityForm {
    fn from_page_one(fields: &FieldMap) -> Result<CommunityForm, String> {
        let mut form = CommunityForm::default();
        form.natural = field(fields, "natural") == "on";
        form.terrain = parse_map_choice(fields, "terrain", TERRAIN_MAP_COUNT)?;
        form.salinity = parse_map_choice(fields, "salinity", SOIL_MAP_COUNT)?;
        form.drainage = parse_map_choice(fields, "drainage", SOIL_MAP_COUNT)?;
        form.fertility = parse_map_choice(fields, "fertility", SOIL_MAP_COUNT)?;
        Ok(form)
    }

    fn from_fields(fields: &FieldMap) -> Result<CommunityForm, String> {
        let mut form = CommunityForm::default();
        form.disturbance_only = match field(fields, "disturbance_only") {
            "0" => false,
            "1" => true,
            other => {
                return Err(format!("disturbance_only must be 0 or 1; got '{other}'"));
            }
        };
        form.terrain = parse_map_choice(fields, "terrain", TERRAIN_MAP_COUNT)?;
        form.grid = Grid::from_flat(field(fields, "starting_matrix"), GRID_ROWS, GRID_COLS);
        form.selection = parse_selection(field(fields, "selected"), form.grid.cell_count());
        form.ongoing_disturbance = match field(fields, "ongoing_disturbance") {
            "" => Influence::None,
            raw => Influence::from_field(raw).ok_or_else(|| {
                format!("ongoing_disturbance must be one of N, L, M or H; got '{raw}'")
            })?,
        };
        if form.disturbance_only {
            return Ok(form);
        }
        form.natural = field(fields, "natural") == "on";
        form.salinity = parse_map_choice(fields, "salinity", SOIL_MAP_COUNT)?;
        form.drainage = parse_map_choice(fields, "drainage", SOIL_MAP_COUNT)?;
        form.fertility = parse_map_choice(fields, "fertility", SOIL_MAP_COUNT)?;
        for slot in 0..SPECIES_COUNT {
            let number = slot + 1;
            form.plants[slot] = PlantSpec {
                code: parse_plant_code(fields, &format!("plant_code_{number}"))?,
                lifespan: parse_lifespan(fields, &format!("lifespan_{number}"))?,
                altitude: parse_factor(fields, "altitude", number)?,
                salinity: parse_factor(fields, "salinity", number)?,
                drainage: parse_factor(fields, "drainage", number)?,
                fertility: parse_factor(fields, "fertility", number)?,
            };
        }
        for row in 0..SPECIES_COUNT {
            for col in 0..REPLACEMENT_COLS {
                let name = format!("replace_{}_{}", row + 1, col);
                form.replacement[row][col] = parse_level(fields, &name)?;
            }
        }
        Ok(form)
    }
}

fn parse_map_choice(fields: &FieldMap, name: &str, limit: u8) -> Result<u8, String> {
    let raw = field(fields, name);
    match raw.parse::<u8>() {
        Ok(value) if value < limit => Ok(value),
        _ => Err(format!(
            "{name} must be a whole number below {limit}; got '{raw}'"
        )),
    }
}

fn parse_plant_code(fields: &FieldMap, name: &str) -> Result<u8, String> {
    let raw = field(fields, name);
    let limit = PLANT_APPEARANCE_NAMES.len() as u8;
    match raw.parse::<u8>() {
        Ok(code) if (1..=limit).contains(&code) => Ok(code),
        _ => Err(format!(
            "{name} must be a plant appearance code from 1 to {limit}; got '{raw}'"
        )),
    }
}

fn parse_level(fields: &FieldMap, name: &str) -> Result<Level, String> {
    let raw = field(fields, name);
    Level::from_field(raw).ok_or_else(|| format!("{name} must be one of L, M or H; got '{raw}'"))
}

fn parse_lifespan(fields: &FieldMap, name: &str) -> Result<Lifespan, String> {
    let raw = field(fields, name);
    Lifespan::from_field(raw).ok_or_else(|| format!("{name} must be one of S, M or L; got '{raw}'"))
}

fn parse_factor(fields: &FieldMap, stem: &str, number: usize) -> Result<FactorResponse, String> {
    let optimum = parse_level(fields, &format!("{stem}_optimum_{number}"))?;
    let effect_name = format!("{stem}_effect_{number}");
    let effect_raw = field(fields, &effect_name);
    let effect = Influence::from_field(effect_raw)
        .ok_or_else(|| format!("{effect_name} must be one of N, L, M or H; got '{effect_raw}'"))?;
    Ok(FactorResponse { optimum, effect })
}

fn parse_cell_value(fields: &FieldMap) -> Result<Cell, String> {
    let raw = field(fields, "cell_value");
    let mut chars = raw.chars();
    match (chars.next().and_then(Cell::from_code), chars.next()) {
        (Some(value), None) => Ok(value),
        _ => Err(format!(
            "cell_value must be one of R, N, 0, 1, 2, 3, 4 or 5; got '{raw}'"
        )),
    }
}

fn apply_editor_action(
    form: &mut CommunityForm,
    action: EditorAction,
    fields: &FieldMap,
) -> Result<(), String> {
    match action {
        EditorAction::Click(index) => {
            if index < form.grid.cell_count() {
                toggle_selection(&mut form.selection, index);
            }
            Ok(())
        }
        EditorAction::ApplyToCells => {
            let value = parse_cell_value(fields)?;
            for &index in &form.selection {
                form.grid.set_linear(index, value);
            }
            form.selection.clear();
            Ok(())
        }
        EditorAction::ApplyToArea => {
            let value = parse_cell_value(fields)?;
            if let [corner_a, corner_b] = form.selection[..] {
                for index in area_between(corner_a, corner_b, form.grid.cols) {
                    form.grid.set_linear(index, value);
                }
                form.selection.clear();
            }
            Ok(())
        }
        EditorAction::Submit | EditorAction::Redraw => Ok(()),
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct CommunityRecord {
    id: String,
    plant_types: String,
    replacement_1: String,
    replacement_2: String,
    replacement_3: String,
    replacement_4: String,
    replacement_5: String,
    lifespans: String,
    altitude_optimums: String,
    altitude_effects: String,
    salinity_optimums: String,
    salinity_effects: String,
    drainage_optimums: String,
    drainage_effects: String,
    fertility_optimums: String,
    fertility_effects: String,
    disturbance_only: u8,
    natural: u8,
    terrain: u8,
    salinity: u8,
    drainage: u8,
    fertility: u8,
    starting_matrix: String,
    ongoing_disturbance: String,
    // TODO: drop the locked geometry fields once the region module stops
    // requiring them.
    x_size: u32,
    y_size: u32,
    x_location: f32,
    y_location: f32,
    spacing: f32,
}

fn assemble_record(form: &CommunityForm, id: String) -> CommunityRecord {
    let full = !form.disturbance_only;
    let species_codes = |pick: fn(&PlantSpec) -> char| -> String {
        if full {
            join_codes(form.plants.iter().map(pick))
        } else {
            String::new()
        }
    };
    let plant_types = if full {
        form.plants
            .iter()
            .map(|plant| plant.code.to_string())
            .collect::<Vec<_>>()
            .join(",")
    } else {
        String::new()
    };
    let [replacement_1, replacement_2, replacement_3, replacement_4, replacement_5] = if full {
        form.replacement
            .map(|row| join_codes(row.iter().map(|value| value.code())))
    } else {
        std::array::from_fn(|_| String::new())
    };
    CommunityRecord {
        id,
        plant_types,
        replacement_1,
        replacement_2,
        replacement_3,
        replacement_4,
        replacement_5,
        lifespans: species_codes(|plant| plant.lifespan.code()),
        altitude_optimums: species_codes(|plant| plant.altitude.optimum.code()),
        altitude_effects: species_codes(|plant| plant.altitude.effect.code()),
        salinity_optimums: species_codes(|plant| plant.salinity.optimum.code()),
        salinity_effects: species_codes(|plant| plant.salinity.effect.code()),
        drainage_optimums: species_codes(|plant| plant.drainage.optimum.code()),
        drainage_effects: species_codes(|plant| plant.drainage.effect.code()),
        fertility_optimums: species_codes(|plant| plant.fertility.optimum.code()),
        fertility_effects: species_codes(|plant| plant.fertility.effect.code()),
        disturbance_only: u8::from(form.disturbance_only),
        natural: if full { u8::from(form.natural) } else { 0 },
        terrain: form.terrain,
        salinity: if full { form.salinity } else { 0 },
        drainage: if full { form.drainage } else { 0 },
        fertility: if full { form.fertility } else { 0 },
        starting_matrix: form.grid.flipped_rows().flatten(),
        ongoing_disturbance: form.ongoing_disturbance.code().to_string(),
        x_size: GRID_COLS as u32,
        y_size: GRID_ROWS as u32,
        x_location: MATRIX_X_LOCATION,
        y_location: MATRIX_Y_LOCATION,
        spacing: MATRIX_SPACING,
    }
}

fn join_codes(codes: impl Iterator<Item = char>) -> String {
    let mut joined = String::new();
    for code in codes {
        if !joined.is_empty() {
            joined.push(',');
        }
        joined.push(code);
    }
    joined
}

// Element order matches the region module's reader.
fn render_record_markup(record: &CommunityRecord) -> String {
    let mut markup = String::with_capacity(GRID_CELLS + 1536);
    markup.push_str("<record>\n");
    push_element(&mut markup, "id", &record.id);
    push_element(&mut markup, "plant_types", &record.plant_types);
    push_element(&mut markup, "replacement_1", &record.replacement_1);
    push_element(&mut markup, "replacement_2", &record.replacement_2);
    push_element(&mut markup, "replacement_3", &record.replacement_3);
    push_element(&mut markup, "replacement_4", &record.replacement_4);
    push_element(&mut markup, "replacement_5", &record.replacement_5);
    push_element(&mut markup, "lifespans", &record.lifespans);
    push_element(&mut markup, "altitude_optimums", &record.altitude_optimums);
    push_element(&mut markup, "altitude_effects", &record.altitude_effects);
    push_element(&mut markup, "salinity_optimums", &record.salinity_optimums);
    push_element(&mut markup, "salinity_effects", &record.salinity_effects);
    push_element(&mut markup, "drainage_optimums", &record.drainage_optimums);
    push_element(&mut markup, "drainage_effects", &record.drainage_effects);
    push_element(&mut markup, "fertility_optimums", &record.fertility_optimums);
    push_element(&mut markup, "fertility_effects", &record.fertility_effects);
    push_element(
        &mut markup,
        "disturbance_only",
        &record.disturbance_only.to_string(),
    );
    push_element(&mut markup, "natural", &record.natural.to_string());
    push_element(&mut markup, "terrain", &record.terrain.to_string());
    push_element(&mut markup, "salinity", &record.salinity.to_string());
    push_element(&mut markup, "drainage", &record.drainage.to_string());
    push_element(&mut markup, "fertility", &record.fertility.to_string());
    push_element(&mut markup, "starting_matrix", &record.starting_matrix);
    push_element(
        &mut markup,
        "ongoing_disturbance",
        &record.ongoing_disturbance,
    );
    push_element(&mut markup, "x_size", &record.x_size.to_string());
    push_element(&mut markup, "y_size", &record.y_size.to_string());
    push_element(
        &mut markup,
        "x_location",
        &format!("{:.1}", record.x_location),
    );
    push_element(
        &mut markup,
        "y_location",
        &format!("{:.1}", record.y_location),
    );
    push_element(&mut markup, "spacing", &format!("{:.1}", record.spacing));
    markup.push_str("</record>\n");
    markup
}

fn push_element(markup: &mut String, name: &str, value: &str) {
    markup.push_str(&format!("  <{name}>{value}</{name}>\n"));
}

//  Record And Log Store 

#[derive(Debug, Error)]
enum StoreError {
    #[error("no community record found for id '{id}'")]
    RecordNotFound { id: String },
    #[error("no free record id in the hour after {base}")]
    IdSpaceExhausted { base: u64 },
    #[error("failed {action} {path:?}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed {action} {path:?}: {source}")]
    Encoding {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct LogEntry {
    sim_id: String,
    region_tag: String,
    data: String,
    created_at: String,
}

fn log_payload_is_valid(sim_id: &str, data: &str) -> bool {
    sim_id.chars().count() == SIM_ID_LENGTH && data.split(',').count() == LOG_DATA_FIELDS
}

struct DataStore {
    root: PathBuf,
    log_sequence: AtomicU64,
}

impl DataStore {
    fn open(root: PathBuf) -> Result<DataStore, StoreError> {
        let store = DataStore {
            root,
            log_sequence: AtomicU64::new(0),
        };
        for dir in [store.records_dir(), store.logs_dir()] {
            fs::create_dir_all(&dir).map_err(|err| StoreError::Io {
                action: "creating store directory",
                path: dir.clone(),
                source: err,
            })?;
        }
        Ok(store)
    }

    fn records_dir(&self) -> PathBuf {
        self.root.join("records")
    }

    fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.records_dir().join(format!("{id}.json"))
    }

    fn create_record(&self, form: &CommunityForm) -> Result<CommunityRecord, StoreError> {
        let base = Utc::now().timestamp().max(0) as u64;
        self.create_record_from(form, base)
    }

    // Record ids are second timestamps; a same-second submission probes
    // forward to the next free second instead of overwriting.
    fn create_record_from(
        &self,
        form: &CommunityForm,
        base_seconds: u64,
    ) -> Result<CommunityRecord, StoreError> {
        for offset in 0..RECORD_ID_PROBE_LIMIT {
            let id = (base_seconds + offset).to_string();
            let record = assemble_record(form, id);
            let path = self.record_path(&record.id);
            let payload =
                serde_json::to_vec_pretty(&record).map_err(|err| StoreError::Encoding {
                    action: "serializing record for",
                    path: path.clone(),
                    source: err,
                })?;
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(mut file) => {
                    io::Write::write_all(&mut file, &payload).map_err(|err| StoreError::Io {
                        action: "writing record",
                        path: path.clone(),
                        source: err,
                    })?;
                    return Ok(record);
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(err) => {
                    return Err(StoreError::Io {
                        action: "creating record",
                        path,
                        source: err,
                    });
                }
            }
        }
        Err(StoreError::IdSpaceExhausted { base: base_seconds })
    }

    fn fetch_record(&self, id: &str) -> Result<CommunityRecord, StoreError> {
        // Ids are decimal strings; anything else cannot name a stored record
        // and must not reach the filesystem as a path.
        if id.is_empty() || !id.bytes().all(|byte| byte.is_ascii_digit()) {
            return Err(StoreError::RecordNotFound { id: id.to_string() });
        }
        let path = self.record_path(id);
        if !path.exists() {
            return Err(StoreError::RecordNotFound { id: id.to_string() });
        }
        let payload = fs::read(&path).map_err(|err| StoreError::Io {
            action: "reading record",
            path: path.clone(),
            source: err,
        })?;
        serde_json::from_slice(&payload).map_err(|err| StoreError::Encoding {
            action: "parsing record",
            path,
            source: err,
        })
    }

    fn append_log(&self, sim_id: &str, region_tag: &str, data: &str) -> Result<(), StoreError> {
        let now = Utc::now();
        let sequence = self.log_sequence.fetch_add(1, Ordering::Relaxed);
        let name = format!("{:013}-{sequence:06}.json", now.timestamp_millis().max(0));
        let path = self.logs_dir().join(name);
        let entry = LogEntry {
            sim_id: sim_id.to_string(),
            region_tag: region_tag.to_string(),
            data: data.to_string(),
            created_at: now.format(LOG_TIMESTAMP_FORMAT).to_string(),
        };
        let payload = serde_json::to_vec_pretty(&entry).map_err(|err| StoreError::Encoding {
            action: "serializing log entry for",
            path: path.clone(),
            source: err,
        })?;
        fs::write(&path, payload).map_err(|err| StoreError::Io {
            action: "writing log entry",
            path,
            source: err,
        })
    }

    fn query_logs(&self, sim_id: &str, region_tag: &str) -> Result<LogQuery, StoreError> {
        let paths = self.sorted_log_paths()?;
        Ok(LogQuery {
            paths: paths.into_iter(),
            sim_id: sim_id.to_string(),
            region_tag: region_tag.to_string(),
        })
    }

    fn delete_logs(&self, sim_id: &str, region_tag: &str) -> Result<usize, StoreError> {
        let mut removed = 0;
        for path in self.sorted_log_paths()? {
            let entry = match read_log_file(&path) {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("skipping unreadable log entry during delete: {err}");
                    continue;
                }
            };
            if entry.sim_id == sim_id && entry.region_tag == region_tag {
                fs::remove_file(&path).map_err(|err| StoreError::Io {
                    action: "deleting log entry",
                    path: path.clone(),
                    source: err,
                })?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    // File names are zero-padded insert timestamps, so a plain path sort
    // yields insert order.
    fn sorted_log_paths(&self) -> Result<Vec<PathBuf>, StoreError> {
        let dir = self.logs_dir();
        let entries = fs::read_dir(&dir).map_err(|err| StoreError::Io {
            action: "listing log directory",
            path: dir.clone(),
            source: err,
        })?;
        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| StoreError::Io {
                action: "listing log directory",
                path: dir.clone(),
                source: err,
            })?;
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }
}

struct LogQuery {
    paths: std::vec::IntoIter<PathBuf>,
    sim_id: String,
    region_tag: String,
}

impl Iterator for LogQuery {
    type Item = Result<LogEntry, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let path = self.paths.next()?;
            match read_log_file(&path) {
                Ok(entry) if entry.sim_id == self.sim_id && entry.region_tag == self.region_tag => {
                    return Some(Ok(entry));
                }
                Ok(_) => {}
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

fn read_log_file(path: &FsPath) -> Result<LogEntry, StoreError> {
    let payload = fs::read(path).map_err(|err| StoreError::Io {
        action: "reading log entry",
        path: path.to_path_buf(),
        source: err,
    })?;
    serde_json::from_slice(&payload).map_err(|err| StoreError::Encoding {
        action: "parsing log entry",
        path: path.to_path_buf(),
        source: err,
    })
}

//  Web Service 

#[derive(Clone)]
struct AppState {
    store: Arc<DataStore>,
}

impl AppState {
    fn new(store: DataStore) -> AppState {
        AppState {
            store: Arc::new(store),
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_target(false)
        .compact()
        .init();

    let data_dir = resolve_data_dir();
    let store = match DataStore::open(data_dir.clone()) {
        Ok(store) => store,
        Err(err) => {
            error!("failed opening data store: {err}");
            return;
        }
    };
    info!(
        "community records and simulation logs stored under '{}'",
        data_dir.display()
    );
    let state = AppState::new(store);

    let app = Router::new()
        .route("/", get(landing_handler))
        .route("/parametersform1", get(parameters_page_one_handler))
        .route("/parametersform2", post(parameters_page_two_handler))
        .route("/parametersform3", post(parameters_page_three_handler))
        .route("/selectmap", get(select_map_handler))
        .route("/plants", get(plant_pictures_handler))
        .route("/data", get(record_data_handler))
        .route("/addlog", get(add_log_handler))
        .route("/deletelog", get(delete_log_handler))
        .route("/log", get(log_form_handler).post(log_form_handler))
        .route(
            "/getlog",
            get(get_log_query_handler).post(get_log_form_handler),
        )
        .route("/images/{*path}", get(image_handler))
        .route("/health", get(health))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state);

    let bind_host = DEFAULT_BIND_HOST;
    let bind_port = resolve_bind_port();
    let (listener, addr) = match bind_listener(bind_host, bind_port).await {
        Ok(bound) => bound,
        Err(message) => {
            error!("{message}");
            return;
        }
    };
    info!("vpcsim-web listening on http://{addr}");
    if let Err(err) = axum::serve(listener, app).await {
        error!("server exited unexpectedly: {err}");
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn landing_handler() -> Html<String> {
    Html(landing_page())
}

async fn parameters_page_one_handler() -> Html<String> {
    Html(parameters_page_one())
}

async fn parameters_page_two_handler(Form(fields): Form<FieldMap>) -> Html<String> {
    match CommunityForm::from_page_one(&fields) {
        Ok(form) => Html(parameters_page_two(&form)),
        Err(message) => Html(error_page(&message)),
    }
}

async fn parameters_page_three_handler(
    State(state): State<AppState>,
    Form(fields): Form<FieldMap>,
) -> Result<Html<String>, (StatusCode, String)> {
    let mut form = match CommunityForm::from_fields(&fields) {
        Ok(form) => form,
        Err(message) => return Ok(Html(error_page(&message))),
    };
    match editor_action(&fields) {
        EditorAction::Submit => {
            let record = state.store.create_record(&form).map_err(|err| {
                error!("failed storing community record: {err}");
                internal_err(err.to_string())
            })?;
            info!("stored community record {}", record.id);
            Ok(Html(success_page(&record.id)))
        }
        action => {
            if let Err(message) = apply_editor_action(&mut form, action, &fields) {
                return Ok(Html(error_page(&message)));
            }
            Ok(Html(matrix_editor_page(&form)))
        }
    }
}

async fn select_map_handler() -> Html<String> {
    Html(select_map_page())
}

async fn plant_pictures_handler() -> Html<String> {
    Html(plant_pictures_page())
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
struct DataQuery {
    id: String,
}

async fn record_data_handler(
    State(state): State<AppState>,
    Query(query): Query<DataQuery>,
) -> Result<Response, (StatusCode, String)> {
    match state.store.fetch_record(&query.id) {
        Ok(record) => Ok((
            [(header::CONTENT_TYPE, "text/xml; charset=utf-8")],
            render_record_markup(&record),
        )
            .into_response()),
        Err(err @ StoreError::RecordNotFound { .. }) => {
            Err((StatusCode::NOT_FOUND, err.to_string()))
        }
        Err(err) => {
            error!("failed loading community record: {err}");
            Err(internal_err(err.to_string()))
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
struct LogLookup {
    sim_id: String,
    region_tag: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
struct AddLogQuery {
    sim_id: String,
    region_tag: String,
    data: String,
}

async fn add_log_handler(
    State(state): State<AppState>,
    Query(query): Query<AddLogQuery>,
) -> &'static str {
    if !log_payload_is_valid(&query.sim_id, &query.data) {
        warn!(
            "rejected log entry from sim '{}': id or data shape is wrong",
            query.sim_id
        );
        return LOG_REPLY_FAILED;
    }
    match state
        .store
        .append_log(&query.sim_id, &query.region_tag, &query.data)
    {
        Ok(()) => LOG_REPLY_SUCCESS,
        Err(err) => {
            error!("failed appending log entry: {err}");
            LOG_REPLY_FAILED
        }
    }
}

async fn delete_log_handler(
    State(state): State<AppState>,
    Query(query): Query<LogLookup>,
) -> Result<&'static str, (StatusCode, String)> {
    let removed = state
        .store
        .delete_logs(&query.sim_id, &query.region_tag)
        .map_err(|err| {
            error!("failed deleting log entries: {err}");
            internal_err(err.to_string())
        })?;
    info!(
        "deleted {removed} log entries for sim '{}' in '{}'",
        query.sim_id, query.region_tag
    );
    Ok(LOG_REPLY_SUCCESS)
}

async fn log_form_handler() -> Html<String> {
    Html(log_form_page())
}

async fn get_log_query_handler(
    State(state): State<AppState>,
    Query(lookup): Query<LogLookup>,
) -> Result<Html<String>, (StatusCode, String)> {
    render_log_report(&state, lookup)
}

async fn get_log_form_handler(
    State(state): State<AppState>,
    Form(lookup): Form<LogLookup>,
) -> Result<Html<String>, (StatusCode, String)> {
    render_log_report(&state, lookup)
}

fn render_log_report(
    state: &AppState,
    lookup: LogLookup,
) -> Result<Html<String>, (StatusCode, String)> {
    let query = state
        .store
        .query_logs(&lookup.sim_id, &lookup.region_tag)
        .map_err(|err| {
            error!("failed listing log entries: {err}");
            internal_err(err.to_string())
        })?;
    let mut entries = Vec::new();
    for entry in query {
        entries.push(entry.map_err(|err| {
            error!("failed reading log entry: {err}");
            internal_err(err.to_string())
        })?);
    }
    Ok(Html(log_records_page(&lookup, &entries)))
}

async fn image_handler(Path(path): Path<String>) -> Response {
    match image_asset_response(&path) {
        Some(response) => response,
        None => (StatusCode::NOT_FOUND, format!("no image named '{path}'")).into_response(),
    }
}

fn image_asset_response(path: &str) -> Option<Response> {
    let file = IMAGE_ASSETS.get_file(path)?;
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    let content_type = HeaderValue::from_str(mime.as_ref()).ok()?;
    let mut response = Response::new(Body::from(file.contents().to_vec()));
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, content_type);
    Some(response)
}

//  Html Pages 

fn page_shell(body: &str) -> String {
    format!("<html><body>{body}</body></html>")
}

fn instructions_html() -> &'static str {
    concat!(
        "<p>This form generates virtual plants in a simulated plant community ",
        "growing in the 3D virtual world, ScienceSim. Changes made here will ",
        "not take effect until they are enabled there.<br></p><hr>"
    )
}

fn landing_page() -> String {
    let mut body = String::new();
    body.push_str(concat!(
        "<p><b>Welcome to the virtual plant community simulations (vpcSim) ",
        "web application.</b></p>",
        "From this page you can:<ul>",
        "<li>change the parameters controlling a virtual plant community,</li>",
        "<li>change only the disturbance pattern, or </li>",
        "<li>view data logged by the plant community.</li>",
        "</ul><hr>"
    ));
    body.push_str(concat!(
        r#"<form action="/parametersform1" method="get">"#,
        r#"<input type="submit" value="Change all parameters" style="width: 175px">"#,
        "</form>",
        r#"<form action="/selectmap" method="get">"#,
        r#"<input type="submit" value="Change disturbance only" style="width: 175px">"#,
        "</form>",
        r#"<form action="/log" method="get">"#,
        r#"<input type="submit" value="View log data" style="width: 175px">"#,
        "</form>"
    ));
    page_shell(&body)
}

fn parameters_page_one() -> String {
    let defaults = CommunityForm::default();
    let natural_checked = if defaults.natural { " checked" } else { "" };
    let mut body = String::new();
    body.push_str(instructions_html());
    body.push_str(r#"<form action="/parametersform2" method="post">"#);
    body.push_str("<p><b>Terrain map:</b> Select the terrain<br>");
    body.push_str(&map_radio_row(
        "terrain",
        &TERRAIN_MAP_IMAGES,
        defaults.terrain,
    ));
    body.push_str("</p>");
    body.push_str(&format!(
        concat!(
            "<p><b>Community appearance:</b> Specify whether the community should ",
            "appear natural (plants randomly placed near the matrix coordinates) ",
            "or crop-like (plants placed exactly on the matrix coordinates). ",
            "This does not effect the simulation results - only the appearance.",
            "<br>Natural: <input name=\"natural\"{} type=\"checkbox\"></p>"
        ),
        natural_checked
    ));
    body.push_str(concat!(
        "<p><b>Soil salinity map:</b> Select the pattern of soil salinity ",
        "on the landscape<br>"
    ));
    body.push_str(&map_radio_row(
        "salinity",
        &SOIL_MAP_IMAGES,
        defaults.salinity,
    ));
    body.push_str("</p>");
    body.push_str(concat!(
        "<p><b>Soil drainage map:</b> Select the pattern of soil drainage ",
        "on the landscape<br>"
    ));
    body.push_str(&map_radio_row(
        "drainage",
        &SOIL_MAP_IMAGES,
        defaults.drainage,
    ));
    body.push_str("</p>");
    body.push_str(concat!(
        "<p><b>Soil fertility map:</b> Select the pattern of soil fertility ",
        "on the landscape<br>"
    ));
    body.push_str(&map_radio_row(
        "fertility",
        &SOIL_MAP_IMAGES,
        defaults.fertility,
    ));
    body.push_str("</p>");
    body.push_str(r#"<input type="submit" value="Continue...">"#);
    body.push_str("</form>");
    page_shell(&body)
}

fn map_radio_row(name: &str, image_stems: &[&str], checked: u8) -> String {
    let mut row = String::new();
    for (value, stem) in image_stems.iter().enumerate() {
        let marker = if value as u8 == checked { " checked" } else { "" };
        row.push_str(&format!(
            concat!(
                r#"<input type="radio" name="{name}" value="{value}"{marker}>{value} "#,
                r#"<img src="/images/{stem}" height="100" width="100"> &nbsp;&nbsp; "#
            ),
            name = name,
            value = value,
            marker = marker,
            stem = stem
        ));
    }
    row
}

fn parameters_page_two(form: &CommunityForm) -> String {
    let mut body = String::new();
    body.push_str(instructions_html());
    body.push_str(r#"<form action="/parametersform3" method="post">"#);
    for (slot, plant) in form.plants.iter().enumerate() {
        body.push_str(&plant_settings_block(slot + 1, plant));
    }
    body.push_str(concat!(
        "<p><b>Replacement Matrix</b><br>",
        "Specify the probability that an individual plant type A will be ",
        "replaced by plant type B<br>when surrounded on all sides.</p>",
        r#"<table border="0"><tbody>"#,
        "<tr><td></td><td></td><td></td><td></td><td></td><th><b>A</b></th></tr>",
        "<tr><th></th><th></th><th>0 (gap)</th><th>1</th><th>2</th><th>3</th>",
        "<th>4</th><th>5</th></tr>"
    ));
    for (row_index, row) in form.replacement.iter().enumerate() {
        let species = row_index + 1;
        if species == 3 {
            body.push_str(&format!(
                "<tr><td><b> B &nbsp;&nbsp;&nbsp;</b></td><th> {species} </th>"
            ));
        } else {
            body.push_str(&format!("<tr><td></td><th> {species} </th>"));
        }
        for (col, value) in row.iter().enumerate() {
            body.push_str(&format!(
                "<td>{}</td>",
                level_select(&format!("replace_{species}_{col}"), *value)
            ));
        }
        body.push_str("</tr>");
    }
    body.push_str("</tbody></table>");
    body.push_str(&hidden_inputs(&page_one_field_pairs(form)));
    body.push_str(r#"<br><input type="submit" value="Continue...">"#);
    body.push_str("</form>");
    page_shell(&body)
}

fn plant_settings_block(number: usize, plant: &PlantSpec) -> String {
    format!(
        concat!(
            "<p><b>Plant type {number}: </b><br>&nbsp;&nbsp;",
            "<b>Appearance: </b>{appearance} ",
            r#"<a href="/plants" target="_blank">View examples</a><br>&nbsp;&nbsp;"#,
            "<b>Lifespan: </b>{lifespan}<br>&nbsp;&nbsp;",
            "{altitude}<br>&nbsp;&nbsp;",
            "{salinity}<br>&nbsp;&nbsp;",
            "{drainage}<br>&nbsp;&nbsp;",
            "{fertility}</p>"
        ),
        number = number,
        appearance = appearance_select(&format!("plant_code_{number}"), plant.code),
        lifespan = lifespan_select(&format!("lifespan_{number}"), plant.lifespan),
        altitude = factor_controls("Altitude", "altitude", number, &plant.altitude),
        salinity = factor_controls("Salinity", "salinity", number, &plant.salinity),
        drainage = factor_controls("Drainage", "drainage", number, &plant.drainage),
        fertility = factor_controls("Fertility", "fertility", number, &plant.fertility),
    )
}

fn factor_controls(label: &str, stem: &str, number: usize, response: &FactorResponse) -> String {
    format!(
        "<b>{label}- </b> Optimum: {} &nbsp;&nbsp;&nbsp;&nbsp; Effect: {}",
        level_select(&format!("{stem}_optimum_{number}"), response.optimum),
        influence_select(&format!("{stem}_effect_{number}"), response.effect),
    )
}

fn matrix_editor_page(form: &CommunityForm) -> String {
    let mut body = String::new();
    body.push_str(r#"<form action="/parametersform3" method="post">"#);
    body.push_str(&format!(
        "<p><b>Ongoing disturbance rate: </b>{}</p>",
        influence_select("ongoing_disturbance", form.ongoing_disturbance)
    ));
    body.push_str(concat!(
        "<b>Click on the map to select one or more cells to set the ",
        "starting status:</b><br>"
    ));
    body.push_str(&format!(
        r#"<table style="background-image: url('/images/Terrain{}_map.svg')"><tbody><tr><td>"#,
        form.terrain
    ));
    for row in 0..form.grid.rows {
        for col in 0..form.grid.cols {
            let index = row * form.grid.cols + col;
            let stem = if form.selection.contains(&index) {
                "selected".to_string()
            } else {
                form.grid.get_linear(index).code().to_string()
            };
            body.push_str(&format!(
                concat!(
                    r#"<button type="submit" name="clicked" value="{index}" "#,
                    r#"style="padding: 0; border: 0; background: none">"#,
                    r#"<img src="/images/{stem}button.svg" width="10" height="10">"#,
                    "</button>"
                ),
                index = index,
                stem = stem
            ));
        }
        if row + 1 != form.grid.rows {
            body.push_str("<br>");
        }
    }
    body.push_str("</td></tr></tbody></table>");
    if form.selection.is_empty() {
        body.push_str("<br>");
    } else {
        body.push_str(&format!(
            "<b>Cell value:</b> {} ",
            cell_value_select(form.disturbance_only)
        ));
        body.push_str(&format!(
            r#"<input type="submit" name="submit_value" value="{SUBMIT_APPLY_CELLS}">"#
        ));
        if form.selection.len() == 2 {
            body.push_str(&format!(
                r#" <input type="submit" name="submit_value" value="{SUBMIT_APPLY_AREA}">"#
            ));
        }
    }
    body.push_str(&format!(
        r#"<br><br><input type="submit" name="submit_value" value="{SUBMIT_PARAMETERS}">"#
    ));
    body.push_str(&hidden_inputs(&state_field_pairs(form)));
    body.push_str("</form>");
    page_shell(&body)
}

fn cell_value_select(disturbance_only: bool) -> String {
    let options: &[(Cell, &str)] = if disturbance_only {
        &[
            (Cell::Random, "Not disturbed"),
            (Cell::Disturbance, "Permanent disturbance"),
        ]
    } else {
        &[
            (Cell::Random, "Random plant type"),
            (Cell::Disturbance, "Permanent disturbance"),
            (Cell::Gap, "Gap (temporary)"),
            (Cell::Species(1), "Plant type 1"),
            (Cell::Species(2), "Plant type 2"),
            (Cell::Species(3), "Plant type 3"),
            (Cell::Species(4), "Plant type 4"),
            (Cell::Species(5), "Plant type 5"),
        ]
    };
    let mut control = String::from(r#"<select name="cell_value">"#);
    for (value, label) in options {
        control.push_str(&option_tag(&value.code().to_string(), label, false));
    }
    control.push_str("</select>");
    control
}

fn select_map_page() -> String {
    let mut body = String::new();
    body.push_str(r#"<form action="/parametersform3" method="post">"#);
    body.push_str("<p><b>Select the terrain used in the region:</b><br>");
    body.push_str(&map_radio_row("terrain", &TERRAIN_MAP_IMAGES, 0));
    body.push_str("</p>");
    body.push_str(&hidden_inputs(&[(
        "disturbance_only".to_string(),
        "1".to_string(),
    )]));
    body.push_str(r#"<input type="submit" value="Continue...">"#);
    body.push_str("</form>");
    page_shell(&body)
}

fn success_page(id: &str) -> String {
    page_shell(&format!(
        concat!(
            r#"<p><span style="font-size: larger;">The community is ready to load.</span></p>"#,
            "<p>To generate the community:</p>",
            "<ul>",
            "<li>Move your avatar into the region where you would like it to load.</li>",
            "<li>Paste the following text into the chat window:</li>",
            "</ul>",
            r#"<blockquote style="font-size: larger;"><b>/{channel} {id}</b></blockquote>"#
        ),
        channel = LOAD_CHAT_CHANNEL,
        id = id
    ))
}

fn plant_pictures_page() -> String {
    let mut body = String::from(r#"<table border="0"><tbody>"#);
    for chunk in PLANT_APPEARANCE_NAMES.chunks(5) {
        body.push_str("<tr>");
        for name in chunk {
            body.push_str(&format!("<th>{name}</th>"));
        }
        body.push_str("</tr><tr>");
        for name in chunk {
            body.push_str(&format!(
                r#"<td><img src="/images/{name}.svg" height="100" width="125"></td>"#
            ));
        }
        body.push_str("</tr><tr><td><br></td></tr>");
    }
    body.push_str("</tbody></table>");
    page_shell(&body)
}

fn log_form_page() -> String {
    page_shell(concat!(
        r#"<form action="/getlog" method="post">"#,
        "<p><b>View log records for a simulation on a particular region: </b><br>",
        r#"Simulation ID: <input type="text" name="sim_id" maxlength="10" size="11">"#,
        " &nbsp;&nbsp;&nbsp;&nbsp; ",
        r#"Region tag: <input type="text" name="region_tag" maxlength="20" size="21">"#,
        "<br><br>",
        r#"<input type="submit" value="Get log records">"#,
        "</p></form>"
    ))
}

fn log_records_page(lookup: &LogLookup, entries: &[LogEntry]) -> String {
    let sim_id = escape_html(&lookup.sim_id);
    let region_tag = escape_html(&lookup.region_tag);
    if entries.is_empty() {
        return page_shell(&format!("No records for {sim_id} in {region_tag}."));
    }
    let mut body = format!(
        concat!(
            "<p><b>Records for {sim_id} in {region_tag}:</b></p>",
            "<b>Simulation step, Gap count, Species1 count, Species2 count, ",
            "Species3 count, Species4 count, Species5 count</b><br>"
        ),
        sim_id = sim_id,
        region_tag = region_tag
    );
    for entry in entries {
        body.push_str(&format!(
            "{},{}<br>",
            escape_html(&entry.data),
            entry.created_at
        ));
    }
    page_shell(&body)
}

fn error_page(message: &str) -> String {
    page_shell(&format!("<p>{}</p>", escape_html(message)))
}

fn level_select(name: &str, selected: Level) -> String {
    let mut control = format!(r#"<select name="{name}">"#);
    for level in Level::ALL {
        control.push_str(&option_tag(
            &level.code().to_string(),
            level.label(),
            level == selected,
        ));
    }
    control.push_str("</select>");
    control
}

fn influence_select(name: &str, selected: Influence) -> String {
    let mut control = format!(r#"<select name="{name}">"#);
    for influence in Influence::ALL {
        control.push_str(&option_tag(
            &influence.code().to_string(),
            influence.label(),
            influence == selected,
        ));
    }
    control.push_str("</select>");
    control
}

fn lifespan_select(name: &str, selected: Lifespan) -> String {
    let mut control = format!(r#"<select name="{name}">"#);
    for lifespan in Lifespan::ALL {
        control.push_str(&option_tag(
            &lifespan.code().to_string(),
            lifespan.label(),
            lifespan == selected,
        ));
    }
    control.push_str("</select>");
    control
}

fn appearance_select(name: &str, selected: u8) -> String {
    let mut control = format!(r#"<select name="{name}">"#);
    for (index, label) in PLANT_APPEARANCE_NAMES.iter().enumerate() {
        let code = index as u8 + 1;
        control.push_str(&option_tag(&code.to_string(), label, code == selected));
    }
    control.push_str("</select>");
    control
}

fn option_tag(value: &str, label: &str, selected: bool) -> String {
    let marker = if selected { " selected" } else { "" };
    format!(r#"<option{marker} value="{value}">{label}</option>"#)
}

fn hidden_inputs(pairs: &[(String, String)]) -> String {
    let mut inputs = String::new();
    for (name, value) in pairs {
        inputs.push_str(&format!(
            r#"<input type="hidden" name="{name}" value="{value}">"#
        ));
    }
    inputs
}

fn page_one_field_pairs(form: &CommunityForm) -> Vec<(String, String)> {
    vec![
        ("disturbance_only".to_string(), "0".to_string()),
        (
            "natural".to_string(),
            if form.natural { "on" } else { "" }.to_string(),
        ),
        ("terrain".to_string(), form.terrain.to_string()),
        ("salinity".to_string(), form.salinity.to_string()),
        ("drainage".to_string(), form.drainage.to_string()),
        ("fertility".to_string(), form.fertility.to_string()),
    ]
}

// Everything the matrix editor needs to rebuild the form on the next post,
// except ongoing_disturbance which travels in its own selector.
fn state_field_pairs(form: &CommunityForm) -> Vec<(String, String)> {
    let mut pairs = vec![
        ("selected".to_string(), selection_field(&form.selection)),
        ("starting_matrix".to_string(), form.grid.flatten()),
        (
            "disturbance_only".to_string(),
            if form.disturbance_only { "1" } else { "0" }.to_string(),
        ),
        ("terrain".to_string(), form.terrain.to_string()),
    ];
    if form.disturbance_only {
        return pairs;
    }
    pairs.push((
        "natural".to_string(),
        if form.natural { "on" } else { "" }.to_string(),
    ));
    pairs.push(("salinity".to_string(), form.salinity.to_string()));
    pairs.push(("drainage".to_string(), form.drainage.to_string()));
    pairs.push(("fertility".to_string(), form.fertility.to_string()));
    for (slot, plant) in form.plants.iter().enumerate() {
        let number = slot + 1;
        pairs.push((format!("plant_code_{number}"), plant.code.to_string()));
        pairs.push((
            format!("lifespan_{number}"),
            plant.lifespan.code().to_string(),
        ));
        let factors = [
            ("altitude", plant.altitude),
            ("salinity", plant.salinity),
            ("drainage", plant.drainage),
            ("fertility", plant.fertility),
        ];
        for (stem, response) in factors {
            pairs.push((
                format!("{stem}_optimum_{number}"),
                response.optimum.code().to_string(),
            ));
            pairs.push((
                format!("{stem}_effect_{number}"),
                response.effect.code().to_string(),
            ));
        }
    }
    for (row_index, row) in form.replacement.iter().enumerate() {
        for (col, value) in row.iter().enumerate() {
            pairs.push((
                format!("replace_{}_{}", row_index + 1, col),
                value.code().to_string(),
            ));
        }
    }
    pairs
}

fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

//  Helpers 

fn internal_err(message: String) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, message)
}

fn resolve_data_dir() -> PathBuf {
    const ENV_VAR: &str = "VPCSIM_DATA_DIR";
    match std::env::var(ENV_VAR) {
        Ok(raw_value) if !raw_value.trim().is_empty() => PathBuf::from(raw_value),
        _ => PathBuf::from(DEFAULT_DATA_DIR),
    }
}

fn resolve_bind_port() -> u16 {
    const ENV_VAR: &str = "VPCSIM_PORT";
    if let Ok(raw_value) = std::env::var(ENV_VAR) {
        match raw_value.parse::<u16>() {
            Ok(parsed) if parsed > 0 => return parsed,
            _ => warn!(
                "{ENV_VAR} must be an integer in range 1-65535; got '{raw_value}'. Using default {DEFAULT_BIND_PORT}"
            ),
        }
    }
    DEFAULT_BIND_PORT
}

async fn bind_listener(
    host: &str,
    desired_port: u16,
) -> Result<(tokio::net::TcpListener, SocketAddr), String> {
    let prefer_default_port = desired_port == DEFAULT_BIND_PORT;
    match tokio::net::TcpListener::bind((host, desired_port)).await {
        Ok(listener) => {
            let addr = listener
                .local_addr()
                .map_err(|err| format!("bound listener but failed reading local address: {err}"))?;
            Ok((listener, addr))
        }
        Err(err) if err.kind() == io::ErrorKind::AddrInUse && prefer_default_port => {
            for offset in 1..=PORT_FALLBACK_ATTEMPTS {
                let Some(candidate_port) = desired_port.checked_add(offset) else {
                    break;
                };
                match tokio::net::TcpListener::bind((host, candidate_port)).await {
                    Ok(listener) => {
                        let addr = listener.local_addr().map_err(|bind_err| {
                            format!(
                                "bound listener on fallback port but failed reading local address: {bind_err}"
                            )
                        })?;
                        warn!(
                            "port {desired_port} is in use, falling back to http://{addr}; set VPCSIM_PORT to choose a fixed port"
                        );
                        return Ok((listener, addr));
                    }
                    Err(bind_err) if bind_err.kind() == io::ErrorKind::AddrInUse => continue,
                    Err(bind_err) => {
                        return Err(format!(
                            "failed to bind fallback port {candidate_port} on {host}: {bind_err}"
                        ));
                    }
                }
            }
            Err(format!(
                "port {desired_port} is in use on {host}, and no free fallback port was found in range {}-{}; stop the existing process or set VPCSIM_PORT",
                desired_port + 1,
                desired_port + PORT_FALLBACK_ATTEMPTS
            ))
        }
        Err(err) if err.kind() == io::ErrorKind::AddrInUse => Err(format!(
            "port {desired_port} is already in use on {host}; stop the existing process or choose another port via VPCSIM_PORT"
        )),
        Err(err) => Err(format!(
            "failed to bind socket on {host}:{desired_port}: {err}"
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> FieldMap {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect()
    }

    fn temp_store() -> (DataStore, PathBuf) {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let dir = std::env::temp_dir().join(format!(
            "vpcsim-web-test-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let store = DataStore::open(dir.clone()).expect("open temp store");
        (store, dir)
    }

    fn sample_form() -> CommunityForm {
        let mut form = CommunityForm::default();
        form.natural = true;
        form.terrain = 2;
        form.salinity = 0;
        form.drainage = 1;
        form.fertility = 2;
        form.plants[0] = PlantSpec {
            code: 1,
            lifespan: Lifespan::Short,
            altitude: FactorResponse {
                optimum: Level::Low,
                effect: Influence::High,
            },
            salinity: FactorResponse::default(),
            drainage: FactorResponse::default(),
            fertility: FactorResponse {
                optimum: Level::High,
                effect: Influence::Low,
            },
        };
        form.plants[1].code = 5;
        form.plants[2].code = 8;
        form.plants[3].code = 14;
        form.plants[4] = PlantSpec {
            code: 19,
            lifespan: Lifespan::Long,
            ..PlantSpec::default()
        };
        form.replacement[1][0] = Level::Low;
        form.replacement[1][5] = Level::High;
        form.grid.set_linear(2, Cell::Disturbance);
        form.grid.set_linear(2499, Cell::Species(4));
        form.ongoing_disturbance = Influence::Low;
        form
    }

    #[test]
    fn cell_codes_round_trip() {
        for code in ['R', 'N', '0', '1', '2', '3', '4', '5'] {
            let cell = Cell::from_code(code).expect("known code");
            assert_eq!(cell.code(), code);
        }
    }

    #[test]
    fn cell_rejects_unknown_codes() {
        for code in ['6', '9', 'r', 'n', 'X', ' '] {
            assert_eq!(Cell::from_code(code), None);
        }
    }

    #[test]
    fn grid_pads_short_input_with_random() {
        let grid = Grid::from_flat("N0", 3, 3);
        assert_eq!(grid.flatten(), "N0RRRRRRR");
    }

    #[test]
    fn grid_truncates_long_input() {
        let grid = Grid::from_flat("NNNNNNNNNN55555", 3, 3);
        assert_eq!(grid.flatten(), "NNNNNNNNN");
    }

    #[test]
    fn grid_defaults_unknown_codes_to_random() {
        let grid = Grid::from_flat("QZ1", 1, 3);
        assert_eq!(grid.flatten(), "RR1");
    }

    #[test]
    fn grid_flip_reverses_row_order_only() {
        let grid = Grid::from_flat("012345", 2, 3);
        assert_eq!(grid.flipped_rows().flatten(), "345012");
    }

    #[test]
    fn grid_flip_twice_restores_original() {
        let grid = Grid::from_flat("R1N23045R", 3, 3);
        assert_eq!(grid.flipped_rows().flipped_rows(), grid);
    }

    #[test]
    fn toggle_adds_then_removes_a_cell() {
        let mut selection = Vec::new();
        toggle_selection(&mut selection, 4);
        assert_eq!(selection, vec![4]);
        toggle_selection(&mut selection, 4);
        assert!(selection.is_empty());
    }

    #[test]
    fn selection_caps_at_two_cells() {
        let mut selection = Vec::new();
        toggle_selection(&mut selection, 1);
        toggle_selection(&mut selection, 2);
        toggle_selection(&mut selection, 3);
        assert_eq!(selection, vec![1, 2]);
        toggle_selection(&mut selection, 1);
        assert_eq!(selection, vec![2]);
    }

    #[test]
    fn parse_selection_skips_junk_and_out_of_range() {
        assert_eq!(
            parse_selection("5, x, 5, -1, 2600, 7", GRID_CELLS),
            vec![5, 7]
        );
        assert_eq!(parse_selection("", GRID_CELLS), Vec::<usize>::new());
        assert_eq!(parse_selection("9,8,7", GRID_CELLS), vec![9, 8]);
    }

    #[test]
    fn area_covers_normalized_rectangle() {
        assert_eq!(area_between(4, 2, 3), vec![1, 2, 4, 5]);
    }

    #[test]
    fn area_ignores_corner_order() {
        assert_eq!(area_between(2, 4, 3), area_between(4, 2, 3));
    }

    #[test]
    fn editor_action_prefers_named_submit_over_click() {
        let map = fields(&[("submit_value", SUBMIT_APPLY_AREA), ("clicked", "9")]);
        assert_eq!(editor_action(&map), EditorAction::ApplyToArea);
        let map = fields(&[("submit_value", SUBMIT_PARAMETERS)]);
        assert_eq!(editor_action(&map), EditorAction::Submit);
        let map = fields(&[("clicked", "9")]);
        assert_eq!(editor_action(&map), EditorAction::Click(9));
        assert_eq!(editor_action(&fields(&[])), EditorAction::Redraw);
        let map = fields(&[("submit_value", "bogus")]);
        assert_eq!(editor_action(&map), EditorAction::Redraw);
        let map = fields(&[("clicked", "")]);
        assert_eq!(editor_action(&map), EditorAction::Redraw);
    }

    #[test]
    fn apply_to_cells_writes_selection_and_clears_it() {
        let mut form = CommunityForm::default();
        form.selection = vec![1, 3];
        let map = fields(&[("cell_value", "N")]);
        apply_editor_action(&mut form, EditorAction::ApplyToCells, &map).expect("apply");
        assert_eq!(form.grid.get_linear(1), Cell::Disturbance);
        assert_eq!(form.grid.get_linear(3), Cell::Disturbance);
        assert_eq!(form.grid.get_linear(2), Cell::Random);
        assert!(form.selection.is_empty());
    }

    #[test]
    fn area_apply_without_two_corners_changes_nothing() {
        let mut form = CommunityForm::default();
        form.selection = vec![4];
        let before = form.grid.clone();
        let map = fields(&[("cell_value", "N")]);
        apply_editor_action(&mut form, EditorAction::ApplyToArea, &map).expect("apply");
        assert_eq!(form.grid, before);
        assert_eq!(form.selection, vec![4]);
    }

    #[test]
    fn area_apply_fills_rectangle_between_clicks() {
        let mut form = CommunityForm::default();
        form.grid = Grid::filled(3, 3);
        toggle_selection(&mut form.selection, 4);
        toggle_selection(&mut form.selection, 2);
        let map = fields(&[("cell_value", "N")]);
        apply_editor_action(&mut form, EditorAction::ApplyToArea, &map).expect("apply");
        for index in 0..9 {
            let expected = if [1, 2, 4, 5].contains(&index) {
                Cell::Disturbance
            } else {
                Cell::Random
            };
            assert_eq!(form.grid.get_linear(index), expected, "cell {index}");
        }
        assert!(form.selection.is_empty());
    }

    #[test]
    fn forged_cell_value_is_reported() {
        let mut form = CommunityForm::default();
        form.selection = vec![1];
        let map = fields(&[("cell_value", "NN")]);
        let err = apply_editor_action(&mut form, EditorAction::ApplyToCells, &map)
            .expect_err("bad cell value");
        assert!(err.contains("cell_value"));
    }

    #[test]
    fn page_one_values_round_trip_through_hidden_fields() {
        let mut original = CommunityForm::default();
        original.natural = false;
        original.terrain = 3;
        original.salinity = 2;
        original.drainage = 0;
        original.fertility = 1;
        let map: FieldMap = page_one_field_pairs(&original).into_iter().collect();
        let parsed = CommunityForm::from_page_one(&map).expect("parse");
        assert_eq!(parsed, original);
    }

    #[test]
    fn full_editor_state_round_trips_through_hidden_fields() {
        let mut original = sample_form();
        original.selection = vec![7, 9];
        let mut map: FieldMap = state_field_pairs(&original).into_iter().collect();
        map.insert(
            "ongoing_disturbance".to_string(),
            original.ongoing_disturbance.code().to_string(),
        );
        let parsed = CommunityForm::from_fields(&map).expect("parse");
        assert_eq!(parsed, original);
    }

    #[test]
    fn disturbance_only_state_skips_plant_fields() {
        let mut original = CommunityForm::default();
        original.disturbance_only = true;
        original.terrain = 1;
        original.grid.set_linear(0, Cell::Disturbance);
        let pairs = state_field_pairs(&original);
        assert!(
            pairs
                .iter()
                .all(|(name, _)| !name.starts_with("plant_code"))
        );
        let map: FieldMap = pairs.into_iter().collect();
        let parsed = CommunityForm::from_fields(&map).expect("parse");
        assert_eq!(parsed, original);
    }

    #[test]
    fn malformed_map_choice_is_reported() {
        let mut map: FieldMap = state_field_pairs(&sample_form()).into_iter().collect();
        map.insert("terrain".to_string(), "9".to_string());
        let err = CommunityForm::from_fields(&map).expect_err("bad terrain");
        assert!(err.contains("terrain"));
    }

    #[test]
    fn missing_species_field_is_reported() {
        let mut map: FieldMap = state_field_pairs(&sample_form()).into_iter().collect();
        map.remove("lifespan_3");
        let err = CommunityForm::from_fields(&map).expect_err("missing lifespan");
        assert!(err.contains("lifespan_3"));
    }

    #[test]
    fn record_joins_species_columns_as_csv() {
        let record = assemble_record(&sample_form(), "1300000000".to_string());
        assert_eq!(record.plant_types, "1,5,8,14,19");
        assert_eq!(record.lifespans, "S,M,M,M,L");
        assert_eq!(record.altitude_optimums, "L,M,M,M,M");
        assert_eq!(record.altitude_effects, "H,N,N,N,N");
        assert_eq!(record.fertility_optimums, "H,M,M,M,M");
        assert_eq!(record.fertility_effects, "L,N,N,N,N");
        assert_eq!(record.replacement_1, "M,M,M,M,M,M");
        assert_eq!(record.replacement_2, "L,M,M,M,M,H");
        assert_eq!(record.natural, 1);
        assert_eq!(record.terrain, 2);
        assert_eq!(record.ongoing_disturbance, "L");
    }

    #[test]
    fn record_flips_matrix_rows_for_storage() {
        let record = assemble_record(&sample_form(), "1300000000".to_string());
        let stored: Vec<char> = record.starting_matrix.chars().collect();
        assert_eq!(stored.len(), GRID_CELLS);
        // Editor cell (row 0, col 2) lands on stored row 49; editor cell
        // (row 49, col 49) lands on stored row 0.
        assert_eq!(stored[49 * GRID_COLS + 2], 'N');
        assert_eq!(stored[49], '4');
        assert_eq!(stored[0], 'R');
    }

    #[test]
    fn disturbance_only_record_blanks_species_columns() {
        let mut form = CommunityForm::default();
        form.disturbance_only = true;
        form.terrain = 3;
        form.ongoing_disturbance = Influence::High;
        let record = assemble_record(&form, "1300000001".to_string());
        assert_eq!(record.disturbance_only, 1);
        assert_eq!(record.plant_types, "");
        assert_eq!(record.replacement_5, "");
        assert_eq!(record.natural, 0);
        assert_eq!(record.salinity, 0);
        assert_eq!(record.terrain, 3);
        assert_eq!(record.ongoing_disturbance, "H");
        assert_eq!(record.x_size, 50);
        assert_eq!(record.y_size, 50);
    }

    #[test]
    fn record_markup_lists_fields_in_consumer_order() {
        let mut form = CommunityForm::default();
        form.terrain = 1;
        form.grid.set_linear(2, Cell::Disturbance);
        let record = assemble_record(&form, "1300000002".to_string());
        let mut matrix = vec!['R'; GRID_CELLS];
        matrix[49 * GRID_COLS + 2] = 'N';
        let matrix: String = matrix.into_iter().collect();
        let expected = format!(
            concat!(
                "<record>\n",
                "  <id>1300000002</id>\n",
                "  <plant_types>1,1,1,1,1</plant_types>\n",
                "  <replacement_1>M,M,M,M,M,M</replacement_1>\n",
                "  <replacement_2>M,M,M,M,M,M</replacement_2>\n",
                "  <replacement_3>M,M,M,M,M,M</replacement_3>\n",
                "  <replacement_4>M,M,M,M,M,M</replacement_4>\n",
                "  <replacement_5>M,M,M,M,M,M</replacement_5>\n",
                "  <lifespans>M,M,M,M,M</lifespans>\n",
                "  <altitude_optimums>M,M,M,M,M</altitude_optimums>\n",
                "  <altitude_effects>N,N,N,N,N</altitude_effects>\n",
                "  <salinity_optimums>M,M,M,M,M</salinity_optimums>\n",
                "  <salinity_effects>N,N,N,N,N</salinity_effects>\n",
                "  <drainage_optimums>M,M,M,M,M</drainage_optimums>\n",
                "  <drainage_effects>N,N,N,N,N</drainage_effects>\n",
                "  <fertility_optimums>M,M,M,M,M</fertility_optimums>\n",
                "  <fertility_effects>N,N,N,N,N</fertility_effects>\n",
                "  <disturbance_only>0</disturbance_only>\n",
                "  <natural>1</natural>\n",
                "  <terrain>1</terrain>\n",
                "  <salinity>0</salinity>\n",
                "  <drainage>1</drainage>\n",
                "  <fertility>0</fertility>\n",
                "  <starting_matrix>{matrix}</starting_matrix>\n",
                "  <ongoing_disturbance>N</ongoing_disturbance>\n",
                "  <x_size>50</x_size>\n",
                "  <y_size>50</y_size>\n",
                "  <x_location>5.0</x_location>\n",
                "  <y_location>5.0</y_location>\n",
                "  <spacing>5.0</spacing>\n",
                "</record>\n"
            ),
            matrix = matrix
        );
        assert_eq!(render_record_markup(&record), expected);
    }

    #[test]
    fn store_probes_forward_on_id_collision() {
        let (store, dir) = temp_store();
        let form = sample_form();
        let first = store
            .create_record_from(&form, 1_700_000_000)
            .expect("first record");
        let second = store
            .create_record_from(&form, 1_700_000_000)
            .expect("second record");
        assert_eq!(first.id, "1700000000");
        assert_eq!(second.id, "1700000001");
        assert_eq!(first.id.len(), SIM_ID_LENGTH);
        let fetched = store.fetch_record(&second.id).expect("fetch");
        assert_eq!(fetched, second);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn fetch_missing_record_reports_not_found() {
        let (store, dir) = temp_store();
        assert!(matches!(
            store.fetch_record("1700000009"),
            Err(StoreError::RecordNotFound { .. })
        ));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn fetch_rejects_non_numeric_ids() {
        let (store, dir) = temp_store();
        for id in ["", "../../etc/passwd", "17000x0000", "latest"] {
            assert!(matches!(
                store.fetch_record(id),
                Err(StoreError::RecordNotFound { .. })
            ));
        }
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn log_query_returns_entries_in_insert_order() {
        let (store, dir) = temp_store();
        for step in ["1,9,0,0,0,0,0", "2,8,1,0,0,0,0", "3,7,2,0,0,0,0"] {
            store
                .append_log("sim4567890", "region-a", step)
                .expect("append");
        }
        let rows: Vec<LogEntry> = store
            .query_logs("sim4567890", "region-a")
            .expect("query")
            .collect::<Result<_, _>>()
            .expect("read");
        let data: Vec<&str> = rows.iter().map(|entry| entry.data.as_str()).collect();
        assert_eq!(
            data,
            vec!["1,9,0,0,0,0,0", "2,8,1,0,0,0,0", "3,7,2,0,0,0,0"]
        );
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn log_query_filters_by_sim_and_region() {
        let (store, dir) = temp_store();
        store
            .append_log("sim4567890", "region-a", "1,9,0,0,0,0,0")
            .expect("append");
        store
            .append_log("sim4567890", "region-b", "2,8,1,0,0,0,0")
            .expect("append");
        store
            .append_log("other67890", "region-a", "3,7,2,0,0,0,0")
            .expect("append");
        let rows: Vec<LogEntry> = store
            .query_logs("sim4567890", "region-a")
            .expect("query")
            .collect::<Result<_, _>>()
            .expect("read");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].data, "1,9,0,0,0,0,0");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn delete_removes_only_matching_entries() {
        let (store, dir) = temp_store();
        store
            .append_log("sim4567890", "region-a", "1,9,0,0,0,0,0")
            .expect("append");
        store
            .append_log("sim4567890", "region-a", "2,8,1,0,0,0,0")
            .expect("append");
        store
            .append_log("sim4567890", "region-b", "3,7,2,0,0,0,0")
            .expect("append");
        let removed = store.delete_logs("sim4567890", "region-a").expect("delete");
        assert_eq!(removed, 2);
        let remaining: Vec<LogEntry> = store
            .query_logs("sim4567890", "region-b")
            .expect("query")
            .collect::<Result<_, _>>()
            .expect("read");
        assert_eq!(remaining.len(), 1);
        let removed = store.delete_logs("sim4567890", "region-a").expect("delete");
        assert_eq!(removed, 0);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn log_payload_requires_ten_character_sim_id() {
        let data = "1,2,3,4,5,6,7";
        assert!(log_payload_is_valid("abcdefghij", data));
        assert!(!log_payload_is_valid("abcdefghi", data));
        assert!(!log_payload_is_valid("abcdefghijk", data));
        assert!(!log_payload_is_valid("", data));
    }

    #[test]
    fn log_payload_requires_seven_data_fields() {
        let sim_id = "abcdefghij";
        assert!(log_payload_is_valid(sim_id, "1,2,3,4,5,6,7"));
        assert!(!log_payload_is_valid(sim_id, "1,2,3,4,5,6"));
        assert!(!log_payload_is_valid(sim_id, "1,2,3,4,5,6,7,8"));
        assert!(!log_payload_is_valid(sim_id, ""));
    }

    #[test]
    fn editor_page_offers_area_button_only_with_two_corners() {
        let mut form = CommunityForm::default();
        form.selection = vec![4];
        let page = matrix_editor_page(&form);
        assert!(page.contains(SUBMIT_APPLY_CELLS));
        assert!(!page.contains(SUBMIT_APPLY_AREA));
        form.selection = vec![4, 9];
        let page = matrix_editor_page(&form);
        assert!(page.contains(SUBMIT_APPLY_AREA));
    }

    #[test]
    fn editor_page_marks_selected_cells() {
        let mut form = CommunityForm::default();
        let page = matrix_editor_page(&form);
        assert!(!page.contains("selectedbutton.svg"));
        form.selection = vec![0];
        let page = matrix_editor_page(&form);
        assert!(page.contains("selectedbutton.svg"));
    }

    #[test]
    fn log_report_escapes_markup_in_lookup_values() {
        let lookup = LogLookup {
            sim_id: "<b>sim</b>".to_string(),
            region_tag: "a&b".to_string(),
        };
        let page = log_records_page(&lookup, &[]);
        assert!(page.contains("&lt;b&gt;sim&lt;/b&gt;"));
        assert!(page.contains("a&amp;b"));
        assert!(!page.contains("<b>sim</b>"));
    }
}
