//! Normalization of raw yearly tables into one canonical facility table.
//!
//! Rules:
//! - Column names go through an exact mapping of every known header variant,
//!   then a snake_case fallback.
//! - Rows without a facility id are dropped and counted.
//! - Emission species are coerced to finite, non-negative numbers. Bad values
//!   become 0 and are counted, never surfaced as errors.
//! - State names become 2-letter codes when recognized.
//!
//! Cleaning is idempotent: cleaning `to_raw_table()` of a cleaned table yields
//! the same records.

use calamine::Data;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::LazyLock;
use tracing::info;

use crate::error::{PipelineError, Result};
use crate::workbook::{cell_text, RawTable, REPORTING_YEAR_COLUMN};

pub const FACILITY_ID: &str = "facility_id";
pub const STATE: &str = "state";
pub const TOTAL_EMISSIONS: &str = "total_reported_direct_emissions";
pub const CO2_EMISSIONS: &str = "co2_emissions_non_biogenic";
pub const CH4_EMISSIONS: &str = "ch4_emissions";
pub const N2O_EMISSIONS: &str = "n2o_emissions";

/// Canonical columns, in output order.
pub const REQUIRED_COLUMNS: [&str; 14] = [
    FACILITY_ID,
    "facility_name",
    "city",
    STATE,
    "latitude",
    "longitude",
    "primary_naics_code",
    "industry_type_sectors",
    "industry_type_subparts",
    TOTAL_EMISSIONS,
    CO2_EMISSIONS,
    CH4_EMISSIONS,
    N2O_EMISSIONS,
    REPORTING_YEAR_COLUMN,
];

pub const EMISSION_COLUMNS: [&str; 4] = [TOTAL_EMISSIONS, CO2_EMISSIONS, CH4_EMISSIONS, N2O_EMISSIONS];

/// Columns that always exist in the cleaned table, even if no source had them.
const ALWAYS_PRESENT: [&str; 6] = [
    FACILITY_ID,
    TOTAL_EMISSIONS,
    CO2_EMISSIONS,
    CH4_EMISSIONS,
    N2O_EMISSIONS,
    REPORTING_YEAR_COLUMN,
];

/// Historical header variants -> canonical names. Trailing-space variants are distinct keys.
static COLUMN_MAPPING: LazyLock<HashMap<&'static str, &'static str>> = LazyLock::new(|| {
    HashMap::from([
        ("Facility Id", FACILITY_ID),
        ("FRS Id", "frs_id"),
        ("Facility Name", "facility_name"),
        ("City", "city"),
        ("State", STATE),
        ("Zip Code", "zip_code"),
        ("Address", "address"),
        ("County", "county"),
        ("Latitude", "latitude"),
        ("Longitude", "longitude"),
        ("Primary NAICS Code", "primary_naics_code"),
        ("Industry Type (subparts)", "industry_type_subparts"),
        ("Industry Type (sectors)", "industry_type_sectors"),
        ("Total reported direct emissions", TOTAL_EMISSIONS),
        ("CO2 emissions (non-biogenic) ", CO2_EMISSIONS),
        ("CO2 emissions (non-biogenic)", CO2_EMISSIONS),
        ("Methane (CH4) emissions ", CH4_EMISSIONS),
        ("Methane (CH4) emissions", CH4_EMISSIONS),
        ("Nitrous Oxide (N2O) emissions ", N2O_EMISSIONS),
        ("Nitrous Oxide (N2O) emissions", N2O_EMISSIONS),
        ("HFC emissions", "hfc_emissions"),
        ("PFC emissions", "pfc_emissions"),
        ("SF6 emissions ", "sf6_emissions"),
        ("SF6 emissions", "sf6_emissions"),
        (REPORTING_YEAR_COLUMN, REPORTING_YEAR_COLUMN),
    ])
});

/// Upper-cased full state name -> USPS code. 50 states plus DC.
static STATE_CODES: LazyLock<HashMap<&'static str, &'static str>> = LazyLock::new(|| {
    HashMap::from([
        ("ALABAMA", "AL"), ("ALASKA", "AK"), ("ARIZONA", "AZ"), ("ARKANSAS", "AR"),
        ("CALIFORNIA", "CA"), ("COLORADO", "CO"), ("CONNECTICUT", "CT"), ("DELAWARE", "DE"),
        ("FLORIDA", "FL"), ("GEORGIA", "GA"), ("HAWAII", "HI"), ("IDAHO", "ID"),
        ("ILLINOIS", "IL"), ("INDIANA", "IN"), ("IOWA", "IA"), ("KANSAS", "KS"),
        ("KENTUCKY", "KY"), ("LOUISIANA", "LA"), ("MAINE", "ME"), ("MARYLAND", "MD"),
        ("MASSACHUSETTS", "MA"), ("MICHIGAN", "MI"), ("MINNESOTA", "MN"), ("MISSISSIPPI", "MS"),
        ("MISSOURI", "MO"), ("MONTANA", "MT"), ("NEBRASKA", "NE"), ("NEVADA", "NV"),
        ("NEW HAMPSHIRE", "NH"), ("NEW JERSEY", "NJ"), ("NEW MEXICO", "NM"), ("NEW YORK", "NY"),
        ("NORTH CAROLINA", "NC"), ("NORTH DAKOTA", "ND"), ("OHIO", "OH"), ("OKLAHOMA", "OK"),
        ("OREGON", "OR"), ("PENNSYLVANIA", "PA"), ("RHODE ISLAND", "RI"), ("SOUTH CAROLINA", "SC"),
        ("SOUTH DAKOTA", "SD"), ("TENNESSEE", "TN"), ("TEXAS", "TX"), ("UTAH", "UT"),
        ("VERMONT", "VT"), ("VIRGINIA", "VA"), ("WASHINGTON", "WA"), ("WEST VIRGINIA", "WV"),
        ("WISCONSIN", "WI"), ("WYOMING", "WY"), ("DISTRICT OF COLUMBIA", "DC"),
    ])
});

// =============================================================================
// COLUMN NAMES
// =============================================================================

/// Strips punctuation, collapses whitespace to `_`, lower-cases.
pub fn to_snake_case(name: &str) -> String {
    let kept: String = name
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || c.is_whitespace())
        .collect();
    kept.split_whitespace().collect::<Vec<_>>().join("_").to_lowercase()
}

pub fn canonical_column_name(raw: &str) -> String {
    match COLUMN_MAPPING.get(raw) {
        Some(canonical) => canonical.to_string(),
        None => to_snake_case(raw),
    }
}

// =============================================================================
// VALUE COERCION
// =============================================================================

/// Finite number from a cell; text is parsed after trimming.
fn numeric_value(cell: &Data) -> Option<f64> {
    let value = match cell {
        Data::Float(f) => *f,
        Data::Int(i) => *i as f64,
        Data::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    value.is_finite().then_some(value)
}

/// What happened to an emission value on its way to a clean number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correction {
    None,
    Missing,
    NonNumeric,
    NegativeClamped,
}

/// Coerces an emission cell: missing or non-numeric -> 0, negative -> 0.
pub fn sanitize_emission(cell: Option<&Data>) -> (f64, Correction) {
    let Some(cell) = cell.filter(|c| cell_text(c).is_some()) else {
        return (0.0, Correction::Missing);
    };
    match numeric_value(cell) {
        None => (0.0, Correction::NonNumeric),
        Some(v) if v < 0.0 => (0.0, Correction::NegativeClamped),
        // -0.0 normalizes to 0.0 here too.
        Some(v) => (v + 0.0, Correction::None),
    }
}

/// Coerces a non-emission numeric field; anything unparseable is missing.
pub fn coerce_optional_number(cell: Option<&Data>) -> Option<f64> {
    cell.and_then(numeric_value)
}

/// Trims the id; text like `1000001.0` renders as `1000001`, matching numeric cells.
/// Ids without a decimal point are kept verbatim so leading zeros survive.
pub fn normalize_facility_id(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.contains('.') {
        if let Ok(value) = trimmed.parse::<f64>() {
            if value.is_finite() && value.fract() == 0.0 {
                return value.to_string();
            }
        }
    }
    trimmed.to_string()
}

/// Full state names become codes; 2-character values pass through; anything else is upper-cased.
pub fn standardize_state(raw: &str) -> Option<String> {
    let upper = raw.trim().to_uppercase();
    if upper.is_empty() {
        return None;
    }
    if upper.chars().count() == 2 {
        return Some(upper);
    }
    match STATE_CODES.get(upper.as_str()) {
        Some(code) => Some(code.to_string()),
        None => Some(upper),
    }
}

// =============================================================================
// CLEANED TABLE
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FacilityRecord {
    pub facility_id: String,
    pub facility_name: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub primary_naics_code: Option<f64>,
    pub industry_type_sectors: Option<String>,
    pub industry_type_subparts: Option<String>,
    pub total_reported_direct_emissions: f64,
    pub co2_emissions_non_biogenic: f64,
    pub ch4_emissions: f64,
    pub n2o_emissions: f64,
    pub reporting_year: i32,
    /// Values of `CleanedTable::extra_columns`, same order.
    pub extras: Vec<Option<String>>,
}

impl FacilityRecord {
    /// Value of a canonical column rendered as text; `None` for missing or unknown columns.
    pub fn field_text(&self, column: &str) -> Option<String> {
        let number = |v: f64| Some(v.to_string());
        match column {
            FACILITY_ID => Some(self.facility_id.clone()),
            "facility_name" => self.facility_name.clone(),
            "city" => self.city.clone(),
            STATE => self.state.clone(),
            "latitude" => self.latitude.and_then(number),
            "longitude" => self.longitude.and_then(number),
            "primary_naics_code" => self.primary_naics_code.and_then(number),
            "industry_type_sectors" => self.industry_type_sectors.clone(),
            "industry_type_subparts" => self.industry_type_subparts.clone(),
            TOTAL_EMISSIONS => number(self.total_reported_direct_emissions),
            CO2_EMISSIONS => number(self.co2_emissions_non_biogenic),
            CH4_EMISSIONS => number(self.ch4_emissions),
            N2O_EMISSIONS => number(self.n2o_emissions),
            REPORTING_YEAR_COLUMN => Some(self.reporting_year.to_string()),
            _ => None,
        }
    }

    pub fn emissions(&self) -> [f64; 4] {
        [
            self.total_reported_direct_emissions,
            self.co2_emissions_non_biogenic,
            self.ch4_emissions,
            self.n2o_emissions,
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CleanedTable {
    /// Required canonical columns that are present, in canonical order.
    pub required_columns: Vec<String>,
    /// Remaining columns in first-seen order across sources.
    pub extra_columns: Vec<String>,
    pub records: Vec<FacilityRecord>,
}

impl CleanedTable {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn header(&self) -> Vec<String> {
        self.required_columns
            .iter()
            .chain(self.extra_columns.iter())
            .cloned()
            .collect()
    }

    /// Every record as text cells aligned with `header()`; missing values are empty strings.
    pub fn to_rows(&self) -> Vec<Vec<String>> {
        self.records
            .iter()
            .map(|record| {
                self.required_columns
                    .iter()
                    .map(|col| record.field_text(col).unwrap_or_default())
                    .chain(record.extras.iter().map(|v| v.clone().unwrap_or_default()))
                    .collect()
            })
            .collect()
    }

    /// Renders the table back into raw form, as if re-read from its CSV export.
    pub fn to_raw_table(&self) -> RawTable {
        let rows = self
            .to_rows()
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .map(|v| if v.is_empty() { Data::Empty } else { Data::String(v) })
                    .collect()
            })
            .collect();

        RawTable {
            source: PathBuf::from("cleaned"),
            year: self.records.first().map(|r| r.reporting_year).unwrap_or_default(),
            sheet: "cleaned".to_string(),
            header_row: 0,
            headers: self.header(),
            rows,
        }
    }
}

// =============================================================================
// REPORT
// =============================================================================

/// Silent corrections applied to one emission column.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ColumnCorrections {
    pub missing: usize,
    pub non_numeric: usize,
    pub negative_clamped: usize,
    /// Rows from sources that lacked the column entirely (synthesized as 0).
    pub absent_column_rows: usize,
}

impl ColumnCorrections {
    fn record(&mut self, correction: Correction) {
        match correction {
            Correction::None => {}
            Correction::Missing => self.missing += 1,
            Correction::NonNumeric => self.non_numeric += 1,
            Correction::NegativeClamped => self.negative_clamped += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.missing + self.non_numeric + self.negative_clamped
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CleaningReport {
    pub tables: usize,
    pub input_rows: usize,
    pub dropped_missing_id: usize,
    pub output_rows: usize,
    pub corrections: BTreeMap<String, ColumnCorrections>,
}

impl CleaningReport {
    pub fn corrected_values(&self) -> usize {
        self.corrections.values().map(ColumnCorrections::total).sum()
    }
}

// =============================================================================
// CLEANING
// =============================================================================

/// Canonical name -> first raw column index mapping to it.
fn column_index(headers: &[String]) -> (HashMap<String, usize>, Vec<String>) {
    let mut index = HashMap::new();
    let mut order = Vec::new();
    for (idx, raw) in headers.iter().enumerate() {
        let canonical = canonical_column_name(raw);
        if !index.contains_key(&canonical) {
            index.insert(canonical.clone(), idx);
            order.push(canonical);
        }
    }
    (index, order)
}

fn optional_text(cell: Option<&Data>) -> Option<String> {
    cell.and_then(cell_text)
}

fn reporting_year(cell: Option<&Data>, fallback: i32) -> i32 {
    match cell {
        Some(Data::Int(i)) => i32::try_from(*i).unwrap_or(fallback),
        Some(Data::Float(f)) if f.fract() == 0.0 => *f as i32,
        Some(Data::String(s)) => s.trim().parse().unwrap_or(fallback),
        _ => fallback,
    }
}

/// Combines and cleans all yearly raw tables into one canonical table.
pub fn clean_tables(tables: &[RawTable]) -> Result<(CleanedTable, CleaningReport)> {
    if tables.is_empty() {
        return Err(PipelineError::EmptyInput("cleaning"));
    }

    let indexed: Vec<(HashMap<String, usize>, Vec<String>)> =
        tables.iter().map(|t| column_index(&t.headers)).collect();

    let seen: HashSet<&str> = indexed
        .iter()
        .flat_map(|(index, _)| index.keys().map(String::as_str))
        .collect();

    let required_columns: Vec<String> = REQUIRED_COLUMNS
        .iter()
        .filter(|col| ALWAYS_PRESENT.contains(col) || seen.contains(*col))
        .map(|col| col.to_string())
        .collect();

    let mut extra_columns: Vec<String> = Vec::new();
    for (_, order) in &indexed {
        for name in order {
            if !REQUIRED_COLUMNS.contains(&name.as_str()) && !extra_columns.contains(name) {
                extra_columns.push(name.clone());
            }
        }
    }

    let mut report = CleaningReport {
        tables: tables.len(),
        ..CleaningReport::default()
    };
    for col in EMISSION_COLUMNS {
        report.corrections.insert(col.to_string(), ColumnCorrections::default());
    }

    let mut records = Vec::new();

    for (table, (index, _)) in tables.iter().zip(&indexed) {
        report.input_rows += table.rows.len();

        for row in &table.rows {
            let cell = |name: &str| index.get(name).and_then(|&i| row.get(i));

            let Some(facility_id) = optional_text(cell(FACILITY_ID)).map(|id| normalize_facility_id(&id))
            else {
                report.dropped_missing_id += 1;
                continue;
            };

            let mut emissions = [0.0; 4];
            for (slot, col) in emissions.iter_mut().zip(EMISSION_COLUMNS) {
                let corrections = report.corrections.entry(col.to_string()).or_default();
                if !index.contains_key(col) {
                    corrections.absent_column_rows += 1;
                    continue;
                }
                let (value, correction) = sanitize_emission(cell(col));
                corrections.record(correction);
                *slot = value;
            }

            records.push(FacilityRecord {
                facility_id,
                facility_name: optional_text(cell("facility_name")),
                city: optional_text(cell("city")),
                state: optional_text(cell(STATE)).and_then(|s| standardize_state(&s)),
                latitude: coerce_optional_number(cell("latitude")),
                longitude: coerce_optional_number(cell("longitude")),
                primary_naics_code: coerce_optional_number(cell("primary_naics_code")),
                industry_type_sectors: optional_text(cell("industry_type_sectors")),
                industry_type_subparts: optional_text(cell("industry_type_subparts")),
                total_reported_direct_emissions: emissions[0],
                co2_emissions_non_biogenic: emissions[1],
                ch4_emissions: emissions[2],
                n2o_emissions: emissions[3],
                reporting_year: reporting_year(cell(REPORTING_YEAR_COLUMN), table.year),
                extras: extra_columns
                    .iter()
                    .map(|name| optional_text(cell(name)))
                    .collect(),
            });
        }
    }

    report.output_rows = records.len();

    info!(
        tables = report.tables,
        input_rows = report.input_rows,
        dropped_missing_id = report.dropped_missing_id,
        corrected_values = report.corrected_values(),
        output_rows = report.output_rows,
        "cleaned facility records"
    );

    Ok((
        CleanedTable {
            required_columns,
            extra_columns,
            records,
        },
        report,
    ))
}
