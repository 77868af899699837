//! Workbook reading, sheet/header resolution and raw table loading.
//!
//! Source layouts drift between reporting years: the facility sheet is not
//! always first, and the header row moves. Resolution is a pure function over
//! an in-memory workbook so callers can skip a bad file and keep going.

use calamine::{open_workbook_auto, Data, Reader};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::clean::canonical_column_name;
use crate::config::ResolverConfig;
use crate::error::{PipelineError, Result};
use crate::source::SourceFile;

/// Column stamped onto every loaded row.
pub const REPORTING_YEAR_COLUMN: &str = "reporting_year";

/// One sheet, rows addressed by absolute sheet position (row 0 is the first sheet row).
#[derive(Debug, Clone)]
pub struct SheetGrid {
    pub name: String,
    pub rows: Vec<Vec<Data>>,
}

#[derive(Debug, Clone, Default)]
pub struct Workbook {
    pub sheets: Vec<SheetGrid>,
}

/// Which rule picked the sheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SheetRule {
    AnchorInContent,
    NameKeywords,
    FirstSheet,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Resolved {
        sheet: usize,
        rule: SheetRule,
        header_row: usize,
        /// False when the fallback offset was used.
        header_detected: bool,
    },
    Failed(String),
}

/// Rows of one source file below its header, every row stamped with the reporting year.
#[derive(Debug, Clone)]
pub struct RawTable {
    pub source: PathBuf,
    pub year: i32,
    pub sheet: String,
    pub header_row: usize,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<Data>>,
}

/// Cell as text for matching and extraction. Empty, whitespace-only and error cells are `None`.
pub fn cell_text(cell: &Data) -> Option<String> {
    match cell {
        Data::Empty | Data::Error(_) => None,
        Data::String(s) if s.trim().is_empty() => None,
        Data::String(s) => Some(s.clone()),
        Data::Float(f) => Some(f.to_string()),
        Data::Int(i) => Some(i.to_string()),
        other => Some(other.to_string()),
    }
}

fn row_contains(row: &[Data], needle_lower: &str) -> bool {
    row.iter()
        .filter_map(cell_text)
        .any(|text| text.to_lowercase().contains(needle_lower))
}

fn is_blank_row(row: &[Data]) -> bool {
    row.iter().all(|c| cell_text(c).is_none())
}

// =============================================================================
// READING
// =============================================================================

/// Opens an Excel/ODS workbook with calamine and materializes every sheet.
pub fn read_excel(path: &Path) -> Result<Workbook> {
    let workbook_err = |reason: String| PipelineError::Workbook {
        path: path.to_path_buf(),
        reason,
    };

    let mut workbook: calamine::Sheets<_> =
        open_workbook_auto(path).map_err(|e| workbook_err(e.to_string()))?;

    let mut sheets = Vec::new();
    for name in workbook.sheet_names().to_vec() {
        let range = workbook
            .worksheet_range(&name)
            .map_err(|e| workbook_err(format!("sheet '{}': {}", name, e)))?;

        // calamine trims leading empty rows; pad them back so row indices are absolute.
        let leading = range.start().map(|(row, _)| row as usize).unwrap_or(0);
        let mut rows: Vec<Vec<Data>> = vec![Vec::new(); leading];
        rows.extend(range.rows().map(|r| r.to_vec()));

        debug!(sheet = %name, rows = rows.len(), "read sheet");
        sheets.push(SheetGrid { name, rows });
    }

    Ok(Workbook { sheets })
}

/// Reads a CSV export as a single-sheet workbook named after the file stem.
pub fn read_csv(path: &Path) -> Result<Workbook> {
    let csv_err = |e: csv::Error| PipelineError::Workbook {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(csv_err)?;

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(csv_err)?;
        rows.push(
            record
                .iter()
                .map(|field| {
                    if field.is_empty() {
                        Data::Empty
                    } else {
                        Data::String(field.to_string())
                    }
                })
                .collect(),
        );
    }

    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "csv".to_string());

    Ok(Workbook {
        sheets: vec![SheetGrid { name, rows }],
    })
}

pub fn read_workbook(source: &SourceFile) -> Result<Workbook> {
    if source.is_csv() {
        read_csv(&source.path)
    } else {
        read_excel(&source.path)
    }
}

// =============================================================================
// RESOLUTION
// =============================================================================

/// Picks the facility sheet: anchor in the first rows, then a "direct emitter" name, then the first sheet.
pub fn select_sheet(workbook: &Workbook, config: &ResolverConfig) -> Option<(usize, SheetRule)> {
    let anchor = config.anchor.to_lowercase();

    let by_content = workbook.sheets.iter().position(|sheet| {
        sheet
            .rows
            .iter()
            .take(config.sheet_scan_rows)
            .any(|row| row_contains(row, &anchor))
    });
    if let Some(idx) = by_content {
        return Some((idx, SheetRule::AnchorInContent));
    }

    let by_name = workbook.sheets.iter().position(|sheet| {
        let name = sheet.name.to_lowercase();
        name.contains("direct") && name.contains("emitter")
    });
    if let Some(idx) = by_name {
        return Some((idx, SheetRule::NameKeywords));
    }

    if workbook.sheets.is_empty() {
        None
    } else {
        Some((0, SheetRule::FirstSheet))
    }
}

/// Index of the first row among the first `header_scan_rows` holding the anchor.
pub fn find_header_row(sheet: &SheetGrid, config: &ResolverConfig) -> Option<usize> {
    let anchor = config.anchor.to_lowercase();
    sheet
        .rows
        .iter()
        .take(config.header_scan_rows)
        .position(|row| row_contains(row, &anchor))
}

pub fn resolve(workbook: &Workbook, config: &ResolverConfig) -> Resolution {
    let Some((sheet, rule)) = select_sheet(workbook, config) else {
        return Resolution::Failed("workbook has no sheets".to_string());
    };

    match find_header_row(&workbook.sheets[sheet], config) {
        Some(header_row) => Resolution::Resolved {
            sheet,
            rule,
            header_row,
            header_detected: true,
        },
        None => Resolution::Resolved {
            sheet,
            rule,
            header_row: config.fallback_header_row,
            header_detected: false,
        },
    }
}

// =============================================================================
// LOADING
// =============================================================================

/// Turns the rows below `header_row` into a raw table stamped with `year`.
///
/// Blank rows are skipped. Zero remaining rows is an `EmptyLoad` error.
pub fn load_table(sheet: &SheetGrid, header_row: usize, year: i32, source: &Path) -> Result<RawTable> {
    let empty = Vec::new();
    let header_cells = sheet.rows.get(header_row).unwrap_or(&empty);

    let data_rows: Vec<&Vec<Data>> = sheet
        .rows
        .iter()
        .skip(header_row + 1)
        .filter(|row| !is_blank_row(row))
        .collect();

    if data_rows.is_empty() {
        return Err(PipelineError::EmptyLoad {
            path: source.to_path_buf(),
            header_row,
        });
    }

    let width = data_rows
        .iter()
        .map(|r| r.len())
        .chain(std::iter::once(header_cells.len()))
        .max()
        .unwrap_or(0);

    let mut headers: Vec<String> = (0..width)
        .map(|idx| {
            header_cells
                .get(idx)
                .and_then(cell_text)
                .unwrap_or_else(|| format!("Unnamed: {}", idx))
        })
        .collect();

    // Any source column that cleans to `reporting_year` carries the stamp, whatever its spelling.
    let mut year_idxs: Vec<usize> = headers
        .iter()
        .enumerate()
        .filter(|(_, h)| canonical_column_name(h) == REPORTING_YEAR_COLUMN)
        .map(|(idx, _)| idx)
        .collect();
    if year_idxs.is_empty() {
        headers.push(REPORTING_YEAR_COLUMN.to_string());
        year_idxs.push(headers.len() - 1);
    }

    let rows = data_rows
        .into_iter()
        .map(|row| {
            let mut cells = row.clone();
            cells.resize(headers.len(), Data::Empty);
            for &idx in &year_idxs {
                cells[idx] = Data::Int(i64::from(year));
            }
            cells
        })
        .collect();

    Ok(RawTable {
        source: source.to_path_buf(),
        year,
        sheet: sheet.name.clone(),
        header_row,
        headers,
        rows,
    })
}

/// Reads, resolves and loads one source file.
pub fn load_source(source: &SourceFile, config: &ResolverConfig) -> Result<(RawTable, Resolution)> {
    let workbook = read_workbook(source)?;
    let resolution = resolve(&workbook, config);

    let (sheet, header_row) = match &resolution {
        Resolution::Resolved {
            sheet, header_row, ..
        } => (*sheet, *header_row),
        Resolution::Failed(reason) => {
            return Err(PipelineError::Resolution {
                path: source.path.clone(),
                reason: reason.clone(),
            })
        }
    };

    let table = load_table(&workbook.sheets[sheet], header_row, source.year, &source.path)?;
    info!(
        file = %source.file_name(),
        sheet = %table.sheet,
        header_row,
        rows = table.rows.len(),
        columns = table.headers.len(),
        "loaded source"
    );
    Ok((table, resolution))
}
