//! CSV and JSON writers for every pipeline artifact.

use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::aggregate::{facility_export, EntityFeatures, EntityKind, YearAggregate, FEATURE_COLUMNS};
use crate::clean::CleanedTable;
use crate::error::Result;
use crate::similarity::SimilarityMatrix;

pub const CLEAN_FILE: &str = "ghg_all_years_clean.csv";
pub const FACILITY_FILE: &str = "ghg_facility_clean.csv";
pub const REPORT_FILE: &str = "run_report.json";

pub fn year_file(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Region => "ghg_state_year.csv",
        EntityKind::Sector => "ghg_sector_year.csv",
    }
}

pub fn features_file(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Region => "ghg_state_features.csv",
        EntityKind::Sector => "ghg_sector_features.csv",
    }
}

pub fn similarity_file(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Region => "similarity_states.csv",
        EntityKind::Sector => "similarity_sectors.csv",
    }
}

fn write_rows<I>(path: &Path, header: &[String], rows: I) -> Result<usize>
where
    I: IntoIterator<Item = Vec<String>>,
{
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(header)?;
    let mut written = 0;
    for row in rows {
        writer.write_record(&row)?;
        written += 1;
    }
    writer.flush()?;
    debug!(path = %path.display(), rows = written, "wrote csv");
    Ok(written)
}

pub fn write_cleaned(path: &Path, table: &CleanedTable) -> Result<usize> {
    write_rows(path, &table.header(), table.to_rows())
}

pub fn write_facility_export(path: &Path, table: &CleanedTable) -> Result<usize> {
    let (header, rows) = facility_export(table);
    write_rows(path, &header, rows)
}

pub fn write_year_aggregates(path: &Path, kind: EntityKind, rows: &[YearAggregate]) -> Result<usize> {
    let header: Vec<String> = [kind.id_column(), "year", "total_emissions", "co2", "ch4", "n2o", "facility_count"]
        .iter()
        .map(|h| h.to_string())
        .collect();
    let body = rows.iter().map(|r| {
        vec![
            r.entity.clone(),
            r.year.to_string(),
            r.totals.total_emissions.to_string(),
            r.totals.co2.to_string(),
            r.totals.ch4.to_string(),
            r.totals.n2o.to_string(),
            r.facility_count.to_string(),
        ]
    });
    write_rows(path, &header, body)
}

pub fn write_features(path: &Path, kind: EntityKind, features: &[EntityFeatures]) -> Result<usize> {
    let header: Vec<String> = std::iter::once(kind.id_column())
        .chain(FEATURE_COLUMNS)
        .map(str::to_string)
        .collect();
    let body = features.iter().map(|f| {
        let mut row = vec![f.entity.clone()];
        // facility_count stays an integer in the file.
        row.extend(f.values().iter().enumerate().map(|(idx, v)| {
            if FEATURE_COLUMNS[idx] == "facility_count" {
                f.facility_count.to_string()
            } else {
                v.to_string()
            }
        }));
        row
    });
    write_rows(path, &header, body)
}

/// Identifier column, then one column per entity in matrix order.
pub fn write_similarity(path: &Path, id_column: &str, matrix: &SimilarityMatrix) -> Result<usize> {
    let header: Vec<String> = std::iter::once(id_column.to_string())
        .chain(matrix.entities.iter().cloned())
        .collect();
    let body = matrix.entities.iter().enumerate().map(|(i, entity)| {
        std::iter::once(entity.clone())
            .chain(matrix.row(i).iter().map(f64::to_string))
            .collect::<Vec<String>>()
    });
    write_rows(path, &header, body)
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}

/// Collects written file paths; a dry run records nothing and touches nothing.
#[derive(Debug, Clone)]
pub struct OutputDir {
    root: PathBuf,
    dry_run: bool,
    pub written: Vec<PathBuf>,
}

impl OutputDir {
    pub fn new(root: impl Into<PathBuf>, dry_run: bool) -> Self {
        Self {
            root: root.into(),
            dry_run,
            written: Vec::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Runs `write` against `<root>/<file>` unless this is a dry run.
    pub fn emit<F>(&mut self, file: &str, write: F) -> Result<()>
    where
        F: FnOnce(&Path) -> Result<usize>,
    {
        if self.dry_run {
            return Ok(());
        }
        let path = self.root.join(file);
        write(&path)?;
        self.written.push(path);
        Ok(())
    }
}
