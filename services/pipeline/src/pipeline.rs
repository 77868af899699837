//! Stage orchestration: locate -> load -> clean -> aggregate -> similarity.
//!
//! Stages run strictly in sequence. A per-file failure skips that file; any
//! other failure stops the stage and everything downstream, except that the
//! region and sector similarity stages are independent of each other.

use serde_json::json;
use std::path::PathBuf;
use tracing::{error, info, warn};

use crate::aggregate::{
    conservation_mismatches, entity_features, feature_table, national_totals, region_year,
    sector_year, EntityKind, NationalTotal, YearAggregate,
};
use crate::clean::{clean_tables, CleanedTable};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::output::{self, OutputDir};
use crate::report::{RunReport, SourceOutcome, StageReport};
use crate::similarity::{cosine_similarity_matrix, SimilarityMatrix};
use crate::source::locate_sources;
use crate::workbook::{load_source, RawTable};

/// Everything a successful run computed.
#[derive(Debug, Clone)]
pub struct PipelineOutputs {
    pub cleaned: CleanedTable,
    pub region_year: Vec<YearAggregate>,
    pub sector_year: Vec<YearAggregate>,
    pub national: Vec<NationalTotal>,
    /// `None` when that similarity stage failed.
    pub region_similarity: Option<SimilarityMatrix>,
    pub sector_similarity: Option<SimilarityMatrix>,
}

/// Records a failed stage before handing the error back.
fn stage<T>(report: &mut RunReport, name: &str, result: Result<T>) -> Result<T> {
    if let Err(err) = &result {
        error!(stage = name, category = err.category(), error = %err, "stage failed");
        report.push_stage(StageReport::failed(name, err));
    }
    result
}

fn load_all(config: &PipelineConfig, report: &mut RunReport) -> Result<Vec<RawTable>> {
    let scan = stage(report, "locate", locate_sources(&config.raw_dir))?;
    info!(
        dir = %config.raw_dir.display(),
        files = scan.sources.len(),
        unreadable = scan.unreadable.len(),
        "located source files"
    );
    report.push_stage(
        StageReport::ok("locate", scan.sources.len()).with_skipped(scan.unreadable.len()),
    );
    for warning in scan.warnings {
        report.warn(warning);
    }

    let mut tables = Vec::new();
    let mut skipped = scan.unreadable.len();
    for source in scan.sources {
        match load_source(&source, &config.resolver) {
            Ok((table, resolution)) => {
                report.sources.push(SourceOutcome::loaded(
                    source,
                    &table.sheet,
                    &resolution,
                    table.rows.len(),
                ));
                tables.push(table);
            }
            Err(err) => {
                if err.is_per_file() {
                    warn!(file = %source.file_name(), error = %err, "skipping source");
                } else {
                    error!(file = %source.file_name(), error = %err, "skipping unreadable source");
                }
                report.warn(format!("skipped {}: {}", source.file_name(), err));
                report.sources.push(SourceOutcome::skipped(source, &err));
                skipped += 1;
            }
        }
    }

    if tables.is_empty() {
        return stage(
            report,
            "load",
            Err(PipelineError::NoSourcesLoaded(config.raw_dir.clone())),
        );
    }

    let rows: usize = tables.iter().map(|t| t.rows.len()).sum();
    report.push_stage(
        StageReport::ok("load", tables.len())
            .with_skipped(skipped)
            .with_detail(json!({ "rows": rows })),
    );
    Ok(tables)
}

fn similarity_stage(
    kind: EntityKind,
    cleaned: &CleanedTable,
    out: &mut OutputDir,
    report: &mut RunReport,
) -> Option<SimilarityMatrix> {
    let name = match kind {
        EntityKind::Region => "similarity_states",
        EntityKind::Sector => "similarity_sectors",
    };

    let result = (|| -> Result<SimilarityMatrix> {
        let features = entity_features(cleaned, kind)?;
        out.emit(output::features_file(kind), |p| output::write_features(p, kind, &features))?;
        let matrix = cosine_similarity_matrix(&feature_table(&features, kind)?)?;
        out.emit(output::similarity_file(kind), |p| {
            output::write_similarity(p, kind.id_column(), &matrix)
        })?;
        Ok(matrix)
    })();

    let matrix = stage(report, name, result).ok()?;
    info!(stage = name, entities = matrix.len(), "computed similarity matrix");
    report.push_stage(StageReport::ok(name, matrix.len()));
    Some(matrix)
}

fn run_stages(
    config: &PipelineConfig,
    out: &mut OutputDir,
    report: &mut RunReport,
) -> Result<PipelineOutputs> {
    let tables = load_all(config, report)?;

    let (cleaned, cleaning) = stage(report, "clean", clean_tables(&tables))?;
    drop(tables);
    let written = out
        .emit(output::CLEAN_FILE, |p| output::write_cleaned(p, &cleaned))
        .and_then(|_| out.emit(output::FACILITY_FILE, |p| output::write_facility_export(p, &cleaned)));
    stage(report, "clean", written)?;
    report.push_stage(
        StageReport::ok("clean", cleaning.output_rows)
            .with_skipped(cleaning.dropped_missing_id)
            .with_corrected(cleaning.corrected_values())
            .with_detail(serde_json::to_value(&cleaning)?),
    );

    let aggregates = region_year(&cleaned).and_then(|r| Ok((r, sector_year(&cleaned)?)));
    let (region, sector) = stage(report, "aggregate", aggregates)?;
    let national = national_totals(&cleaned);
    for (kind, rows) in [(EntityKind::Region, &region), (EntityKind::Sector, &sector)] {
        for year in conservation_mismatches(rows, &national) {
            warn!(year, grouping = kind.id_column(), "aggregates do not sum to the national total");
            report.warn(format!(
                "{} aggregates for {} do not sum to the national total",
                kind.id_column(),
                year
            ));
        }
    }
    let written = out
        .emit(output::year_file(EntityKind::Region), |p| {
            output::write_year_aggregates(p, EntityKind::Region, &region)
        })
        .and_then(|_| {
            out.emit(output::year_file(EntityKind::Sector), |p| {
                output::write_year_aggregates(p, EntityKind::Sector, &sector)
            })
        });
    stage(report, "aggregate", written)?;
    report.push_stage(
        StageReport::ok("aggregate", region.len() + sector.len())
            .with_detail(json!({ "national_totals": national })),
    );

    let region_similarity = similarity_stage(EntityKind::Region, &cleaned, out, report);
    let sector_similarity = similarity_stage(EntityKind::Sector, &cleaned, out, report);

    Ok(PipelineOutputs {
        cleaned,
        region_year: region,
        sector_year: sector,
        national,
        region_similarity,
        sector_similarity,
    })
}

/// Runs every stage. The report is always returned, finished, alongside the outcome.
pub fn run_pipeline(config: &PipelineConfig, dry_run: bool) -> (RunReport, Result<PipelineOutputs>) {
    let mut report = RunReport::start(&config.raw_dir, &config.out_dir, dry_run);
    let mut out = OutputDir::new(&config.out_dir, dry_run);
    info!(
        run_id = %report.run_id,
        raw_dir = %config.raw_dir.display(),
        out_dir = %out.root().display(),
        dry_run,
        "starting pipeline run"
    );

    let result = run_stages(config, &mut out, &mut report);

    report.outputs = out.written;
    report.finish();
    (report, result)
}

/// Writes `run_report.json` into the output directory; dry runs write nothing.
pub fn write_report(report: &RunReport) -> Result<Option<PathBuf>> {
    if report.dry_run {
        return Ok(None);
    }
    let path = report.out_dir.join(output::REPORT_FILE);
    output::write_json(&path, report)?;
    Ok(Some(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResolverConfig;
    use crate::report::RunStatus;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    const HEADER: &str = "Facility Id,Facility Name,State,Industry Type (sectors),\
Total reported direct emissions,CO2 emissions (non-biogenic) ,Methane (CH4) emissions ,\
Nitrous Oxide (N2O) emissions ";

    fn write_source(dir: &Path, name: &str, header_row: usize, rows: &[&str]) {
        let mut lines: Vec<String> = (0..header_row)
            .map(|i| format!("Greenhouse Gas Reporting Program note {},", i))
            .collect();
        lines.push(HEADER.to_string());
        lines.extend(rows.iter().map(|r| r.to_string()));
        fs::write(dir.join(name), lines.join("\n") + "\n").unwrap();
    }

    fn config(raw: &Path, out: &Path) -> PipelineConfig {
        PipelineConfig {
            raw_dir: raw.to_path_buf(),
            out_dir: out.to_path_buf(),
            resolver: ResolverConfig::default(),
        }
    }

    fn setup() -> (TempDir, PipelineConfig) {
        let dir = TempDir::new().unwrap();
        let raw = dir.path().join("raw");
        fs::create_dir_all(&raw).unwrap();
        write_source(
            &raw,
            "ghgp_data_2019.csv",
            3,
            &[
                "1001,Plant A,Texas,Power Plants,100,80,10,1",
                "1002,Plant B,TX,Waste,50,-5,40,2",
                "1003,Plant C,Oklahoma,Power Plants,20,15,3,0.5",
            ],
        );
        write_source(
            &raw,
            "ghgp_data_2020.csv",
            5,
            &[
                "1001,Plant A,TX,Power Plants,90,70,9,1",
                ",Orphan,TX,Waste,1000,900,50,5",
                "1003,Plant C,OK,Power Plants,25,20,4,0.5",
            ],
        );
        let out = dir.path().join("out");
        let config = config(&raw, &out);
        (dir, config)
    }

    // -------------------------------------------------------------------------
    // END-TO-END TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_full_run_writes_every_artifact() {
        let (_dir, config) = setup();
        let (report, result) = run_pipeline(&config, false);
        let outputs = result.unwrap();

        assert_eq!(report.status, RunStatus::Ok);
        assert_eq!(outputs.cleaned.len(), 5);

        let tx_2019 = outputs
            .region_year
            .iter()
            .find(|r| r.entity == "TX" && r.year == 2019)
            .unwrap();
        assert_eq!(tx_2019.totals.total_emissions, 150.0);
        assert_eq!(tx_2019.totals.co2, 80.0);
        assert_eq!(tx_2019.facility_count, 2);

        let tx_2020 = outputs
            .region_year
            .iter()
            .find(|r| r.entity == "TX" && r.year == 2020)
            .unwrap();
        assert_eq!(tx_2020.totals.total_emissions, 90.0);

        let states = outputs.region_similarity.unwrap();
        assert_eq!(states.entities, vec!["OK", "TX"]);
        assert!(outputs.sector_similarity.is_some());

        for file in [
            output::CLEAN_FILE,
            output::FACILITY_FILE,
            "ghg_state_year.csv",
            "ghg_sector_year.csv",
            "ghg_state_features.csv",
            "ghg_sector_features.csv",
            "similarity_states.csv",
            "similarity_sectors.csv",
        ] {
            assert!(config.out_dir.join(file).exists(), "missing {}", file);
        }
        assert_eq!(report.outputs.len(), 8);

        let clean = report.stages.iter().find(|s| s.stage == "clean").unwrap();
        assert_eq!(clean.skipped, 1);
        assert_eq!(clean.corrected, 1);

        let written = write_report(&report).unwrap().unwrap();
        let json: serde_json::Value = serde_json::from_str(&fs::read_to_string(written).unwrap()).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["sources"].as_array().unwrap().len(), 2);
        assert_eq!(json["sources"][1]["header_row"], 5);
    }

    #[test]
    fn test_mass_conservation_end_to_end() {
        let (_dir, config) = setup();
        let (_, result) = run_pipeline(&config, true);
        let outputs = result.unwrap();
        for n in &outputs.national {
            for rows in [&outputs.region_year, &outputs.sector_year] {
                let summed: f64 = rows
                    .iter()
                    .filter(|r| r.year == n.year)
                    .map(|r| r.totals.total_emissions)
                    .sum();
                assert!((summed - n.total_emissions).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn test_dry_run_writes_nothing() {
        let (_dir, config) = setup();
        let (report, result) = run_pipeline(&config, true);
        assert!(result.is_ok());
        assert!(report.outputs.is_empty());
        assert!(!config.out_dir.exists());
        assert_eq!(write_report(&report).unwrap(), None);
    }

    #[test]
    fn test_bad_file_is_skipped_and_reported() {
        let (_dir, config) = setup();
        write_source(&config.raw_dir, "ghgp_data_2021.csv", 3, &[]);
        let (report, result) = run_pipeline(&config, true);

        assert!(result.is_ok());
        let load = report.stages.iter().find(|s| s.stage == "load").unwrap();
        assert_eq!(load.processed, 2);
        assert_eq!(load.skipped, 1);
        assert_eq!(report.sources.len(), 3);
        assert_eq!(report.sources[2].status, RunStatus::Failed);
        assert!(report.warnings.iter().any(|w| w.contains("ghgp_data_2021.csv")));
    }

    #[test]
    fn test_no_loadable_sources_fails_run() {
        let dir = TempDir::new().unwrap();
        let raw = dir.path().join("raw");
        fs::create_dir_all(&raw).unwrap();
        write_source(&raw, "ghgp_data_2019.csv", 3, &[]);
        let config = config(&raw, &dir.path().join("out"));

        let (report, result) = run_pipeline(&config, false);

        assert!(matches!(result, Err(PipelineError::NoSourcesLoaded(_))));
        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.failed_stages(), vec!["load"]);
        let written = write_report(&report).unwrap().unwrap();
        assert!(written.ends_with(output::REPORT_FILE));
    }

    #[test]
    fn test_missing_raw_dir_fails_locate() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir.path().join("absent"), &dir.path().join("out"));
        let (report, result) = run_pipeline(&config, true);
        assert!(matches!(result, Err(PipelineError::Io(_))));
        assert_eq!(report.failed_stages(), vec!["locate"]);
    }

    #[test]
    fn test_single_entity_similarity_still_runs() {
        let dir = TempDir::new().unwrap();
        let raw = dir.path().join("raw");
        fs::create_dir_all(&raw).unwrap();
        write_source(&raw, "ghgp_data_2019.csv", 3, &["1,A,WY,Waste,10,5,1,0"]);
        let config = config(&raw, &dir.path().join("out"));

        let (report, result) = run_pipeline(&config, true);
        let outputs = result.unwrap();
        let states = outputs.region_similarity.unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states.get(0, 0), 1.0);
        assert_eq!(report.status, RunStatus::Ok);
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_source_does_not_abort_run() {
        let (_dir, config) = setup();
        std::os::unix::fs::symlink(
            config.raw_dir.join("missing.csv"),
            config.raw_dir.join("ghgp_data_2021.csv"),
        )
        .unwrap();

        let (report, result) = run_pipeline(&config, true);

        assert_eq!(result.unwrap().cleaned.len(), 5);
        assert_eq!(report.status, RunStatus::Ok);
        let locate = report.stages.iter().find(|s| s.stage == "locate").unwrap();
        assert_eq!(locate.skipped, 1);
        let load = report.stages.iter().find(|s| s.stage == "load").unwrap();
        assert_eq!(load.processed, 2);
        assert_eq!(load.skipped, 1);
        assert!(report.warnings.iter().any(|w| w.contains("ghgp_data_2021.csv")));
    }

    #[test]
    fn test_duplicate_year_warning_reported_once() {
        let (_dir, config) = setup();
        write_source(&config.raw_dir, "ghgp_data_2019_b.csv", 3, &["2001,Plant Z,WY,Waste,5,5,0,0"]);

        let (report, result) = run_pipeline(&config, true);

        assert!(result.is_ok());
        let duplicates: Vec<&String> = report
            .warnings
            .iter()
            .filter(|w| w.contains("share reporting year 2019"))
            .collect();
        assert_eq!(duplicates.len(), 1);
    }
}
