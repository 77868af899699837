//! Source discovery: one spreadsheet per reporting year, year taken from the file name.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::Result;

/// Extensions calamine can open, plus plain CSV exports.
pub const SUPPORTED_EXTENSIONS: &[&str] = &["xlsx", "xlsm", "xlsb", "xls", "ods", "csv"];

/// A located yearly source file with its provenance.
#[derive(Debug, Clone, Serialize)]
pub struct SourceFile {
    pub path: PathBuf,
    pub year: i32,
    pub size_bytes: u64,
    pub content_hash: String,
}

impl SourceFile {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn is_csv(&self) -> bool {
        extension_of(&self.path).as_deref() == Some("csv")
    }
}

/// First run of four consecutive ASCII digits in the name, e.g. `ghgp_data_2019.xlsx` -> 2019.
pub fn extract_year(file_name: &str) -> Option<i32> {
    let bytes = file_name.as_bytes();
    bytes
        .windows(4)
        .position(|w| w.iter().all(u8::is_ascii_digit))
        .and_then(|start| file_name[start..start + 4].parse().ok())
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
}

fn is_supported(path: &Path) -> bool {
    extension_of(path)
        .map(|ext| SUPPORTED_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

fn hash_file(path: &Path) -> Result<String> {
    let bytes = fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("sha256:{:x}", hasher.finalize()))
}

/// Result of scanning the raw directory.
#[derive(Debug, Clone, Default)]
pub struct SourceScan {
    /// Readable sources, ascending by (year, path).
    pub sources: Vec<SourceFile>,
    /// Files that could not be described, as (path, error message).
    pub unreadable: Vec<(PathBuf, String)>,
    /// Human-readable notes for the run report, already logged.
    pub warnings: Vec<String>,
}

fn describe(path: PathBuf, year: i32) -> Result<SourceFile> {
    let size_bytes = fs::metadata(&path)?.len();
    let content_hash = hash_file(&path)?;
    Ok(SourceFile {
        path,
        year,
        size_bytes,
        content_hash,
    })
}

/// Lists supported files in `dir` that carry a year, ascending by (year, file name).
///
/// An empty directory yields an empty scan; a missing directory is an I/O error. A file
/// whose metadata or content cannot be read is skipped and listed in `unreadable`.
pub fn locate_sources(dir: &Path) -> Result<SourceScan> {
    let mut scan = SourceScan::default();

    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() || !is_supported(&path) {
            continue;
        }
        let name = match path.file_name() {
            Some(n) => n.to_string_lossy().into_owned(),
            None => continue,
        };
        let Some(year) = extract_year(&name) else {
            debug!(file = %name, "no 4-digit year in file name, ignoring");
            continue;
        };

        match describe(path.clone(), year) {
            Ok(source) => scan.sources.push(source),
            Err(err) => {
                warn!(file = %name, error = %err, "cannot read source file, skipping");
                scan.warnings.push(format!("skipped {}: {}", name, err));
                scan.unreadable.push((path, err.to_string()));
            }
        }
    }

    scan.sources
        .sort_by(|a, b| a.year.cmp(&b.year).then_with(|| a.path.cmp(&b.path)));

    for pair in scan.sources.windows(2) {
        if pair[0].year == pair[1].year {
            warn!(
                year = pair[0].year,
                first = %pair[0].file_name(),
                second = %pair[1].file_name(),
                "multiple source files share a reporting year"
            );
            scan.warnings.push(format!(
                "{} and {} share reporting year {}; both are loaded",
                pair[0].file_name(),
                pair[1].file_name(),
                pair[0].year
            ));
        }
    }

    Ok(scan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(dir: &TempDir, name: &str, content: &str) {
        fs::write(dir.path().join(name), content).unwrap();
    }

    #[test]
    fn test_extract_year() {
        assert_eq!(extract_year("ghgp_data_2019.xlsx"), Some(2019));
        assert_eq!(extract_year("2010_ghgp.xlsx"), Some(2010));
        assert_eq!(extract_year("data_v1_2023_final.csv"), Some(2023));
        assert_eq!(extract_year("ghgp_data.xlsx"), None);
        assert_eq!(extract_year("ghgp_201.xlsx"), None);
    }

    #[test]
    fn test_extract_year_takes_first_run() {
        assert_eq!(extract_year("ghgp_2015_rev2021.xlsx"), Some(2015));
        assert_eq!(extract_year("ghgp_123456.xlsx"), Some(1234));
    }

    #[test]
    fn test_locate_orders_by_year_and_skips_unyeared() {
        let dir = TempDir::new().unwrap();
        touch(&dir, "ghgp_data_2021.csv", "Facility Id\n1\n");
        touch(&dir, "ghgp_data_2011.csv", "Facility Id\n1\n");
        touch(&dir, "ghgp_data_2015.csv", "Facility Id\n1\n");
        touch(&dir, "readme.csv", "no year here\n");
        touch(&dir, "notes_2012.txt", "unsupported extension\n");

        let sources = locate_sources(dir.path()).unwrap().sources;
        let years: Vec<i32> = sources.iter().map(|s| s.year).collect();
        assert_eq!(years, vec![2011, 2015, 2021]);
        assert!(sources.iter().all(|s| s.is_csv()));
    }

    #[test]
    fn test_locate_empty_directory_is_quiet() {
        let dir = TempDir::new().unwrap();
        let sources = locate_sources(dir.path()).unwrap().sources;
        assert!(sources.is_empty());
    }

    #[test]
    fn test_locate_missing_directory_errors() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("does-not-exist");
        assert!(locate_sources(&missing).is_err());
    }

    #[test]
    fn test_provenance_hash_is_stable() {
        let dir = TempDir::new().unwrap();
        touch(&dir, "ghgp_data_2020.csv", "Facility Id,State\n1,TX\n");

        let first = locate_sources(dir.path()).unwrap().sources;
        let second = locate_sources(dir.path()).unwrap().sources;
        assert!(first[0].content_hash.starts_with("sha256:"));
        assert_eq!(first[0].content_hash, second[0].content_hash);
        assert_eq!(first[0].size_bytes, 23);
    }

    #[test]
    fn test_duplicate_years_are_warned_once_per_pair() {
        let dir = TempDir::new().unwrap();
        touch(&dir, "ghgp_data_2019.csv", "Facility Id\n1\n");
        touch(&dir, "ghgp_data_2019_rev.csv", "Facility Id\n2\n");

        let scan = locate_sources(dir.path()).unwrap();
        assert_eq!(scan.sources.len(), 2);
        assert_eq!(scan.warnings.len(), 1);
        assert!(scan.warnings[0].contains("share reporting year 2019"));
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_file_is_skipped_not_fatal() {
        let dir = TempDir::new().unwrap();
        touch(&dir, "ghgp_data_2018.csv", "Facility Id\n1\n");
        // Dangling link: named like a source, but metadata cannot be read.
        std::os::unix::fs::symlink(
            dir.path().join("gone.csv"),
            dir.path().join("ghgp_data_2019.csv"),
        )
        .unwrap();

        let scan = locate_sources(dir.path()).unwrap();
        assert_eq!(scan.sources.len(), 1);
        assert_eq!(scan.sources[0].year, 2018);
        assert_eq!(scan.unreadable.len(), 1);
        assert!(scan.unreadable[0].0.ends_with("ghgp_data_2019.csv"));
        assert!(scan.warnings[0].contains("ghgp_data_2019.csv"));
    }
}
