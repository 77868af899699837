use std::path::PathBuf;

/// Token that identifies the facility-level sheet and its header row.
pub const DEFAULT_ANCHOR: &str = "Facility Id";

/// Knobs for the sheet/header heuristics.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolverConfig {
    pub anchor: String,
    /// Rows inspected per sheet when looking for the anchor.
    pub sheet_scan_rows: usize,
    /// Rows inspected in the selected sheet when looking for the header.
    pub header_scan_rows: usize,
    /// Header row used when the anchor is not found. Observed layout, not a guarantee.
    pub fallback_header_row: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            anchor: DEFAULT_ANCHOR.to_string(),
            sheet_scan_rows: 5,
            header_scan_rows: 10,
            fallback_header_row: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub raw_dir: PathBuf,
    pub out_dir: PathBuf,
    pub resolver: ResolverConfig,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from any key lookup; unset or unparsable values fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = ResolverConfig::default();
        let number = |key: &str, default: usize| {
            lookup(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };

        Self {
            raw_dir: PathBuf::from(lookup("GHG_RAW_DIR").unwrap_or_else(|| "./data_raw".to_string())),
            out_dir: PathBuf::from(
                lookup("GHG_OUT_DIR").unwrap_or_else(|| "./data_processed".to_string()),
            ),
            resolver: ResolverConfig {
                anchor: lookup("GHG_ANCHOR")
                    .filter(|a| !a.trim().is_empty())
                    .unwrap_or(defaults.anchor),
                sheet_scan_rows: number("GHG_SHEET_SCAN_ROWS", defaults.sheet_scan_rows),
                header_scan_rows: number("GHG_HEADER_SCAN_ROWS", defaults.header_scan_rows),
                fallback_header_row: number("GHG_FALLBACK_HEADER_ROW", defaults.fallback_header_row),
            },
        }
    }
}
