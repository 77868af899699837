//! Run report: one record per run, one entry per stage, written as JSON next to the outputs.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::source::SourceFile;
use crate::workbook::{Resolution, SheetRule};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Ok,
    Failed,
}

/// Outcome of one located source file.
#[derive(Debug, Clone, Serialize)]
pub struct SourceOutcome {
    #[serde(flatten)]
    pub source: SourceFile,
    pub status: RunStatus,
    pub sheet: Option<String>,
    pub sheet_rule: Option<String>,
    pub header_row: Option<usize>,
    pub header_detected: Option<bool>,
    pub rows: usize,
    pub error: Option<String>,
}

impl SourceOutcome {
    pub fn loaded(source: SourceFile, sheet: &str, resolution: &Resolution, rows: usize) -> Self {
        let (rule, header_row, header_detected) = match resolution {
            Resolution::Resolved {
                rule,
                header_row,
                header_detected,
                ..
            } => (Some(rule_label(*rule)), Some(*header_row), Some(*header_detected)),
            Resolution::Failed(_) => (None, None, None),
        };
        Self {
            source,
            status: RunStatus::Ok,
            sheet: Some(sheet.to_string()),
            sheet_rule: rule.map(str::to_string),
            header_row,
            header_detected,
            rows,
            error: None,
        }
    }

    pub fn skipped(source: SourceFile, err: &PipelineError) -> Self {
        Self {
            source,
            status: RunStatus::Failed,
            sheet: None,
            sheet_rule: None,
            header_row: None,
            header_detected: None,
            rows: 0,
            error: Some(err.to_string()),
        }
    }
}

fn rule_label(rule: SheetRule) -> &'static str {
    match rule {
        SheetRule::AnchorInContent => "anchor_in_content",
        SheetRule::NameKeywords => "name_keywords",
        SheetRule::FirstSheet => "first_sheet",
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub stage: String,
    pub status: RunStatus,
    pub processed: usize,
    pub skipped: usize,
    pub corrected: usize,
    pub detail: serde_json::Value,
    pub error: Option<String>,
    pub error_category: Option<&'static str>,
}

impl StageReport {
    pub fn ok(stage: &str, processed: usize) -> Self {
        Self {
            stage: stage.to_string(),
            status: RunStatus::Ok,
            processed,
            skipped: 0,
            corrected: 0,
            detail: serde_json::Value::Null,
            error: None,
            error_category: None,
        }
    }

    pub fn failed(stage: &str, err: &PipelineError) -> Self {
        Self {
            status: RunStatus::Failed,
            error: Some(err.to_string()),
            error_category: Some(err.category()),
            ..Self::ok(stage, 0)
        }
    }

    pub fn with_skipped(mut self, skipped: usize) -> Self {
        self.skipped = skipped;
        self
    }

    pub fn with_corrected(mut self, corrected: usize) -> Self {
        self.corrected = corrected;
        self
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub component: &'static str,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub raw_dir: PathBuf,
    pub out_dir: PathBuf,
    pub dry_run: bool,
    pub sources: Vec<SourceOutcome>,
    pub stages: Vec<StageReport>,
    pub warnings: Vec<String>,
    pub outputs: Vec<PathBuf>,
}

impl RunReport {
    pub fn start(raw_dir: &Path, out_dir: &Path, dry_run: bool) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            component: "pipeline",
            started_at: Utc::now(),
            finished_at: None,
            status: RunStatus::Running,
            raw_dir: raw_dir.to_path_buf(),
            out_dir: out_dir.to_path_buf(),
            dry_run,
            sources: Vec::new(),
            stages: Vec::new(),
            warnings: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn push_stage(&mut self, stage: StageReport) {
        self.stages.push(stage);
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn failed_stages(&self) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|s| s.status == RunStatus::Failed)
            .map(|s| s.stage.as_str())
            .collect()
    }

    /// Stamps the finish time; the run is failed if any stage failed.
    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
        self.status = if self.failed_stages().is_empty() {
            RunStatus::Ok
        } else {
            RunStatus::Failed
        };
    }
}
