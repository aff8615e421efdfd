//! Structured per-task reports and the final exit code derivation.

use std::path::{Path, PathBuf};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    UnknownError,
    ExtractCommandFailed,
    UnsafeSymlink,
    EncryptedChunk,
    ChunkOutOfBounds,
    InvalidPath,
    ExtractDirExists,
}

/// One observation made while processing a task.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub severity: Severity,
    pub kind: ReportKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_range: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl Report {
    pub fn unknown_error(path: &Path, error: &dyn std::fmt::Display) -> Self {
        Self {
            severity: Severity::Error,
            kind: ReportKind::UnknownError,
            path: Some(path.to_path_buf()),
            chunk_range: None,
            message: "unexpected error while processing task".to_string(),
            details: Some(error.to_string()),
        }
    }

    pub fn extract_command_failed(command: &str, details: String) -> Self {
        Self {
            severity: Severity::Error,
            kind: ReportKind::ExtractCommandFailed,
            path: None,
            chunk_range: None,
            message: format!("extract command failed: {command}"),
            details: Some(details),
        }
    }

    pub fn unsafe_symlink(path: &Path, target: &Path) -> Self {
        Self {
            severity: Severity::Warning,
            kind: ReportKind::UnsafeSymlink,
            path: Some(path.to_path_buf()),
            chunk_range: None,
            message: "symlink points outside the extraction directory".to_string(),
            details: Some(target.display().to_string()),
        }
    }

    pub fn encrypted_chunk(path: &Path, chunk_range: String) -> Self {
        Self {
            severity: Severity::Warning,
            kind: ReportKind::EncryptedChunk,
            path: Some(path.to_path_buf()),
            chunk_range: Some(chunk_range),
            message: "encrypted chunk is not extracted".to_string(),
            details: None,
        }
    }

    pub fn chunk_out_of_bounds(path: &Path, chunk_range: String, file_size: u64) -> Self {
        Self {
            severity: Severity::Warning,
            kind: ReportKind::ChunkOutOfBounds,
            path: Some(path.to_path_buf()),
            chunk_range: Some(chunk_range),
            message: format!("handler returned a chunk beyond the file size 0x{file_size:x}"),
            details: None,
        }
    }

    pub fn invalid_path(path: &Path) -> Self {
        Self {
            severity: Severity::Warning,
            kind: ReportKind::InvalidPath,
            path: Some(path.to_path_buf()),
            chunk_range: None,
            message: "path contains invalid characters, it won't be processed".to_string(),
            details: None,
        }
    }

    pub fn extract_dir_exists(path: &Path) -> Self {
        Self {
            severity: Severity::Error,
            kind: ReportKind::ExtractDirExists,
            path: Some(path.to_path_buf()),
            chunk_range: None,
            message: "extraction directory already exists and is not empty".to_string(),
            details: None,
        }
    }
}

/// Ordered, append-only collection of reports.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct Reports {
    reports: Vec<Report>,
}

impl Reports {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, report: Report) {
        self.reports.push(report);
    }

    pub fn extend(&mut self, other: Reports) {
        self.reports.extend(other.reports);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Report> {
        self.reports.iter()
    }

    pub fn len(&self) -> usize {
        self.reports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }

    /// ERROR present -> 1, otherwise 0. Warnings never change the exit code.
    pub fn exit_code(&self) -> i32 {
        if self
            .reports
            .iter()
            .any(|report| report.severity == Severity::Error)
        {
            1
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn exit_code_only_reacts_to_errors() {
        let mut reports = Reports::new();
        assert_eq!(reports.exit_code(), 0);

        reports.append(Report::invalid_path(Path::new("bad\u{7f}name")));
        assert_eq!(reports.exit_code(), 0, "warnings keep the exit code at 0");

        reports.append(Report::extract_command_failed("unzip", "status 9".into()));
        assert_eq!(reports.exit_code(), 1);
    }

    #[test]
    fn extend_concatenates_in_order() {
        let mut left = Reports::new();
        left.append(Report::invalid_path(Path::new("a")));
        let mut right = Reports::new();
        right.append(Report::invalid_path(Path::new("b")));
        right.append(Report::invalid_path(Path::new("c")));

        left.extend(right);
        let paths: Vec<_> = left
            .iter()
            .filter_map(|r| r.path.as_deref())
            .map(|p| p.to_path_buf())
            .collect();
        assert_eq!(paths, vec![PathBuf::from("a"), "b".into(), "c".into()]);
    }

    #[test]
    fn reports_serialize_as_flat_records() {
        let report = Report::encrypted_chunk(Path::new("blob.bin"), "0x0-0x100".into());
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["severity"], "WARNING");
        assert_eq!(value["kind"], "encrypted_chunk");
        assert_eq!(value["chunk_range"], "0x0-0x100");
        assert!(value.get("details").is_none());
    }
}
