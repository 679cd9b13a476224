// src/models.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Directory under the destination root that holds persisted run manifests.
pub const RUNS_DIR: &str = ".canvasdl-runs";

/// Suffix appended to a target path while its body is being written.
pub const PART_SUFFIX: &str = ".canvasdl-part";

/// Current on-disk manifest layout.
pub const MANIFEST_VERSION: u32 = 1;

/// The kind of course content an item was enumerated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Files,
    Assignments,
    Discussions,
    Pages,
    Modules,
}

#[derive(Debug, Error)]
#[error("unsupported source kind: {0}")]
pub struct UnknownSourceKind(pub String);

impl SourceKind {
    /// Every kind, in canonical enumeration order.
    pub const ALL: [SourceKind; 5] = [
        SourceKind::Files,
        SourceKind::Assignments,
        SourceKind::Discussions,
        SourceKind::Pages,
        SourceKind::Modules,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Files => "files",
            SourceKind::Assignments => "assignments",
            SourceKind::Discussions => "discussions",
            SourceKind::Pages => "pages",
            SourceKind::Modules => "modules",
        }
    }

    /// Deduplicates a caller selection and puts it in canonical order.
    /// An empty selection means every kind.
    pub fn normalize(selected: &[SourceKind]) -> Vec<SourceKind> {
        if selected.is_empty() {
            return Self::ALL.to_vec();
        }
        Self::ALL
            .iter()
            .copied()
            .filter(|kind| selected.contains(kind))
            .collect()
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = UnknownSourceKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == wanted)
            .ok_or_else(|| UnknownSourceKind(s.to_string()))
    }
}

/// One unit of remote content to fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadableItem {
    /// Unique within (course, source kind); used for dedup and resume matching.
    pub item_id: String,
    pub course_ref: String,
    pub source_kind: SourceKind,
    pub suggested_name: String,
    /// Progress display only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_hint: Option<u64>,
}

impl DownloadableItem {
    pub fn key(&self) -> (&str, SourceKind, &str) {
        (&self.course_ref, self.source_kind, &self.item_id)
    }
}

/// Execution state of a single manifest entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    InProgress,
    Success,
    Failed,
    Skipped,
}

impl EntryStatus {
    /// Entries a resumed run picks up again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EntryStatus::Pending | EntryStatus::Failed)
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EntryStatus::Pending => "pending",
            EntryStatus::InProgress => "in_progress",
            EntryStatus::Success => "success",
            EntryStatus::Failed => "failed",
            EntryStatus::Skipped => "skipped",
        };
        f.write_str(label)
    }
}

/// The persisted unit of work: an item plus its execution state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    #[serde(flatten)]
    pub item: DownloadableItem,
    pub status: EntryStatus,
    /// Fixed once resolved; stable across resume.
    pub target_path: PathBuf,
    #[serde(default)]
    pub attempt_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_downloaded: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl ManifestEntry {
    pub fn new(item: DownloadableItem, target_path: PathBuf) -> Self {
        Self {
            item,
            status: EntryStatus::Pending,
            target_path,
            attempt_count: 0,
            last_error: None,
            completed_at: None,
            bytes_downloaded: None,
            sha256: None,
        }
    }

    /// Returns the path the body is streamed into before the final rename.
    /// e.g., for "/dest/files/a.pdf", it returns "/dest/files/a.pdf.canvasdl-part"
    pub fn temporary_path(&self) -> PathBuf {
        let mut name: OsString = self.target_path.as_os_str().to_os_string();
        name.push(PART_SUFFIX);
        PathBuf::from(name)
    }

    pub fn mark_in_progress(&mut self) {
        self.status = EntryStatus::InProgress;
    }

    pub fn mark_success(&mut self, bytes: u64, sha256: String) {
        self.status = EntryStatus::Success;
        self.attempt_count += 1;
        self.completed_at = Some(Utc::now());
        self.last_error = None;
        self.bytes_downloaded = Some(bytes);
        self.sha256 = Some(sha256);
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.status = EntryStatus::Failed;
        self.attempt_count += 1;
        self.completed_at = Some(Utc::now());
        self.last_error = Some(reason.into());
        self.bytes_downloaded = None;
        self.sha256 = None;
    }

    /// The file was already on disk and overwriting is disabled. No fetch
    /// happened, so the attempt counter is left alone.
    pub fn mark_skipped(&mut self) {
        self.status = EntryStatus::Skipped;
        self.completed_at = None;
        self.last_error = None;
    }
}

/// A source kind that produced no data for one course.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumerationWarning {
    pub course_ref: String,
    pub source_kind: SourceKind,
    pub detail: String,
}

impl fmt::Display for EnumerationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}: {}", self.course_ref, self.source_kind, self.detail)
    }
}

/// Represents the complete, persistent plan of one invocation.
/// This struct is what gets written to `<dest_root>/.canvasdl-runs/<run_id>.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default = "default_version")]
    pub version: u32,
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub dest_root: PathBuf,
    pub overwrite_policy: bool,
    pub concurrency: usize,
    /// Canvas instance the run was planned against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default)]
    pub warnings: Vec<EnumerationWarning>,
    /// Enumeration order, preserved regardless of completion order.
    pub entries: Vec<ManifestEntry>,
}

fn default_version() -> u32 {
    MANIFEST_VERSION
}

impl Manifest {
    pub fn new(dest_root: PathBuf, concurrency: usize, overwrite_policy: bool) -> Self {
        let created_at = Utc::now();
        Self {
            version: MANIFEST_VERSION,
            run_id: new_run_id(created_at),
            created_at,
            dest_root,
            overwrite_policy,
            concurrency,
            base_url: None,
            warnings: Vec::new(),
            entries: Vec::new(),
        }
    }

    /// Where this run's manifest lives unless the caller chose another path.
    pub fn default_path(&self) -> PathBuf {
        runs_dir(&self.dest_root).join(format!("{}.json", self.run_id))
    }

    pub fn status_counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for entry in &self.entries {
            counts.record(entry.status);
        }
        counts
    }

    pub fn has_failures(&self) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.status == EntryStatus::Failed)
    }

    /// Indices of the entries a resumed run should execute, in manifest order.
    pub fn retryable_indices(&self) -> Vec<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.status.is_retryable())
            .map(|(index, _)| index)
            .collect()
    }
}

pub fn runs_dir(dest_root: &Path) -> PathBuf {
    dest_root.join(RUNS_DIR)
}

fn new_run_id(created_at: DateTime<Utc>) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", created_at.format("%Y%m%dT%H%M%SZ"), &suffix[..8])
}

/// Per-status tally of a manifest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl StatusCounts {
    fn record(&mut self, status: EntryStatus) {
        match status {
            EntryStatus::Pending => self.pending += 1,
            EntryStatus::InProgress => self.in_progress += 1,
            EntryStatus::Success => self.success += 1,
            EntryStatus::Failed => self.failed += 1,
            EntryStatus::Skipped => self.skipped += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.in_progress + self.success + self.failed + self.skipped
    }
}
