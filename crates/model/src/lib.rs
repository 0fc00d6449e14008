//! Canonical data model for the scan pipeline: file kinds, parsed
//! documents, findings and the records persisted by storage backends.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

mod context;
mod tracker;

pub use context::{Cancelled, ScanContext};
pub use tracker::{CounterTracker, Tracker};

/// Canonical tree form of a parsed source file: scalars, sequences and
/// keyed mappings. Mapping order is preserved for diagnostics.
pub type Document = JsonValue;

/// Per-sub-document mapping from rendered line indices to original
/// template lines, keyed by the split-id number.
pub type IdInfo = HashMap<usize, HashMap<usize, usize>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
/// Recognized artifact families. `Common` marks files that parsed into no
/// known family; the inspector skips them.
pub enum FileKind {
    Terraform,
    Kubernetes,
    CloudFormation,
    Ansible,
    Dockerfile,
    Helm,
    Common,
}

impl FileKind {
    /// Policy platform this kind is inspected under. Helm charts render to
    /// Kubernetes manifests and share that platform's queries.
    pub fn platform(&self) -> Option<&'static str> {
        match self {
            FileKind::Terraform => Some("terraform"),
            FileKind::Kubernetes | FileKind::Helm => Some("kubernetes"),
            FileKind::CloudFormation => Some("cloudformation"),
            FileKind::Ansible => Some("ansible"),
            FileKind::Dockerfile => Some("dockerfile"),
            FileKind::Common => None,
        }
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FileKind::Terraform => "terraform",
            FileKind::Kubernetes => "kubernetes",
            FileKind::CloudFormation => "cloudformation",
            FileKind::Ansible => "ansible",
            FileKind::Dockerfile => "dockerfile",
            FileKind::Helm => "helm",
            FileKind::Common => "common",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "UPPERCASE")]
/// Severity associated with a query or vulnerability.
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Info => "INFO",
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "info" => Ok(Severity::Info),
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            other => Err(format!("unknown severity '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// How a finding relates to the attribute it points at.
pub enum IssueType {
    MissingAttribute,
    IncorrectValue,
    RedundantAttribute,
}

impl fmt::Display for IssueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IssueType::MissingAttribute => "MissingAttribute",
            IssueType::IncorrectValue => "IncorrectValue",
            IssueType::RedundantAttribute => "RedundantAttribute",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// One parsed document plus everything the later stages need to point a
/// finding back at the bytes on disk.
pub struct FileMetadata {
    /// Opaque unique id, generated at ingest.
    pub id: String,
    /// Caller-supplied group key for the whole scan.
    pub scan_id: String,
    /// Original path on disk. For rendered Helm sub-documents this is the
    /// template path, not the rendered output.
    pub file_name: PathBuf,
    pub kind: FileKind,
    /// Canonicalized view the policy engine queries.
    pub document: Document,
    /// Unmodified text of the source on disk, kept for line lookup.
    pub original_data: String,
    /// Post-resolution text when the resolver rewrote the file, otherwise
    /// equal to `original_data`.
    pub content: String,
    /// Marker identifying one rendered sub-document, e.g.
    /// `# KICS_HELM_ID_0`. Empty for non-Helm files.
    #[serde(default)]
    pub helm_id: String,
    #[serde(default)]
    pub id_info: IdInfo,
}

pub type FileMetadatas = Vec<FileMetadata>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Engine output before line attribution and metadata enrichment.
pub struct RawFinding {
    /// `FileMetadata.id` of the matched document.
    pub document_id: String,
    /// Dotted attribute path of the offending value.
    pub search_key: String,
    pub issue_type: IssueType,
    pub key_expected_value: String,
    pub key_actual_value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Single excerpted source line around a finding.
pub struct VulnLine {
    pub position: usize,
    pub line: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
/// Result of resolving a search key against the original source text.
/// `line` is 1-based in the user's file; 0 means the key was not located.
pub struct VulnerabilityLines {
    pub line: usize,
    pub vuln_lines: Vec<VulnLine>,
    pub line_with_vulnerability: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// A raw finding enriched with query metadata and source location.
/// Created by the inspector, written to storage.
pub struct Vulnerability {
    /// Deterministic identity, stable across scans of the same input.
    pub id: String,
    pub scan_id: String,
    /// `FileMetadata.id` of the document the finding was raised on.
    pub file_id: String,
    pub file_name: PathBuf,
    pub query_id: String,
    pub query_name: String,
    pub severity: Severity,
    pub category: String,
    pub description: String,
    pub description_url: String,
    pub platform: String,
    pub issue_type: IssueType,
    pub search_key: String,
    pub key_expected_value: String,
    pub key_actual_value: String,
    pub line: usize,
    pub vuln_lines: Vec<VulnLine>,
}

impl Vulnerability {
    /// Key for the canonical report ordering: findings sorted by it are
    /// reproducible across runs regardless of evaluation interleaving.
    pub fn canonical_key(&self) -> (&PathBuf, usize, &str, &str) {
        (&self.file_name, self.line, &self.query_id, &self.search_key)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
/// Count of vulnerabilities grouped by severity for one scan.
///
/// # Example
/// ```
/// use model::{Severity, SeveritySummary};
/// let mut summary = SeveritySummary::new("scan-1".into());
/// summary.add(Severity::High);
/// assert_eq!(summary.total_counter, 1);
/// assert_eq!(summary.severity_counters[&Severity::High], 1);
/// ```
pub struct SeveritySummary {
    pub scan_id: String,
    pub severity_counters: HashMap<Severity, usize>,
    pub total_counter: usize,
}

impl SeveritySummary {
    pub fn new(scan_id: String) -> Self {
        Self {
            scan_id,
            severity_counters: HashMap::new(),
            total_counter: 0,
        }
    }

    pub fn add(&mut self, severity: Severity) {
        *self.severity_counters.entry(severity).or_insert(0) += 1;
        self.total_counter += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_roundtrip() {
        for s in [
            Severity::Info,
            Severity::Low,
            Severity::Medium,
            Severity::High,
        ] {
            assert_eq!(s.to_string().parse::<Severity>().unwrap(), s);
        }
        assert!("bogus".parse::<Severity>().is_err());
    }

    #[test]
    fn severity_is_ordered() {
        assert!(Severity::Info < Severity::Low);
        assert!(Severity::Medium < Severity::High);
    }

    #[test]
    fn helm_shares_kubernetes_platform() {
        assert_eq!(FileKind::Helm.platform(), FileKind::Kubernetes.platform());
        assert_eq!(FileKind::Common.platform(), None);
    }

    #[test]
    fn summary_counts_by_severity() {
        let mut s = SeveritySummary::new("s".into());
        s.add(Severity::High);
        s.add(Severity::High);
        s.add(Severity::Low);
        assert_eq!(s.total_counter, 3);
        assert_eq!(s.severity_counters[&Severity::High], 2);
        assert_eq!(s.severity_counters.get(&Severity::Medium), None);
    }
}
