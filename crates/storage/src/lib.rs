//! Storage backends for scan artifacts. The core depends only on the
//! narrow [`Storage`] contract: append-only during a scan, queryable by
//! scan id afterwards.

use anyhow::{Context, Result};
use model::{FileMetadata, ScanContext, SeveritySummary, Vulnerability};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::debug;

/// Append-only sink for file metadata and vulnerabilities. `save_*` must
/// be safe under concurrent producers.
pub trait Storage: Send + Sync {
    fn save_file(&self, ctx: &ScanContext, metadata: &FileMetadata) -> Result<()>;
    fn save_vulnerabilities(
        &self,
        ctx: &ScanContext,
        vulnerabilities: &[Vulnerability],
    ) -> Result<()>;
    fn get_vulnerabilities(&self, ctx: &ScanContext, scan_id: &str) -> Result<Vec<Vulnerability>>;
    fn get_scan_summary(
        &self,
        ctx: &ScanContext,
        scan_ids: &[String],
    ) -> Result<Vec<SeveritySummary>>;
}

#[derive(Debug, Default)]
/// In-memory storage, internally synchronized.
pub struct MemoryStorage {
    files: Mutex<Vec<FileMetadata>>,
    vulnerabilities: Mutex<Vec<Vulnerability>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn files(&self) -> Vec<FileMetadata> {
        self.files.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Storage for MemoryStorage {
    fn save_file(&self, ctx: &ScanContext, metadata: &FileMetadata) -> Result<()> {
        ctx.ensure_active()?;
        self.files
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(metadata.clone());
        Ok(())
    }

    fn save_vulnerabilities(
        &self,
        ctx: &ScanContext,
        vulnerabilities: &[Vulnerability],
    ) -> Result<()> {
        ctx.ensure_active()?;
        self.vulnerabilities
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(vulnerabilities);
        Ok(())
    }

    fn get_vulnerabilities(&self, ctx: &ScanContext, scan_id: &str) -> Result<Vec<Vulnerability>> {
        ctx.ensure_active()?;
        Ok(self
            .vulnerabilities
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|v| v.scan_id == scan_id)
            .cloned()
            .collect())
    }

    fn get_scan_summary(
        &self,
        ctx: &ScanContext,
        scan_ids: &[String],
    ) -> Result<Vec<SeveritySummary>> {
        ctx.ensure_active()?;
        let vulnerabilities = self
            .vulnerabilities
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let mut summaries: HashMap<&String, SeveritySummary> = scan_ids
            .iter()
            .map(|id| (id, SeveritySummary::new(id.clone())))
            .collect();
        for v in vulnerabilities.iter() {
            if let Some(summary) = summaries.get_mut(&v.scan_id) {
                summary.add(v.severity);
            }
        }
        Ok(scan_ids
            .iter()
            .filter_map(|id| summaries.remove(id))
            .collect())
    }
}

#[derive(Debug)]
/// JSON-file-backed storage: keeps the in-memory view and writes through
/// to `files.json` / `vulnerabilities.json` under a directory on save.
pub struct JsonStorage {
    dir: PathBuf,
    inner: MemoryStorage,
}

impl JsonStorage {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create storage dir: {}", dir.display()))?;
        let inner = MemoryStorage::new();
        if let Ok(data) = fs::read_to_string(dir.join("files.json")) {
            let files: Vec<FileMetadata> = serde_json::from_str(&data)
                .with_context(|| "malformed files.json in storage dir")?;
            *inner.files.lock().unwrap_or_else(|e| e.into_inner()) = files;
        }
        if let Ok(data) = fs::read_to_string(dir.join("vulnerabilities.json")) {
            let vulnerabilities: Vec<Vulnerability> = serde_json::from_str(&data)
                .with_context(|| "malformed vulnerabilities.json in storage dir")?;
            *inner
                .vulnerabilities
                .lock()
                .unwrap_or_else(|e| e.into_inner()) = vulnerabilities;
        }
        Ok(Self { dir, inner })
    }

    fn persist<T: serde::Serialize>(&self, name: &str, records: &[T]) -> Result<()> {
        let path = self.dir.join(name);
        let data = serde_json::to_string(records)?;
        fs::write(&path, data).with_context(|| format!("failed to write {}", path.display()))?;
        debug!(path = %path.display(), count = records.len(), "Storage persisted");
        Ok(())
    }
}

impl Storage for JsonStorage {
    fn save_file(&self, ctx: &ScanContext, metadata: &FileMetadata) -> Result<()> {
        self.inner.save_file(ctx, metadata)?;
        let files = self.inner.files.lock().unwrap_or_else(|e| e.into_inner());
        self.persist("files.json", &files)
    }

    fn save_vulnerabilities(
        &self,
        ctx: &ScanContext,
        vulnerabilities: &[Vulnerability],
    ) -> Result<()> {
        self.inner.save_vulnerabilities(ctx, vulnerabilities)?;
        let all = self
            .inner
            .vulnerabilities
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        self.persist("vulnerabilities.json", &all)
    }

    fn get_vulnerabilities(&self, ctx: &ScanContext, scan_id: &str) -> Result<Vec<Vulnerability>> {
        self.inner.get_vulnerabilities(ctx, scan_id)
    }

    fn get_scan_summary(
        &self,
        ctx: &ScanContext,
        scan_ids: &[String],
    ) -> Result<Vec<SeveritySummary>> {
        self.inner.get_scan_summary(ctx, scan_ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::{Document, FileKind, IssueType, Severity};
    use std::collections::HashMap as StdHashMap;

    fn vulnerability(scan_id: &str, severity: Severity) -> Vulnerability {
        Vulnerability {
            id: format!("{scan_id}-{severity}"),
            scan_id: scan_id.into(),
            file_id: "f-1".into(),
            file_name: "main.tf".into(),
            query_id: "q-1".into(),
            query_name: "query".into(),
            severity,
            category: "cat".into(),
            description: String::new(),
            description_url: String::new(),
            platform: "terraform".into(),
            issue_type: IssueType::IncorrectValue,
            search_key: "resource.a.b".into(),
            key_expected_value: "x".into(),
            key_actual_value: "y".into(),
            line: 1,
            vuln_lines: Vec::new(),
        }
    }

    fn file_metadata(scan_id: &str) -> FileMetadata {
        FileMetadata {
            id: "f-1".into(),
            scan_id: scan_id.into(),
            file_name: "main.tf".into(),
            kind: FileKind::Terraform,
            document: Document::default(),
            original_data: String::new(),
            content: String::new(),
            helm_id: String::new(),
            id_info: StdHashMap::new(),
        }
    }

    #[test]
    fn memory_storage_filters_by_scan_id() {
        let ctx = ScanContext::new();
        let storage = MemoryStorage::new();
        storage
            .save_vulnerabilities(
                &ctx,
                &[
                    vulnerability("a", Severity::High),
                    vulnerability("b", Severity::Low),
                ],
            )
            .unwrap();
        let got = storage.get_vulnerabilities(&ctx, "a").unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].scan_id, "a");
    }

    #[test]
    fn summary_counts_per_severity() {
        let ctx = ScanContext::new();
        let storage = MemoryStorage::new();
        storage
            .save_vulnerabilities(
                &ctx,
                &[
                    vulnerability("a", Severity::High),
                    vulnerability("a", Severity::High),
                    vulnerability("a", Severity::Info),
                    vulnerability("b", Severity::Low),
                ],
            )
            .unwrap();
        let summaries = storage
            .get_scan_summary(&ctx, &["a".to_string()])
            .unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].total_counter, 3);
        assert_eq!(summaries[0].severity_counters[&Severity::High], 2);
    }

    #[test]
    fn cancelled_context_rejects_saves() {
        let ctx = ScanContext::new();
        ctx.cancel();
        let storage = MemoryStorage::new();
        assert!(storage.save_file(&ctx, &file_metadata("a")).is_err());
    }

    #[test]
    fn json_storage_persists_across_reopen() {
        let tmp = tempfile::TempDir::new().unwrap();
        let ctx = ScanContext::new();
        {
            let storage = JsonStorage::open(tmp.path()).unwrap();
            storage.save_file(&ctx, &file_metadata("a")).unwrap();
            storage
                .save_vulnerabilities(&ctx, &[vulnerability("a", Severity::Medium)])
                .unwrap();
        }
        let reopened = JsonStorage::open(tmp.path()).unwrap();
        let got = reopened.get_vulnerabilities(&ctx, "a").unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].severity, Severity::Medium);
    }
}
