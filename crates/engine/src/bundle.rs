//! Query bundle loading. A bundle is a tree of directories, one per
//! platform, where each query occupies its own directory holding the
//! executable body (`query.yaml`), its metadata (`metadata.json`) and
//! optional test fixtures under `test/`.

use crate::eval::{CompiledQuery, QueryBody};
use anyhow::{bail, Context, Result};
use model::Severity;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::debug;

pub const METADATA_FILE: &str = "metadata.json";
pub const QUERY_FILE: &str = "query.yaml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// Descriptive metadata attached to one query.
pub struct QueryMetadata {
    /// Stable GUID-like identifier.
    pub id: String,
    pub query_name: String,
    pub severity: Severity,
    pub category: String,
    #[serde(default)]
    pub description_text: String,
    #[serde(default)]
    pub description_url: String,
    pub platform: String,
}

#[derive(Debug, Clone, Default)]
/// All compiled queries of a bundle. Loaded once per process and
/// immutable afterwards.
pub struct QueryBundle {
    pub queries: Vec<CompiledQuery>,
}

impl QueryBundle {
    pub fn for_platform<'a>(
        &'a self,
        platform: &'a str,
    ) -> impl Iterator<Item = &'a CompiledQuery> {
        self.queries
            .iter()
            .filter(move |q| q.metadata.platform == platform)
    }
}

/// Recursively loads every query directory under `dir`. A malformed query
/// fails the whole bundle: executing a partially compiled bundle would
/// silently drop policies.
pub fn load_queries(dir: &Path) -> Result<QueryBundle> {
    if !dir.is_dir() {
        bail!("query bundle directory not found: {}", dir.display());
    }
    let mut bundle = QueryBundle::default();
    let mut seen_ids: HashSet<String> = HashSet::new();
    visit_query_dirs(dir, &mut |query_dir| {
        let metadata_path = query_dir.join(METADATA_FILE);
        let metadata_text = fs::read_to_string(&metadata_path)
            .with_context(|| format!("failed to read {}", metadata_path.display()))?;
        let metadata: QueryMetadata = serde_json::from_str(&metadata_text)
            .with_context(|| format!("malformed query metadata: {}", metadata_path.display()))?;
        if !seen_ids.insert(metadata.id.clone()) {
            bail!("duplicate query id: {}", metadata.id);
        }

        let body_path = query_dir.join(QUERY_FILE);
        let body_text = fs::read_to_string(&body_path)
            .with_context(|| format!("failed to read {}", body_path.display()))?;
        let body: QueryBody = serde_yaml::from_str(&body_text)
            .with_context(|| format!("malformed query body: {}", body_path.display()))?;
        let compiled = CompiledQuery::compile(metadata, body)
            .with_context(|| format!("failed to compile query: {}", body_path.display()))?;
        debug!(id = %compiled.metadata.id, platform = %compiled.metadata.platform, "Query compiled");
        bundle.queries.push(compiled);
        Ok(())
    })?;
    Ok(bundle)
}

/// Calls `callback` for every directory containing a metadata file,
/// skipping per-query `test/` fixture directories.
fn visit_query_dirs(dir: &Path, callback: &mut dyn FnMut(&Path) -> Result<()>) -> Result<()> {
    if dir.join(METADATA_FILE).is_file() {
        return callback(dir);
    }
    let mut entries: Vec<_> = fs::read_dir(dir)
        .with_context(|| format!("failed to read {}", dir.display()))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_dir())
        .filter(|p| p.file_name().is_none_or(|n| n != "test"))
        .collect();
    entries.sort();
    for entry in entries {
        visit_query_dirs(&entry, callback)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_query(root: &Path, platform: &str, name: &str, id: &str, body: &str) {
        let dir = root.join(platform).join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join(METADATA_FILE),
            format!(
                r#"{{
  "id": "{id}",
  "queryName": "{name}",
  "severity": "HIGH",
  "category": "Insecure Configurations",
  "descriptionText": "test query",
  "descriptionUrl": "https://example.invalid/{name}",
  "platform": "{platform}"
}}"#
            ),
        )
        .unwrap();
        fs::write(dir.join(QUERY_FILE), body).unwrap();
    }

    const BODY: &str = "scope:\n  path: resource.aws_s3_bucket.*\nchecks:\n  - path: acl\n    assert: not_equals\n    value: public-read\n";

    #[test]
    fn loads_queries_per_platform() {
        let tmp = TempDir::new().unwrap();
        write_query(tmp.path(), "terraform", "s3_public_acl", "q-1", BODY);
        write_query(tmp.path(), "kubernetes", "k8s_check", "q-2", "scope:\n  path: spec\nchecks:\n  - path: hostNetwork\n    assert: not_equals\n    value: true\n");
        let bundle = load_queries(tmp.path()).unwrap();
        assert_eq!(bundle.queries.len(), 2);
        assert_eq!(bundle.for_platform("terraform").count(), 1);
        assert_eq!(bundle.for_platform("ansible").count(), 0);
    }

    #[test]
    fn test_fixture_dirs_are_skipped() {
        let tmp = TempDir::new().unwrap();
        write_query(tmp.path(), "terraform", "s3_public_acl", "q-1", BODY);
        let fixtures = tmp.path().join("terraform/s3_public_acl/test");
        fs::create_dir_all(&fixtures).unwrap();
        fs::write(fixtures.join("positive.tf"), "resource \"aws_s3_bucket\" \"b\" {}\n").unwrap();
        let bundle = load_queries(tmp.path()).unwrap();
        assert_eq!(bundle.queries.len(), 1);
    }

    #[test]
    fn duplicate_ids_fail_the_bundle() {
        let tmp = TempDir::new().unwrap();
        write_query(tmp.path(), "terraform", "a_query", "q-1", BODY);
        write_query(tmp.path(), "terraform", "b_query", "q-1", BODY);
        let err = load_queries(tmp.path()).unwrap_err();
        assert!(err.to_string().contains("duplicate query id"));
    }

    #[test]
    fn invalid_pattern_fails_the_bundle() {
        let tmp = TempDir::new().unwrap();
        write_query(
            tmp.path(),
            "terraform",
            "bad_pattern",
            "q-1",
            "scope:\n  path: resource\nchecks:\n  - path: name\n    assert: matches\n    pattern: \"([\"\n",
        );
        assert!(load_queries(tmp.path()).is_err());
    }

    #[test]
    fn missing_bundle_dir_is_an_error() {
        assert!(load_queries(Path::new("/no/such/bundle")).is_err());
    }
}
