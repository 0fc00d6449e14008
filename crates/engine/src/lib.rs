//! Policy engine: evaluates query bundles over parsed documents,
//! orchestrates the parallel fan-out, applies per-evaluation timeouts and
//! enriches raw findings into vulnerabilities with source locations.

use anyhow::{anyhow, bail, Result};
use model::{
    Cancelled, FileMetadata, RawFinding, ScanContext, Tracker, Vulnerability,
};
use rayon::prelude::*;
use std::path::Path;
use std::sync::{mpsc, Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, warn};

pub mod bundle;
pub mod eval;

pub use bundle::{load_queries, QueryBundle, QueryMetadata};
pub use eval::{AssertKind, Check, CompiledQuery, Condition, QueryBody, Scope};

static TIMEOUT_POOL: OnceLock<rayon::ThreadPool> = OnceLock::new();

fn timeout_pool() -> &'static rayon::ThreadPool {
    TIMEOUT_POOL.get_or_init(|| {
        rayon::ThreadPoolBuilder::new()
            .build()
            .expect("rayon thread pool")
    })
}

#[derive(Debug, Clone)]
pub struct InspectorConfig {
    /// Per-(query, file) evaluation timeout; a timed-out pair contributes
    /// no findings but does not abort the scan.
    pub query_timeout: Option<Duration>,
    /// Source lines excerpted around each finding.
    pub output_lines: usize,
}

impl Default for InspectorConfig {
    fn default() -> Self {
        Self {
            query_timeout: None,
            output_lines: 3,
        }
    }
}

/// Evaluates each applicable query against each document and yields
/// vulnerabilities in a canonical, reproducible order.
pub struct Inspector {
    bundle: QueryBundle,
    config: InspectorConfig,
}

impl Inspector {
    pub fn new(bundle: QueryBundle, config: InspectorConfig) -> Self {
        Self { bundle, config }
    }

    /// Loads and compiles the bundle at `dir`. A bundle that fails to
    /// compile aborts the scan before any evaluation starts.
    pub fn from_path(dir: &Path, config: InspectorConfig) -> Result<Self> {
        Ok(Self::new(bundle::load_queries(dir)?, config))
    }

    pub fn queries(&self) -> usize {
        self.bundle.queries.len()
    }

    /// Runs the inspection over all files. Parallel across files; findings
    /// within one file are ordered by `(queryID, searchKey)` and the final
    /// list is sorted by `(fileName, line, queryID, searchKey)` so
    /// downstream reporting is reproducible.
    pub fn inspect(
        &self,
        ctx: &ScanContext,
        scan_id: &str,
        files: &[FileMetadata],
        base_path: &Path,
        tracker: &dyn Tracker,
    ) -> Result<Vec<Vulnerability>> {
        let per_file = files
            .par_iter()
            .map(|file| self.inspect_file(ctx, scan_id, file, base_path, tracker))
            .collect::<Result<Vec<_>, Cancelled>>()?;

        let mut vulnerabilities: Vec<Vulnerability> = per_file.into_iter().flatten().collect();
        vulnerabilities.sort_by(|a, b| a.canonical_key().cmp(&b.canonical_key()));
        debug!(
            files = files.len(),
            vulnerabilities = vulnerabilities.len(),
            "Inspection completed"
        );
        Ok(vulnerabilities)
    }

    fn inspect_file(
        &self,
        ctx: &ScanContext,
        scan_id: &str,
        file: &FileMetadata,
        base_path: &Path,
        tracker: &dyn Tracker,
    ) -> Result<Vec<Vulnerability>, Cancelled> {
        ctx.ensure_active()?;
        let mut out = Vec::new();
        let Some(platform) = file.kind.platform() else {
            tracker.track_file_evaluated();
            return Ok(out);
        };
        for query in self.bundle.for_platform(platform) {
            let raw = match self.eval_query(query, file) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(
                        query = %query.metadata.id,
                        file = %file.file_name.display(),
                        error = ?e,
                        "Query evaluation failed, pair skipped"
                    );
                    continue;
                }
            };
            for finding in raw {
                out.push(self.build_vulnerability(scan_id, file, query, finding, base_path));
            }
        }
        out.sort_by(|a, b| {
            (&a.query_id, &a.search_key).cmp(&(&b.query_id, &b.search_key))
        });
        tracker.track_file_evaluated();
        Ok(out)
    }

    fn eval_query(&self, query: &CompiledQuery, file: &FileMetadata) -> Result<Vec<RawFinding>> {
        match self.config.query_timeout {
            None => Ok(eval::eval(query, file)),
            Some(timeout) if timeout.is_zero() => bail!("evaluation timed out"),
            Some(timeout) => {
                // worker thread plus channel so a runaway evaluation
                // cannot stall the whole scan
                let (tx, rx) = mpsc::channel();
                let query = Arc::new(query.clone());
                let file = Arc::new(file.clone());
                timeout_pool().spawn(move || {
                    let _ = tx.send(eval::eval(&query, &file));
                });
                rx.recv_timeout(timeout)
                    .map_err(|_| anyhow!("evaluation timed out after {timeout:?}"))
            }
        }
    }

    fn build_vulnerability(
        &self,
        scan_id: &str,
        file: &FileMetadata,
        query: &CompiledQuery,
        finding: RawFinding,
        base_path: &Path,
    ) -> Vulnerability {
        let lines = detector::detect_line(file, &finding.search_key, self.config.output_lines);
        let file_name = file
            .file_name
            .strip_prefix(base_path)
            .unwrap_or(&file.file_name)
            .to_path_buf();
        let id = blake3::hash(
            format!(
                "{}:{}:{}",
                query.metadata.id,
                file_name.display(),
                finding.search_key
            )
            .as_bytes(),
        )
        .to_hex()
        .to_string();
        Vulnerability {
            id,
            scan_id: scan_id.to_string(),
            file_id: finding.document_id,
            file_name,
            query_id: query.metadata.id.clone(),
            query_name: query.metadata.query_name.clone(),
            severity: query.metadata.severity,
            category: query.metadata.category.clone(),
            description: query.metadata.description_text.clone(),
            description_url: query.metadata.description_url.clone(),
            platform: query.metadata.platform.clone(),
            issue_type: finding.issue_type,
            search_key: finding.search_key,
            key_expected_value: finding.key_expected_value,
            key_actual_value: finding.key_actual_value,
            line: lines.line,
            vuln_lines: lines.vuln_lines,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::{CounterTracker, Document, FileKind, IssueType, Severity};
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};

    fn metadata(id: &str, platform: &str) -> QueryMetadata {
        QueryMetadata {
            id: id.into(),
            query_name: id.replace('-', "_"),
            severity: Severity::High,
            category: "Insecure Configurations".into(),
            description_text: String::new(),
            description_url: String::new(),
            platform: platform.into(),
        }
    }

    fn compile(id: &str, platform: &str, body: &str) -> CompiledQuery {
        let body: QueryBody = serde_yaml::from_str(body).unwrap();
        CompiledQuery::compile(metadata(id, platform), body).unwrap()
    }

    fn terraform_file(name: &str, content: &str) -> FileMetadata {
        let (documents, kind) = parsers::Parser::new()
            .parse(Path::new(name), content)
            .unwrap();
        FileMetadata {
            id: format!("file-{name}"),
            scan_id: "scan".into(),
            file_name: PathBuf::from(name),
            kind,
            document: documents.into_iter().next().unwrap(),
            original_data: content.into(),
            content: content.into(),
            helm_id: String::new(),
            id_info: HashMap::new(),
        }
    }

    fn inspect(queries: Vec<CompiledQuery>, files: &[FileMetadata]) -> Vec<Vulnerability> {
        let inspector = Inspector::new(QueryBundle { queries }, InspectorConfig::default());
        let tracker = CounterTracker::new();
        inspector
            .inspect(&ScanContext::new(), "scan", files, Path::new(""), &tracker)
            .unwrap()
    }

    #[test]
    fn compliant_lambda_permission_produces_no_findings() {
        let query = compile(
            "lambda-principal-wildcard",
            "terraform",
            "scope:\n  path: resource.aws_lambda_permission.*\nchecks:\n  - path: principal\n    assert: not_equals\n    value: \"*\"\n    expected: \"'principal' is not equal to '*'\"\n",
        );
        let file = terraform_file(
            "lambda.tf",
            "resource \"aws_lambda_permission\" \"events\" {\n  statement_id = \"AllowExecutionFromCloudWatch\"\n  action       = \"lambda:InvokeFunction\"\n  principal    = \"events.amazonaws.com\"\n}\n",
        );
        assert!(inspect(vec![query], &[file]).is_empty());
    }

    #[test]
    fn weak_cloudfront_protocol_yields_incorrect_value() {
        let query = compile(
            "cloudfront-weak-tls",
            "terraform",
            r#"
scope:
  path: resource.aws_cloudfront_distribution.*
  where:
    - path: viewer_certificate.cloudfront_default_certificate
      equals: false
checks:
  - path: viewer_certificate.minimum_protocol_version
    assert: one_of
    values: ["TLSv1.2_2019", "TLSv1.2_2021"]
    expected: "'minimum_protocol_version' is TLSv1.2_2021 or TLSv1.2_2019"
"#,
        );
        let file = terraform_file(
            "cloudfront.tf",
            "resource \"aws_cloudfront_distribution\" \"cdn\" {\n  enabled = true\n  viewer_certificate {\n    cloudfront_default_certificate = false\n    minimum_protocol_version       = \"TLSv1\"\n  }\n}\n",
        );
        let vulns = inspect(vec![query], &[file]);
        assert_eq!(vulns.len(), 1);
        let v = &vulns[0];
        assert_eq!(v.issue_type, IssueType::IncorrectValue);
        assert!(v
            .search_key
            .ends_with("viewer_certificate.minimum_protocol_version"));
        assert_eq!(v.key_actual_value, "'minimum_protocol_version' is TLSv1");
        assert_eq!(v.line, 5);
    }

    #[test]
    fn missing_attribute_points_at_deepest_ancestor() {
        let query = compile(
            "s3-versioning-missing",
            "terraform",
            "scope:\n  path: resource.aws_s3_bucket.*\nchecks:\n  - path: versioning.enabled\n    assert: exists\n",
        );
        let file = terraform_file(
            "s3.tf",
            "resource \"aws_s3_bucket\" \"logs\" {\n  acl = \"private\"\n}\n",
        );
        let vulns = inspect(vec![query], &[file]);
        assert_eq!(vulns.len(), 1);
        assert_eq!(vulns[0].issue_type, IssueType::MissingAttribute);
        assert_eq!(vulns[0].search_key, "resource.aws_s3_bucket.logs");
        assert_eq!(vulns[0].key_actual_value, "'versioning.enabled' is undefined");
    }

    #[test]
    fn redundant_attribute_is_reported_at_its_path() {
        let query = compile(
            "no-plaintext-secrets",
            "terraform",
            "scope:\n  path: resource.aws_instance.*\nchecks:\n  - path: credentials\n    assert: absent\n",
        );
        let file = terraform_file(
            "ec2.tf",
            "resource \"aws_instance\" \"web\" {\n  credentials = \"hunter2\"\n}\n",
        );
        let vulns = inspect(vec![query], &[file]);
        assert_eq!(vulns.len(), 1);
        assert_eq!(vulns[0].issue_type, IssueType::RedundantAttribute);
        assert_eq!(vulns[0].search_key, "resource.aws_instance.web.credentials");
    }

    #[test]
    fn kubernetes_search_keys_are_anchored_at_metadata_name() {
        let query = compile(
            "host-network",
            "kubernetes",
            "scope:\n  path: spec\nchecks:\n  - path: hostNetwork\n    assert: not_equals\n    value: true\n",
        );
        let doc: Document = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "web"},
            "spec": {"hostNetwork": true},
        });
        let file = FileMetadata {
            id: "k8s-1".into(),
            scan_id: "scan".into(),
            file_name: PathBuf::from("pod.yaml"),
            kind: FileKind::Kubernetes,
            document: doc,
            original_data: "apiVersion: v1\nkind: Pod\nmetadata:\n  name: web\nspec:\n  hostNetwork: true\n".into(),
            content: String::new(),
            helm_id: String::new(),
            id_info: HashMap::new(),
        };
        let vulns = inspect(vec![query], &[file]);
        assert_eq!(vulns.len(), 1);
        assert_eq!(
            vulns[0].search_key,
            "metadata.name={{web}}.spec.hostNetwork"
        );
        assert_eq!(vulns[0].line, 6);
    }

    #[test]
    fn common_documents_are_skipped() {
        let query = compile(
            "any-check",
            "terraform",
            "scope:\n  path: resource\nchecks:\n  - path: anything\n    assert: exists\n",
        );
        let file = FileMetadata {
            id: "c-1".into(),
            scan_id: "scan".into(),
            file_name: PathBuf::from("data.json"),
            kind: FileKind::Common,
            document: serde_json::json!({"resource": {}}),
            original_data: "{}".into(),
            content: String::new(),
            helm_id: String::new(),
            id_info: HashMap::new(),
        };
        assert!(inspect(vec![query], &[file]).is_empty());
    }

    #[test]
    fn findings_are_deterministic_and_canonically_sorted() {
        let queries = vec![
            compile(
                "z-query",
                "terraform",
                "scope:\n  path: resource.aws_s3_bucket.*\nchecks:\n  - path: versioning\n    assert: exists\n",
            ),
            compile(
                "a-query",
                "terraform",
                "scope:\n  path: resource.aws_s3_bucket.*\nchecks:\n  - path: logging\n    assert: exists\n",
            ),
        ];
        let files = vec![
            terraform_file("b.tf", "resource \"aws_s3_bucket\" \"two\" {\n  acl = \"private\"\n}\n"),
            terraform_file("a.tf", "resource \"aws_s3_bucket\" \"one\" {\n  acl = \"private\"\n}\n"),
        ];
        let first = inspect(queries.clone(), &files);
        let second = inspect(queries, &files);
        assert_eq!(first.len(), 4);
        let keys: Vec<_> = first
            .iter()
            .map(|v| (v.file_name.clone(), v.line, v.query_id.clone(), v.search_key.clone()))
            .collect();
        assert_eq!(
            keys,
            second
                .iter()
                .map(|v| (v.file_name.clone(), v.line, v.query_id.clone(), v.search_key.clone()))
                .collect::<Vec<_>>()
        );
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        // ids are stable across scans of the same input
        assert_eq!(first[0].id, second[0].id);
    }

    #[test]
    fn zero_timeout_drops_pairs_without_aborting() {
        let query = compile(
            "any-check",
            "terraform",
            "scope:\n  path: resource.aws_s3_bucket.*\nchecks:\n  - path: versioning\n    assert: exists\n",
        );
        let inspector = Inspector::new(
            QueryBundle {
                queries: vec![query],
            },
            InspectorConfig {
                query_timeout: Some(Duration::ZERO),
                output_lines: 3,
            },
        );
        let file = terraform_file("a.tf", "resource \"aws_s3_bucket\" \"one\" {}\n");
        let tracker = CounterTracker::new();
        let vulns = inspector
            .inspect(&ScanContext::new(), "scan", &[file], Path::new(""), &tracker)
            .unwrap();
        assert!(vulns.is_empty());
        assert_eq!(tracker.evaluated(), 1);
    }

    #[test]
    fn cancellation_aborts_inspection() {
        let query = compile(
            "any-check",
            "terraform",
            "scope:\n  path: resource\nchecks:\n  - path: x\n    assert: exists\n",
        );
        let inspector = Inspector::new(
            QueryBundle {
                queries: vec![query],
            },
            InspectorConfig::default(),
        );
        let ctx = ScanContext::new();
        ctx.cancel();
        let file = terraform_file("a.tf", "resource \"aws_s3_bucket\" \"one\" {}\n");
        let tracker = CounterTracker::new();
        assert!(inspector
            .inspect(&ctx, "scan", &[file], Path::new(""), &tracker)
            .is_err());
    }
}
