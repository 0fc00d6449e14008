//! Shared fixtures for the pipeline benchmarks.

use model::FileMetadata;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const CLOUDFRONT_TF: &str = r#"resource "aws_cloudfront_distribution" "cdn" {
  enabled = true
  viewer_certificate {
    cloudfront_default_certificate = false
    minimum_protocol_version       = "TLSv1"
  }
}
"#;

pub const WEAK_TLS_QUERY: &str = r#"
scope:
  path: resource.aws_cloudfront_distribution.*
  where:
    - path: viewer_certificate.cloudfront_default_certificate
      equals: false
checks:
  - path: viewer_certificate.minimum_protocol_version
    assert: one_of
    values: ["TLSv1.2_2019", "TLSv1.2_2021"]
"#;

pub fn terraform_file(name: &str, content: &str) -> FileMetadata {
    let (documents, kind) = parsers::Parser::new()
        .parse(Path::new(name), content)
        .expect("parse fixture");
    FileMetadata {
        id: format!("bench-{name}"),
        scan_id: "bench".into(),
        file_name: PathBuf::from(name),
        kind,
        document: documents.into_iter().next().expect("fixture document"),
        original_data: content.into(),
        content: content.into(),
        helm_id: String::new(),
        id_info: HashMap::new(),
    }
}
