//! Line detector: given a file's original text, its kind and a search
//! key, finds the line in the on-disk source the finding refers to.
//! Detection is textual against the original bytes, so findings keep
//! accurate positions even though parsing and rendering destroy layout.

use model::{FileKind, FileMetadata, VulnLine, VulnerabilityLines};

mod brace;
mod helm;
mod indent;
mod search_key;

pub use search_key::{parse_search_key, Segment};

/// Resolves `search_key` to a 1-based line in `file`'s original data plus
/// up to `output_lines` excerpted lines around it. Findings are never
/// dropped for lack of a line: when the key cannot be fully resolved the
/// closest matched enclosing scope is reported, and `line` is 0 only when
/// nothing matched at all.
pub fn detect_line(
    file: &FileMetadata,
    search_key: &str,
    output_lines: usize,
) -> VulnerabilityLines {
    let segments = parse_search_key(search_key);
    if segments.is_empty() {
        return VulnerabilityLines::default();
    }
    if file.kind == FileKind::Helm {
        return helm::detect(file, &segments, output_lines);
    }

    let lines: Vec<&str> = file.original_data.lines().collect();
    let found = if uses_braces(file, &lines) {
        brace::find(&lines, &segments)
    } else {
        indent::find(&lines, &segments)
    };
    let Some(found) = found else {
        return VulnerabilityLines::default();
    };
    VulnerabilityLines {
        line: found + 1,
        vuln_lines: excerpt(&lines, found, output_lines, |idx| idx + 1),
        line_with_vulnerability: lines[found].to_string(),
    }
}

/// Terraform and JSON sources nest by brace; everything else in the
/// supported set nests by indentation.
fn uses_braces(file: &FileMetadata, lines: &[&str]) -> bool {
    match file.kind {
        FileKind::Terraform => true,
        FileKind::Kubernetes | FileKind::Ansible | FileKind::Helm => false,
        _ => lines
            .iter()
            .find(|l| !l.trim().is_empty())
            .is_some_and(|l| l.trim_start().starts_with('{')),
    }
}

/// Up to `output_lines` lines centered on `found`, positions computed by
/// `to_position` so callers can apply split remapping.
fn excerpt(
    window: &[&str],
    found: usize,
    output_lines: usize,
    to_position: impl Fn(usize) -> usize,
) -> Vec<VulnLine> {
    if output_lines == 0 {
        return Vec::new();
    }
    let start = found.saturating_sub(output_lines / 2);
    window
        .iter()
        .enumerate()
        .skip(start)
        .take(output_lines)
        .map(|(idx, line)| VulnLine {
            position: to_position(idx),
            line: line.to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::{Document, FileKind, FileMetadata};
    use std::collections::HashMap;

    fn helm_file(name: &str, helm_id: &str, original_data: &str) -> FileMetadata {
        FileMetadata {
            id: "1".into(),
            scan_id: "console".into(),
            file_name: name.into(),
            kind: FileKind::Helm,
            document: Document::default(),
            original_data: original_data.into(),
            content: String::new(),
            helm_id: helm_id.into(),
            id_info: HashMap::new(),
        }
    }

    const POD_TEMPLATE: &str = r#"# KICS_HELM_ID_0:
apiVersion: v1
kind: Pod
metadata:
  name: "{{ include "test_helm.fullname" . }}-test-connection"
  labels:
    {{- include "test_helm.labels" . | nindent 4 }}
  annotations:
	"helm.sh/hook": test
spec:
  containers:
    - name: wget
      image: busybox
	  command: ['wget']
	  args: ['{{ include "test_helm.fullname" . }}:{{ .Values.service.port }}']
    restartPolicy: Never
"#;

    #[test]
    fn detects_helm_line() {
        let file = helm_file("test-connection.yaml", "# KICS_HELM_ID_0", POD_TEMPLATE);
        let got = detect_line(
            &file,
            "KICS_HELM_ID_0.metadata.name={{RELEASE-NAME-test_helm-test-connection}}.spec.containers",
            1,
        );
        assert_eq!(
            got,
            VulnerabilityLines {
                line: 10,
                vuln_lines: vec![VulnLine {
                    position: 10,
                    line: "  containers:".into(),
                }],
                line_with_vulnerability: "  containers:".into(),
            }
        );
    }

    #[test]
    fn duplicate_keys_fall_back_to_the_enclosing_scope() {
        let original = r#"# KICS_HELM_ID_0:
apiVersion: v1
kind: Pod
metadata:
  name: "{{ include "test_helm.fullname" . }}-test-connection"
  labels:
    {{- include "test_helm.labels" . | nindent 4 }}
  annotations:
	"helm.sh/hook": test
spec:
  containers:
    - name: wget
      image: busybox
	  command: ['wget']
	  args: ['{{ include "test_helm.fullname" . }}:{{ .Values.service.port }}']
    restartPolicy: Never
  containers:
    - name: wget2
      image: busybox
	  command: ['wget']
	  args: ['{{ include "test_helm.fullname" . }}:{{ .Values.service.port }}']
    restartPolicy: Never
"#;
        let mut file = helm_file("test-dup_values.yaml", "# KICS_HELM_ID_0", original);
        let identity: HashMap<usize, usize> = (0..23).filter(|i| *i != 20).map(|i| (i, i)).collect();
        file.id_info.insert(0, identity);
        let got = detect_line(
            &file,
            "KICS_HELM_ID_0.metadata.name={{RELEASE-NAME-test_helm-test-connection}}.spec.containers",
            1,
        );
        assert_eq!(
            got,
            VulnerabilityLines {
                line: 9,
                vuln_lines: vec![VulnLine {
                    position: 9,
                    line: "spec:".into(),
                }],
                line_with_vulnerability: "spec:".into(),
            }
        );
    }

    #[test]
    fn multi_document_files_anchor_at_their_marker() {
        let original = format!(
            "{}---\n{}",
            POD_TEMPLATE,
            POD_TEMPLATE.replacen("KICS_HELM_ID_0", "KICS_HELM_ID_1", 1)
        );
        let file = helm_file("test-dups.yaml", "# KICS_HELM_ID_1", &original);
        let got = detect_line(
            &file,
            "KICS_HELM_ID_1.metadata.name={{RELEASE-NAME-test_helm-test-connection}}.spec.containers",
            1,
        );
        assert_eq!(got.line, 26);
        assert_eq!(got.line_with_vulnerability, "  containers:");
    }

    #[test]
    fn terraform_files_use_brace_detection() {
        let file = FileMetadata {
            id: "1".into(),
            scan_id: "console".into(),
            file_name: "main.tf".into(),
            kind: FileKind::Terraform,
            document: Document::default(),
            original_data: "resource \"aws_cloudfront_distribution\" \"cdn\" {\n  viewer_certificate {\n    minimum_protocol_version = \"TLSv1\"\n  }\n}\n".into(),
            content: String::new(),
            helm_id: String::new(),
            id_info: HashMap::new(),
        };
        let got = detect_line(
            &file,
            "resource.aws_cloudfront_distribution.cdn.viewer_certificate.minimum_protocol_version",
            3,
        );
        assert_eq!(got.line, 3);
        assert_eq!(got.vuln_lines.len(), 3);
        assert_eq!(got.vuln_lines[0].position, 2);
    }

    #[test]
    fn unresolvable_keys_report_line_zero() {
        let file = FileMetadata {
            id: "1".into(),
            scan_id: "console".into(),
            file_name: "a.yaml".into(),
            kind: FileKind::Kubernetes,
            document: Document::default(),
            original_data: "apiVersion: v1\n".into(),
            content: String::new(),
            helm_id: String::new(),
            id_info: HashMap::new(),
        };
        let got = detect_line(&file, "spec.containers", 1);
        assert_eq!(got, VulnerabilityLines::default());
    }
}
