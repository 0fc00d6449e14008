//! Line detection for Helm-rendered files. The search key is anchored at
//! a split marker (`KICS_HELM_ID_<n>`); detection runs inside the marked
//! sub-document and the split line map inverts any shifts the rendering
//! introduced.

use crate::search_key::Segment;
use crate::{excerpt, indent};
use model::{FileMetadata, VulnerabilityLines};
use tracing::debug;

pub fn detect(
    file: &FileMetadata,
    segments: &[Segment],
    output_lines: usize,
) -> VulnerabilityLines {
    let Some((anchor, path)) = segments.split_first() else {
        return VulnerabilityLines::default();
    };
    let Some(split_number) = split_number(&anchor.key) else {
        debug!(file = %file.file_name.display(), key = %anchor.key, "Search key has no helm marker");
        return VulnerabilityLines::default();
    };
    let marker = format!("# {}", anchor.key);

    let lines: Vec<&str> = file.original_data.lines().collect();
    let Some((start, end, base)) = sub_document(&lines, &marker) else {
        debug!(file = %file.file_name.display(), marker, "Split marker not found");
        return VulnerabilityLines::default();
    };
    let window = &lines[start..end];

    let Some(found) = indent::find(window, path) else {
        return VulnerabilityLines::default();
    };
    let remap = |idx: usize| -> usize {
        file.id_info
            .get(&split_number)
            .and_then(|m| m.get(&idx))
            .copied()
            .unwrap_or(idx)
    };
    let line = base + remap(found);
    VulnerabilityLines {
        line,
        vuln_lines: excerpt(window, found, output_lines, |idx| base + remap(idx)),
        line_with_vulnerability: window[found].to_string(),
    }
}

fn split_number(anchor_key: &str) -> Option<usize> {
    anchor_key
        .strip_prefix("KICS_HELM_ID_")
        .and_then(|n| n.parse().ok())
}

/// Range of the sub-document whose lines carry `marker`, plus the number
/// of content lines before it (`---` separators excluded).
fn sub_document(lines: &[&str], marker: &str) -> Option<(usize, usize, usize)> {
    let mut start = 0usize;
    let mut base = 0usize;
    let mut found: Option<(usize, usize, usize)> = None;
    for (idx, line) in lines.iter().enumerate() {
        if line.trim() == "---" {
            if found.is_none() {
                base += idx - start;
                start = idx + 1;
            } else if let Some((s, _, b)) = found {
                return Some((s, idx, b));
            }
            continue;
        }
        if found.is_none() && line.contains(marker) {
            found = Some((start, lines.len(), base));
        }
    }
    found
}
