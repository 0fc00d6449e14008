//! Brace-based scanner for Terraform/HCL and JSON sources. Nesting is
//! tracked by brace/bracket depth instead of indentation; block labels
//! (`resource "aws_s3_bucket" "logs"`) are consumed from the line that
//! opened the block.

use crate::search_key::Segment;

pub fn find(window: &[&str], segments: &[Segment]) -> Option<usize> {
    let depth_before = depths(window);
    let mut last_matched: Option<usize> = None;
    let mut cursor = 0usize;
    // JSON documents open with a bare brace, so members live at depth 1
    let mut expected_depth = match window.iter().find(|l| !l.trim().is_empty()) {
        Some(l) if l.trim().starts_with('{') => 1,
        _ => 0,
    };

    for segment in segments {
        // labels of an already matched block line
        if let Some(found) = last_matched {
            if window[found].contains(&format!("\"{}\"", segment.key)) {
                continue;
            }
        }
        let mut found = None;
        for (i, line) in window.iter().enumerate().skip(cursor) {
            if depth_before[i] < expected_depth {
                if last_matched.is_some() {
                    break;
                }
                continue;
            }
            if depth_before[i] == expected_depth && declares(line, segment) {
                found = Some(i);
                break;
            }
        }
        let Some(line_idx) = found else {
            return last_matched;
        };
        last_matched = Some(line_idx);
        cursor = line_idx + 1;
        expected_depth = depth_before[line_idx] + 1;
    }
    last_matched
}

/// Depth at the start of each line, counting braces and brackets outside
/// string literals.
fn depths(window: &[&str]) -> Vec<isize> {
    let mut out = Vec::with_capacity(window.len());
    let mut depth = 0isize;
    for line in window {
        out.push(depth);
        let mut in_string = false;
        let mut prev = '\0';
        for c in line.chars() {
            match c {
                '"' if prev != '\\' => in_string = !in_string,
                '{' | '[' if !in_string => depth += 1,
                '}' | ']' if !in_string => depth -= 1,
                _ => {}
            }
            prev = c;
        }
    }
    out
}

fn declares(line: &str, segment: &Segment) -> bool {
    let trimmed = line.trim_start();
    let key = &segment.key;
    let declared = trimmed
        .strip_prefix(&format!("\"{key}\""))
        .or_else(|| trimmed.strip_prefix(key.as_str()))
        .is_some_and(|rest| {
            rest.is_empty()
                || rest.starts_with([' ', '\t', '=', ':', '{'])
        });
    if !declared {
        return false;
    }
    match &segment.value {
        None => true,
        Some(value) => line.contains(value.as_str()) || (segment.rendered && line.contains("{{")),
    }
}
