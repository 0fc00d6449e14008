//! Indentation-based scanner for YAML-family sources. Walks the window
//! line by line, nesting by indentation, and resolves a sequence of
//! search-key segments to the best matching line.

use crate::search_key::Segment;

/// Resolves `segments` against `window`. Returns the 0-based index of the
/// matched line, the last matched ancestor when the path cannot be fully
/// resolved, or `None` when not even the first segment matches.
///
/// Duplicate keys at the same nesting: intermediate segments take the
/// first occurrence; when the final segment is ambiguous the enclosing
/// parent line is returned instead, so findings never point at the wrong
/// sibling.
pub fn find(window: &[&str], segments: &[Segment]) -> Option<usize> {
    let mut last_matched: Option<usize> = None;
    // (line, indent) of matched ancestors still in scope
    let mut stack: Vec<(usize, usize)> = Vec::new();
    let mut cursor = 0usize;

    for (si, segment) in segments.iter().enumerate() {
        let is_last = si + 1 == segments.len();
        let mut found = None;
        let mut i = cursor;
        while i < window.len() {
            let line = window[i];
            let Some((indent, key, rest)) = line_key(line) else {
                i += 1;
                continue;
            };
            while stack.last().is_some_and(|&(_, ind)| indent <= ind) {
                stack.pop();
            }
            if key == segment.key && value_matches(segment, rest, window, i, indent) {
                found = Some((i, indent));
                break;
            }
            i += 1;
        }

        let Some((line_idx, indent)) = found else {
            return last_matched;
        };
        // a bare leaf key duplicated at the same nesting is ambiguous;
        // report the enclosing scope instead of guessing a sibling
        if is_last
            && segment.value.is_none()
            && count_siblings(window, &stack, indent, &segment.key) > 1
        {
            return last_matched;
        }
        stack.push((line_idx, indent));
        last_matched = Some(line_idx);
        cursor = line_idx + 1;
    }
    last_matched
}

/// Indent, key and trailing value of a line; `None` for blanks, comments
/// and lines without a key separator.
fn line_key(line: &str) -> Option<(usize, &str, &str)> {
    let trimmed_start = line.trim_start();
    if trimmed_start.is_empty() || trimmed_start.starts_with('#') {
        return None;
    }
    let indent = line.len() - trimmed_start.len();
    let mut body = trimmed_start;
    while let Some(rest) = body.strip_prefix("- ") {
        body = rest;
    }
    let (key_part, rest) = body.split_once(':')?;
    let key = key_part.trim().trim_matches('"').trim_matches('\'');
    if key.is_empty() || key.contains(' ') {
        return None;
    }
    Some((indent, key, rest.trim()))
}

fn value_matches(
    segment: &Segment,
    rest: &str,
    window: &[&str],
    line_idx: usize,
    indent: usize,
) -> bool {
    let Some(value) = &segment.value else {
        return true;
    };
    if rest.contains(value.as_str()) {
        return true;
    }
    // rendered expressions cannot be compared against template source
    if segment.rendered && rest.contains("{{") {
        return true;
    }
    // value continuing on deeper lines
    if rest.is_empty() {
        for line in window.iter().skip(line_idx + 1) {
            let deeper = line.trim_start();
            if deeper.is_empty() {
                continue;
            }
            let line_indent = line.len() - deeper.len();
            if line_indent <= indent {
                break;
            }
            if line.contains(value.as_str()) || (segment.rendered && line.contains("{{")) {
                return true;
            }
        }
    }
    false
}

/// Occurrences of `key` at `indent` inside the enclosing matched block.
fn count_siblings(window: &[&str], stack: &[(usize, usize)], indent: usize, key: &str) -> usize {
    let (start, parent_indent) = match stack.last() {
        Some(&(line, ind)) => (line + 1, Some(ind)),
        None => (0, None),
    };
    let mut count = 0;
    for line in window.iter().skip(start) {
        let Some((line_indent, line_key, _)) = line_key(line) else {
            continue;
        };
        if parent_indent.is_some_and(|p| line_indent <= p) {
            break;
        }
        if line_indent == indent && line_key == key {
            count += 1;
        }
    }
    count
}
