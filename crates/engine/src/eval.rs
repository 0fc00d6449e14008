//! Declarative tree matcher: the executable body of a query. A body
//! selects scope nodes with a dotted path (wildcards allowed, sequences
//! transparent), filters them with conditions, and asserts attributes.
//! Every failed assertion yields one raw finding keyed by a search key
//! the line detector can resolve.

use crate::bundle::QueryMetadata;
use anyhow::{bail, Result};
use model::{FileKind, FileMetadata, IssueType, RawFinding};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Deserialize)]
pub struct QueryBody {
    #[serde(default)]
    pub scope: Scope,
    pub checks: Vec<Check>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Scope {
    /// Dotted path selecting the nodes to examine; `*` matches any key,
    /// sequences are iterated transparently. Empty selects the document.
    #[serde(default)]
    pub path: String,
    /// All conditions must hold for a scope node to be examined.
    #[serde(default, rename = "where")]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Condition {
    pub path: String,
    #[serde(default)]
    pub equals: Option<JsonValue>,
    #[serde(default)]
    pub exists: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssertKind {
    Exists,
    Absent,
    Equals,
    NotEquals,
    OneOf,
    NotOneOf,
    Matches,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Check {
    pub path: String,
    pub assert: AssertKind,
    #[serde(default)]
    pub value: Option<JsonValue>,
    #[serde(default)]
    pub values: Vec<JsonValue>,
    #[serde(default)]
    pub pattern: Option<String>,
    /// Human description of the compliant state, reported as the
    /// finding's expected value.
    #[serde(default)]
    pub expected: Option<String>,
}

#[derive(Debug, Clone)]
struct CompiledCheck {
    path: Vec<String>,
    raw_path: String,
    assert: AssertKind,
    value: Option<JsonValue>,
    values: Vec<JsonValue>,
    regex: Option<Regex>,
    expected: String,
}

#[derive(Debug, Clone)]
pub struct CompiledQuery {
    pub metadata: QueryMetadata,
    scope_path: Vec<String>,
    conditions: Vec<Condition>,
    checks: Vec<CompiledCheck>,
}

impl CompiledQuery {
    pub fn compile(metadata: QueryMetadata, body: QueryBody) -> Result<Self> {
        if body.checks.is_empty() {
            bail!("query has no checks");
        }
        let mut checks = Vec::with_capacity(body.checks.len());
        for check in body.checks {
            checks.push(compile_check(check)?);
        }
        Ok(Self {
            metadata,
            scope_path: split_path(&body.scope.path),
            conditions: body.scope.conditions,
            checks,
        })
    }
}

fn compile_check(check: Check) -> Result<CompiledCheck> {
    let regex = match (&check.assert, &check.pattern) {
        (AssertKind::Matches, Some(pattern)) => Some(Regex::new(pattern)?),
        (AssertKind::Matches, None) => bail!("'matches' assertion needs a pattern"),
        _ => None,
    };
    match check.assert {
        AssertKind::Equals | AssertKind::NotEquals if check.value.is_none() => {
            bail!("'{}' assertion needs a value", assert_name(check.assert));
        }
        AssertKind::OneOf | AssertKind::NotOneOf if check.values.is_empty() => {
            bail!("'{}' assertion needs values", assert_name(check.assert));
        }
        _ => {}
    }
    let expected = check
        .expected
        .unwrap_or_else(|| default_expected(&check.path, check.assert, &check.value, &check.values));
    Ok(CompiledCheck {
        path: split_path(&check.path),
        raw_path: check.path,
        assert: check.assert,
        value: check.value,
        values: check.values,
        regex,
        expected,
    })
}

fn assert_name(kind: AssertKind) -> &'static str {
    match kind {
        AssertKind::Exists => "exists",
        AssertKind::Absent => "absent",
        AssertKind::Equals => "equals",
        AssertKind::NotEquals => "not_equals",
        AssertKind::OneOf => "one_of",
        AssertKind::NotOneOf => "not_one_of",
        AssertKind::Matches => "matches",
    }
}

fn default_expected(
    path: &str,
    kind: AssertKind,
    value: &Option<JsonValue>,
    values: &[JsonValue],
) -> String {
    let last = path.rsplit('.').next().unwrap_or(path);
    match kind {
        AssertKind::Exists => format!("'{path}' is defined"),
        AssertKind::Absent => format!("'{path}' is undefined"),
        AssertKind::Equals => format!(
            "'{last}' is {}",
            value.as_ref().map(value_text).unwrap_or_default()
        ),
        AssertKind::NotEquals => format!(
            "'{last}' is not {}",
            value.as_ref().map(value_text).unwrap_or_default()
        ),
        AssertKind::OneOf => format!(
            "'{last}' is one of [{}]",
            values.iter().map(value_text).collect::<Vec<_>>().join(", ")
        ),
        AssertKind::NotOneOf => format!(
            "'{last}' is not one of [{}]",
            values.iter().map(value_text).collect::<Vec<_>>().join(", ")
        ),
        AssertKind::Matches => format!("'{last}' matches the expected pattern"),
    }
}

/// Evaluates one query against one document. Findings come out in
/// document traversal order, which is stable for a given input.
pub fn eval(query: &CompiledQuery, file: &FileMetadata) -> Vec<RawFinding> {
    let prefix = key_prefix(file);
    let mut scopes = Vec::new();
    resolve_path(&file.document, &query.scope_path, Vec::new(), &mut scopes);

    let mut findings = Vec::new();
    for (node, scope_key) in scopes {
        if !query
            .conditions
            .iter()
            .all(|cond| condition_holds(node, cond))
        {
            continue;
        }
        for check in &query.checks {
            apply_check(node, &scope_key, check, file, &prefix, &mut findings);
        }
    }
    findings
}

fn apply_check(
    node: &JsonValue,
    scope_key: &[String],
    check: &CompiledCheck,
    file: &FileMetadata,
    prefix: &[String],
    out: &mut Vec<RawFinding>,
) {
    match check.assert {
        AssertKind::Exists => {
            let mut missing_sites = Vec::new();
            collect_missing(node, &check.path, Vec::new(), &mut missing_sites);
            for site in missing_sites {
                out.push(RawFinding {
                    document_id: file.id.clone(),
                    search_key: join_key(prefix, scope_key, &site),
                    issue_type: IssueType::MissingAttribute,
                    key_expected_value: check.expected.clone(),
                    key_actual_value: format!("'{}' is undefined", check.raw_path),
                });
            }
        }
        AssertKind::Absent => {
            let mut leaves = Vec::new();
            resolve_path(node, &check.path, Vec::new(), &mut leaves);
            for (_, leaf_key) in leaves {
                out.push(RawFinding {
                    document_id: file.id.clone(),
                    search_key: join_key(prefix, scope_key, &leaf_key),
                    issue_type: IssueType::RedundantAttribute,
                    key_expected_value: check.expected.clone(),
                    key_actual_value: format!("'{}' is defined", check.raw_path),
                });
            }
        }
        _ => {
            let mut leaves = Vec::new();
            resolve_path(node, &check.path, Vec::new(), &mut leaves);
            let last = check.raw_path.rsplit('.').next().unwrap_or(&check.raw_path);
            for (leaf, leaf_key) in leaves {
                if violates(check, leaf) {
                    out.push(RawFinding {
                        document_id: file.id.clone(),
                        search_key: join_key(prefix, scope_key, &leaf_key),
                        issue_type: IssueType::IncorrectValue,
                        key_expected_value: check.expected.clone(),
                        key_actual_value: format!("'{last}' is {}", value_text(leaf)),
                    });
                }
            }
        }
    }
}

fn violates(check: &CompiledCheck, leaf: &JsonValue) -> bool {
    match check.assert {
        AssertKind::Equals => check.value.as_ref() != Some(leaf),
        AssertKind::NotEquals => check.value.as_ref() == Some(leaf),
        AssertKind::OneOf => !check.values.contains(leaf),
        AssertKind::NotOneOf => check.values.contains(leaf),
        AssertKind::Matches => check
            .regex
            .as_ref()
            .map(|re| !re.is_match(&value_text(leaf)))
            .unwrap_or(false),
        AssertKind::Exists | AssertKind::Absent => false,
    }
}

fn condition_holds(node: &JsonValue, cond: &Condition) -> bool {
    let resolved = get_first(node, &split_path(&cond.path));
    if let Some(expected) = &cond.equals {
        return resolved == Some(expected);
    }
    if let Some(exists) = cond.exists {
        return resolved.is_some() == exists;
    }
    resolved.is_some()
}

/// All nodes matched by `segments`, together with the search-key segments
/// that lead there. Sequence elements contribute a `name={{..}}` segment
/// when they carry a name, their index otherwise.
fn resolve_path<'a>(
    value: &'a JsonValue,
    segments: &[String],
    key: Vec<String>,
    out: &mut Vec<(&'a JsonValue, Vec<String>)>,
) {
    if let JsonValue::Array(items) = value {
        if !segments.is_empty() {
            for (idx, item) in items.iter().enumerate() {
                let mut item_key = key.clone();
                item_key.push(element_key(item, idx));
                resolve_path(item, segments, item_key, out);
            }
            return;
        }
    }
    let Some((first, rest)) = segments.split_first() else {
        out.push((value, key));
        return;
    };
    if let JsonValue::Object(map) = value {
        if first == "*" {
            for (k, v) in map {
                let mut child_key = key.clone();
                child_key.push(k.clone());
                resolve_path(v, rest, child_key, out);
            }
        } else if let Some(v) = map.get(first) {
            let mut child_key = key;
            child_key.push(first.clone());
            resolve_path(v, rest, child_key, out);
        }
    }
}

fn get_first<'a>(value: &'a JsonValue, segments: &[String]) -> Option<&'a JsonValue> {
    let Some((first, rest)) = segments.split_first() else {
        return Some(value);
    };
    match value {
        JsonValue::Array(items) => items.iter().find_map(|item| get_first(item, segments)),
        JsonValue::Object(map) => {
            if first == "*" {
                map.values().find_map(|v| get_first(v, rest))
            } else {
                map.get(first).and_then(|v| get_first(v, rest))
            }
        }
        _ => None,
    }
}

/// Walks an `exists` path and records the deepest existing ancestor of
/// every branch where the path dead-ends.
fn collect_missing(
    value: &JsonValue,
    segments: &[String],
    key: Vec<String>,
    missing: &mut Vec<Vec<String>>,
) {
    if let JsonValue::Array(items) = value {
        if !segments.is_empty() {
            for (idx, item) in items.iter().enumerate() {
                let mut item_key = key.clone();
                item_key.push(element_key(item, idx));
                collect_missing(item, segments, item_key, missing);
            }
            return;
        }
    }
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    match value {
        JsonValue::Object(map) => {
            if first == "*" {
                for (k, v) in map {
                    let mut child_key = key.clone();
                    child_key.push(k.clone());
                    collect_missing(v, rest, child_key, missing);
                }
            } else if let Some(v) = map.get(first) {
                let mut child_key = key;
                child_key.push(first.clone());
                collect_missing(v, rest, child_key, missing);
            } else {
                missing.push(key);
            }
        }
        _ => missing.push(key),
    }
}

fn element_key(item: &JsonValue, idx: usize) -> String {
    match item.get("name").and_then(JsonValue::as_str) {
        Some(name) => format!("name={{{{{name}}}}}"),
        None => idx.to_string(),
    }
}

/// Search keys for Kubernetes documents are anchored at `metadata.name`
/// so multi-document files stay unambiguous; Helm adds the split marker
/// in front.
fn key_prefix(file: &FileMetadata) -> Vec<String> {
    let mut prefix = Vec::new();
    match file.kind {
        FileKind::Helm => {
            let marker = file
                .helm_id
                .trim_start_matches('#')
                .trim()
                .trim_end_matches(':');
            if !marker.is_empty() {
                prefix.push(marker.to_string());
            }
            push_metadata_anchor(file, &mut prefix);
        }
        FileKind::Kubernetes => push_metadata_anchor(file, &mut prefix),
        _ => {}
    }
    prefix
}

fn push_metadata_anchor(file: &FileMetadata, prefix: &mut Vec<String>) {
    if let Some(name) = file
        .document
        .get("metadata")
        .and_then(|m| m.get("name"))
        .and_then(JsonValue::as_str)
    {
        prefix.push("metadata".to_string());
        prefix.push(format!("name={{{{{name}}}}}"));
    }
}

fn join_key(prefix: &[String], scope_key: &[String], leaf_key: &[String]) -> String {
    prefix
        .iter()
        .chain(scope_key.iter())
        .chain(leaf_key.iter())
        .cloned()
        .collect::<Vec<_>>()
        .join(".")
}

fn split_path(path: &str) -> Vec<String> {
    path.split('.')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn value_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}
