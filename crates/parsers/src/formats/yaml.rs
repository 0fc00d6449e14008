use anyhow::{Context, Result};
use model::{Document, FileKind};
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};
use serde_yaml::Value as YamlValue;

/// Parses a YAML stream into one document per `---` section and sniffs the
/// kind from the document shape. Scalar types are preserved so policies
/// can compare numbers and booleans, not their string forms.
pub fn parse_yaml(content: &str) -> Result<(Vec<Document>, FileKind)> {
    let mut documents = Vec::new();
    let mut kind = FileKind::Common;
    for deserializer in serde_yaml::Deserializer::from_str(content) {
        let value =
            YamlValue::deserialize(deserializer).context("failed to parse YAML document")?;
        if value.is_null() {
            continue;
        }
        let doc = yaml_to_document(value);
        if kind == FileKind::Common {
            kind = detect_kind(&doc);
        }
        documents.push(wrap_sequence(doc));
    }
    Ok((documents, kind))
}

/// Sequences are not valid top-level documents for the engine; playbook
/// style files are wrapped under a `playbooks` key.
fn wrap_sequence(doc: JsonValue) -> Document {
    match doc {
        JsonValue::Array(items) => {
            let mut map = Map::new();
            map.insert("playbooks".to_string(), JsonValue::Array(items));
            JsonValue::Object(map)
        }
        other => other,
    }
}

fn detect_kind(doc: &JsonValue) -> FileKind {
    match doc {
        JsonValue::Object(map) => {
            if map.contains_key("apiVersion") && map.contains_key("kind") {
                FileKind::Kubernetes
            } else if map.contains_key("AWSTemplateFormatVersion")
                || map.get("Resources").is_some_and(is_cloudformation_resources)
            {
                FileKind::CloudFormation
            } else {
                FileKind::Common
            }
        }
        JsonValue::Array(items) => {
            let playbook = items.iter().any(|item| {
                item.as_object().is_some_and(|m| {
                    m.contains_key("hosts") || m.contains_key("tasks") || m.contains_key("roles")
                })
            });
            if playbook {
                FileKind::Ansible
            } else {
                FileKind::Common
            }
        }
        _ => FileKind::Common,
    }
}

fn is_cloudformation_resources(resources: &JsonValue) -> bool {
    resources
        .as_object()
        .is_some_and(|m| m.values().any(|r| r.get("Type").is_some()))
}

fn yaml_to_document(value: YamlValue) -> JsonValue {
    match value {
        YamlValue::Null => JsonValue::Null,
        YamlValue::Bool(b) => JsonValue::Bool(b),
        YamlValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                JsonValue::from(i)
            } else if let Some(u) = n.as_u64() {
                JsonValue::from(u)
            } else if let Some(f) = n.as_f64() {
                serde_json::Number::from_f64(f)
                    .map(JsonValue::Number)
                    .unwrap_or_else(|| JsonValue::String(f.to_string()))
            } else {
                JsonValue::String(n.to_string())
            }
        }
        YamlValue::String(s) => JsonValue::String(s),
        YamlValue::Sequence(seq) => {
            JsonValue::Array(seq.into_iter().map(yaml_to_document).collect())
        }
        YamlValue::Mapping(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                out.insert(key_to_string(k), yaml_to_document(v));
            }
            JsonValue::Object(out)
        }
        // CloudFormation short intrinsics (`!Ref x`) become single-key maps.
        YamlValue::Tagged(tagged) => {
            let mut out = Map::new();
            let tag = tagged.tag.to_string();
            out.insert(
                tag.trim_start_matches('!').to_string(),
                yaml_to_document(tagged.value),
            );
            JsonValue::Object(out)
        }
    }
}

fn key_to_string(key: YamlValue) -> String {
    match key {
        YamlValue::String(s) => s,
        YamlValue::Bool(b) => b.to_string(),
        YamlValue::Number(n) => n.to_string(),
        other => serde_yaml::to_string(&other)
            .map(|s| s.trim().to_string())
            .unwrap_or_default(),
    }
}
