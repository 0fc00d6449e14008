use anyhow::{Context, Result};
use model::{Document, FileKind};
use serde_json::Value as JsonValue;

/// Parses a JSON template. CloudFormation templates are recognized by
/// their `Resources`/`AWSTemplateFormatVersion` shape; anything else is a
/// valid but unclassified document.
pub fn parse_json(content: &str) -> Result<(Vec<Document>, FileKind)> {
    let value: JsonValue = serde_json::from_str(content).context("failed to parse JSON")?;
    let kind = if value.get("AWSTemplateFormatVersion").is_some()
        || value
            .get("Resources")
            .and_then(JsonValue::as_object)
            .is_some_and(|m| m.values().any(|r| r.get("Type").is_some()))
    {
        FileKind::CloudFormation
    } else {
        FileKind::Common
    };
    Ok((vec![value], kind))
}
