use anyhow::{anyhow, Result};
use hcl_edit::{expr::Expression, structure::Body};
use model::{Document, FileKind};
use serde_json::{Map, Value as JsonValue};

/// Parses a Terraform file into a single document. Blocks nest by ident
/// and labels (`resource "aws_s3_bucket" "logs" { .. }` becomes
/// `resource.aws_s3_bucket.logs`); repeated block names at the same level
/// collect into a sequence. Module resolution is out of the parser's
/// hands; only top-level structure is returned.
pub fn parse_terraform(content: &str) -> Result<(Vec<Document>, FileKind)> {
    let body: Body = content
        .parse()
        .map_err(|e| anyhow!("failed to parse HCL: {e}"))?;
    let root = body_to_value(&body);
    Ok((vec![JsonValue::Object(root)], FileKind::Terraform))
}

fn body_to_value(body: &Body) -> Map<String, JsonValue> {
    let mut out = Map::new();
    for attr in body.attributes() {
        out.insert(attr.key.as_str().to_string(), expr_to_value(&attr.value));
    }
    for block in body.blocks() {
        let mut keys = vec![block.ident.as_str().to_string()];
        keys.extend(block.labels.iter().map(|l| l.as_str().to_string()));
        insert_block(
            &mut out,
            &keys,
            JsonValue::Object(body_to_value(&block.body)),
        );
    }
    out
}

fn insert_block(map: &mut Map<String, JsonValue>, keys: &[String], value: JsonValue) {
    let (first, rest) = match keys.split_first() {
        Some(split) => split,
        None => return,
    };
    if rest.is_empty() {
        match map.get_mut(first) {
            None => {
                map.insert(first.clone(), value);
            }
            Some(JsonValue::Array(items)) => items.push(value),
            Some(existing) => {
                let previous = existing.take();
                *existing = JsonValue::Array(vec![previous, value]);
            }
        }
        return;
    }
    let entry = map
        .entry(first.clone())
        .or_insert_with(|| JsonValue::Object(Map::new()));
    if let JsonValue::Object(inner) = entry {
        insert_block(inner, rest, value);
    }
}

/// Literals keep their scalar type; references, function calls and
/// templates are kept as their source text so policies can still match
/// on them.
fn expr_to_value(expr: &Expression) -> JsonValue {
    match expr {
        Expression::Null(_) => JsonValue::Null,
        Expression::Bool(b) => JsonValue::Bool(*b.value()),
        Expression::Number(n) => {
            let num = n.value();
            if let Some(i) = num.as_i64() {
                JsonValue::from(i)
            } else if let Some(u) = num.as_u64() {
                JsonValue::from(u)
            } else if let Some(f) = num.as_f64() {
                serde_json::Number::from_f64(f)
                    .map(JsonValue::Number)
                    .unwrap_or(JsonValue::Null)
            } else {
                JsonValue::Null
            }
        }
        Expression::String(s) => JsonValue::String(s.as_str().to_string()),
        Expression::Array(arr) => JsonValue::Array(arr.iter().map(expr_to_value).collect()),
        Expression::Object(obj) => {
            let mut out = Map::new();
            for (k, v) in obj.iter() {
                let key = k
                    .as_ident()
                    .map(|id| id.as_str().to_string())
                    .unwrap_or_else(|| {
                        k.as_expr()
                            .map(|e| e.to_string())
                            .unwrap_or_default()
                            .trim()
                            .trim_matches('"')
                            .to_string()
                    });
                out.insert(key, expr_to_value(v.expr()));
            }
            JsonValue::Object(out)
        }
        other => JsonValue::String(other.to_string().trim().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nests_blocks_by_ident_and_labels() {
        let input = r#"
resource "aws_lambda_permission" "events" {
  statement_id = "AllowExecutionFromCloudWatch"
  action       = "lambda:InvokeFunction"
  principal    = "events.amazonaws.com"
}
"#;
        let (docs, kind) = parse_terraform(input).unwrap();
        assert_eq!(kind, FileKind::Terraform);
        assert_eq!(
            docs[0]["resource"]["aws_lambda_permission"]["events"]["principal"],
            json!("events.amazonaws.com")
        );
    }

    #[test]
    fn preserves_scalar_types_in_nested_blocks() {
        let input = r#"
resource "aws_cloudfront_distribution" "cdn" {
  enabled = true
  viewer_certificate {
    cloudfront_default_certificate = false
    minimum_protocol_version       = "TLSv1"
  }
}
"#;
        let (docs, _) = parse_terraform(input).unwrap();
        let cert = &docs[0]["resource"]["aws_cloudfront_distribution"]["cdn"]["viewer_certificate"];
        assert_eq!(cert["cloudfront_default_certificate"], json!(false));
        assert_eq!(cert["minimum_protocol_version"], json!("TLSv1"));
    }

    #[test]
    fn repeated_blocks_collect_into_a_sequence() {
        let input = r#"
resource "aws_security_group" "sg" {
  ingress {
    from_port = 22
  }
  ingress {
    from_port = 80
  }
}
"#;
        let (docs, _) = parse_terraform(input).unwrap();
        let ingress = &docs[0]["resource"]["aws_security_group"]["sg"]["ingress"];
        assert_eq!(ingress[0]["from_port"], json!(22));
        assert_eq!(ingress[1]["from_port"], json!(80));
    }

    #[test]
    fn unresolvable_expressions_keep_their_source_text() {
        let input = "locals {\n  name = var.prefix\n}\n";
        let (docs, _) = parse_terraform(input).unwrap();
        assert_eq!(docs[0]["locals"]["name"], json!("var.prefix"));
    }

    #[test]
    fn malformed_hcl_is_an_error() {
        assert!(parse_terraform("resource \"a\" {").is_err());
    }
}
