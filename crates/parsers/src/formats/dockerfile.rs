use anyhow::Result;
use model::{Document, FileKind};
use serde_json::{json, Map, Value as JsonValue};
use tracing::debug;

/// Parses a Dockerfile into a single document grouping instructions by
/// build stage:
///
/// ```json
/// { "command": { "<stage>": [ { "cmd": "from", "value": [..], .. } ] } }
/// ```
///
/// The stage key is the `AS` alias when present, otherwise the base image
/// reference. Line continuations are folded into one instruction keeping
/// the start/end line range.
pub fn parse_dockerfile(content: &str) -> Result<(Vec<Document>, FileKind)> {
    debug!("Parsing Dockerfile");
    let mut stages: Map<String, JsonValue> = Map::new();
    let mut stage = String::from("default");

    for instruction in logical_instructions(content) {
        let mut tokens = instruction.text.split_whitespace();
        let Some(cmd) = tokens.next() else { continue };
        let cmd = cmd.to_lowercase();
        let rest = instruction.text[cmd.len()..].trim().to_string();

        let mut flags = Vec::new();
        let mut args = rest.as_str();
        while let Some(flag) = args.split_whitespace().next().filter(|t| t.starts_with("--")) {
            flags.push(flag.to_string());
            args = args[flag.len()..].trim_start();
        }

        if cmd == "from" {
            stage = stage_name(args);
        }

        let entry = json!({
            "cmd": cmd,
            "flags": flags,
            "value": split_value(args),
            "original": instruction.text,
            "start_line": instruction.start_line,
            "end_line": instruction.end_line,
        });
        if let Some(commands) = stages
            .entry(stage.clone())
            .or_insert_with(|| JsonValue::Array(Vec::new()))
            .as_array_mut()
        {
            commands.push(entry);
        }
    }

    let mut root = Map::new();
    root.insert("command".to_string(), JsonValue::Object(stages));
    Ok((vec![JsonValue::Object(root)], FileKind::Dockerfile))
}

struct Instruction {
    text: String,
    start_line: usize,
    end_line: usize,
}

/// Folds `\` continuations, skipping blank lines and comments. Lines are
/// 1-based.
fn logical_instructions(content: &str) -> Vec<Instruction> {
    let mut out = Vec::new();
    let mut current: Option<Instruction> = None;
    for (idx, line) in content.lines().enumerate() {
        let trimmed = line.trim();
        if let Some(instr) = current.as_mut() {
            if trimmed.starts_with('#') {
                continue;
            }
            instr.end_line = idx + 1;
            if let Some(stripped) = trimmed.strip_suffix('\\') {
                instr.text.push(' ');
                instr.text.push_str(stripped.trim());
            } else {
                instr.text.push(' ');
                instr.text.push_str(trimmed);
                out.push(current.take().expect("current instruction"));
            }
            continue;
        }
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let instr = Instruction {
            text: trimmed.strip_suffix('\\').unwrap_or(trimmed).trim().to_string(),
            start_line: idx + 1,
            end_line: idx + 1,
        };
        if trimmed.ends_with('\\') {
            current = Some(instr);
        } else {
            out.push(instr);
        }
    }
    if let Some(instr) = current {
        out.push(instr);
    }
    out
}

fn stage_name(from_args: &str) -> String {
    let tokens: Vec<&str> = from_args.split_whitespace().collect();
    for (i, t) in tokens.iter().enumerate() {
        if t.eq_ignore_ascii_case("as") {
            if let Some(alias) = tokens.get(i + 1) {
                return alias.to_string();
            }
        }
    }
    tokens.first().map(|t| t.to_string()).unwrap_or_default()
}

/// Exec-form arguments (`["sh", "-c"]`) split into their elements; shell
/// form stays a single value.
fn split_value(args: &str) -> Vec<String> {
    if args.starts_with('[') {
        if let Ok(JsonValue::Array(items)) = serde_json::from_str::<JsonValue>(args) {
            return items
                .into_iter()
                .map(|v| match v {
                    JsonValue::String(s) => s,
                    other => other.to_string(),
                })
                .collect();
        }
    }
    if args.is_empty() {
        Vec::new()
    } else {
        vec![args.to_string()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn groups_instructions_by_stage() {
        let input = "FROM alpine:3.19 AS build\nRUN apk add curl\nFROM alpine:3.19\nCOPY --from=build /out /out\n";
        let (docs, kind) = parse_dockerfile(input).unwrap();
        assert_eq!(kind, FileKind::Dockerfile);
        let command = &docs[0]["command"];
        assert_eq!(command["build"].as_array().unwrap().len(), 2);
        let copy = &command["alpine:3.19"][1];
        assert_eq!(copy["cmd"], json!("copy"));
        assert_eq!(copy["flags"], json!(["--from=build"]));
    }

    #[test]
    fn folds_line_continuations() {
        let input = "FROM debian\nRUN apt-get update && \\\n    apt-get install -y curl\n";
        let (docs, _) = parse_dockerfile(input).unwrap();
        let run = &docs[0]["command"]["debian"][1];
        assert_eq!(run["start_line"], json!(2));
        assert_eq!(run["end_line"], json!(3));
        assert_eq!(
            run["original"],
            json!("RUN apt-get update && apt-get install -y curl")
        );
    }

    #[test]
    fn parses_exec_form_values() {
        let input = "FROM scratch\nENTRYPOINT [\"/bin/app\", \"--serve\"]\n";
        let (docs, _) = parse_dockerfile(input).unwrap();
        let entry = &docs[0]["command"]["scratch"][1];
        assert_eq!(entry["value"], json!(["/bin/app", "--serve"]));
    }
}
