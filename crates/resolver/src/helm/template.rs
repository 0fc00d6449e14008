//! Line-oriented renderer for the Helm template dialect subset used by
//! charts this resolver supports. Rendering tracks, for every emitted
//! line, the template line it came from; the chart resolver turns that
//! provenance into the split line maps.

use anyhow::{anyhow, bail, Result};
use serde_json::{json, Value as JsonValue};
use std::cell::Cell;
use std::collections::HashMap;

const MAX_INCLUDE_DEPTH: usize = 16;

#[derive(Debug, Clone, Default)]
pub struct ChartInfo {
    pub name: String,
    pub version: String,
    pub app_version: String,
}

#[derive(Debug)]
pub struct TemplateContext<'a> {
    pub chart: &'a ChartInfo,
    pub values: &'a JsonValue,
    pub release_name: &'a str,
    pub defines: &'a HashMap<String, String>,
    depth: Cell<usize>,
}

impl<'a> TemplateContext<'a> {
    pub fn new(
        chart: &'a ChartInfo,
        values: &'a JsonValue,
        release_name: &'a str,
        defines: &'a HashMap<String, String>,
    ) -> Self {
        Self {
            chart,
            values,
            release_name,
            defines,
            depth: Cell::new(0),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedLine {
    pub text: String,
    /// 0-based line in the rendered template source.
    pub source_line: usize,
}

enum Block {
    If { taken: bool, active: bool },
    With { active: bool },
    Define,
}

fn blocks_active(blocks: &[Block]) -> bool {
    blocks.iter().all(|b| match b {
        Block::If { active, .. } => *active,
        Block::With { active } => *active,
        Block::Define => false,
    })
}

/// Renders one template. An action outside the supported subset is an
/// error; the chart resolver treats that as fatal for the whole chart.
pub fn render(source: &str, ctx: &TemplateContext) -> Result<Vec<RenderedLine>> {
    let mut out = Vec::new();
    let mut blocks: Vec<Block> = Vec::new();
    let mut dots: Vec<JsonValue> = Vec::new();

    for (idx, raw) in source.lines().enumerate() {
        let trimmed = raw.trim();
        if let Some(action) = standalone_action(trimmed) {
            let keyword = action.split_whitespace().next().unwrap_or_default();
            match keyword {
                "if" => {
                    let parent_active = blocks_active(&blocks);
                    let cond = parent_active
                        && eval_condition(action["if".len()..].trim(), ctx, current_dot(&dots))?;
                    blocks.push(Block::If {
                        taken: cond,
                        active: cond,
                    });
                    continue;
                }
                "else" => {
                    match blocks.last_mut() {
                        Some(Block::If { taken, active }) => {
                            if *taken {
                                *active = false;
                            } else {
                                let rest = action["else".len()..].trim();
                                let cond = if let Some(sub) = rest.strip_prefix("if ") {
                                    eval_condition(sub.trim(), ctx, current_dot(&dots))?
                                } else {
                                    true
                                };
                                *active = cond;
                                *taken = cond;
                            }
                        }
                        _ => bail!("line {}: 'else' outside of 'if'", idx + 1),
                    }
                    continue;
                }
                "with" => {
                    let parent_active = blocks_active(&blocks);
                    let value = if parent_active {
                        eval_expr(action["with".len()..].trim(), ctx, current_dot(&dots))?
                    } else {
                        JsonValue::Null
                    };
                    let active = parent_active && is_truthy(&value);
                    if active {
                        dots.push(value);
                    }
                    blocks.push(Block::With { active });
                    continue;
                }
                "define" => {
                    blocks.push(Block::Define);
                    continue;
                }
                "end" => {
                    match blocks.pop() {
                        Some(Block::With { active }) => {
                            if active {
                                dots.pop();
                            }
                        }
                        Some(_) => {}
                        None => bail!("line {}: 'end' without an open block", idx + 1),
                    }
                    continue;
                }
                "range" | "template" | "block" => {
                    bail!("line {}: unsupported template action '{keyword}'", idx + 1)
                }
                _ => {}
            }
            if !blocks_active(&blocks) {
                continue;
            }
            if action.starts_with("/*") {
                continue;
            }
            // Expression standing alone on its own line; a multi-line
            // result (nindent, toYaml) expands into several rendered
            // lines all attributed to this template line.
            let value = eval_expr(action, ctx, current_dot(&dots))
                .map_err(|e| anyhow!("line {}: {e}", idx + 1))?;
            let text = value_to_string(&value);
            // nindent output carries its own indentation, marked by the
            // leading newline; anything else keeps the line's indent
            let (body, pre_indented) = match text.strip_prefix('\n') {
                Some(rest) => (rest.to_string(), true),
                None => (text, false),
            };
            if body.trim().is_empty() {
                continue;
            }
            let leading = &raw[..raw.len() - raw.trim_start().len()];
            for line in body.lines() {
                let text = if pre_indented || line.is_empty() {
                    line.to_string()
                } else {
                    format!("{leading}{line}")
                };
                out.push(RenderedLine {
                    text,
                    source_line: idx,
                });
            }
            continue;
        }

        if !blocks_active(&blocks) {
            continue;
        }
        if !raw.contains("{{") {
            out.push(RenderedLine {
                text: raw.to_string(),
                source_line: idx,
            });
            continue;
        }
        let substituted = substitute_inline(raw, ctx, current_dot(&dots))
            .map_err(|e| anyhow!("line {}: {e}", idx + 1))?;
        for line in substituted.lines() {
            out.push(RenderedLine {
                text: line.to_string(),
                source_line: idx,
            });
        }
    }
    Ok(out)
}

/// Renders a template to plain text, for `include` bodies where line
/// provenance does not matter.
pub fn render_to_string(source: &str, ctx: &TemplateContext) -> Result<String> {
    let lines = render(source, ctx)?;
    Ok(lines
        .into_iter()
        .map(|l| l.text)
        .collect::<Vec<_>>()
        .join("\n"))
}

fn current_dot<'a>(dots: &'a [JsonValue]) -> Option<&'a JsonValue> {
    dots.last()
}

/// A line holding exactly one `{{ .. }}` action and nothing else.
fn standalone_action(trimmed: &str) -> Option<&str> {
    if !trimmed.starts_with("{{") || !trimmed.ends_with("}}") || trimmed.len() < 4 {
        return None;
    }
    let inner = &trimmed[2..trimmed.len() - 2];
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim_matches(|c: char| c == '-' || c.is_whitespace()))
}

fn substitute_inline(raw: &str, ctx: &TemplateContext, dot: Option<&JsonValue>) -> Result<String> {
    let mut out = String::new();
    let mut rest = raw;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            bail!("unterminated template expression");
        };
        let inner = after[..end].trim_matches(|c: char| c == '-' || c.is_whitespace());
        if !inner.starts_with("/*") {
            let value = eval_expr(inner, ctx, dot)?;
            out.push_str(&value_to_string(&value));
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

fn eval_condition(expr: &str, ctx: &TemplateContext, dot: Option<&JsonValue>) -> Result<bool> {
    if let Some(rest) = expr.strip_prefix("not ") {
        return Ok(!eval_condition(rest.trim(), ctx, dot)?);
    }
    Ok(is_truthy(&eval_expr(expr, ctx, dot)?))
}

fn eval_expr(expr: &str, ctx: &TemplateContext, dot: Option<&JsonValue>) -> Result<JsonValue> {
    let segments = split_pipeline(expr);
    let (first, pipes) = segments
        .split_first()
        .ok_or_else(|| anyhow!("empty template expression"))?;
    let mut value = eval_operand(first.trim(), ctx, dot)?;
    for func in pipes {
        value = apply_function(func.trim(), value, ctx, dot)?;
    }
    Ok(value)
}

fn eval_operand(segment: &str, ctx: &TemplateContext, dot: Option<&JsonValue>) -> Result<JsonValue> {
    let segment = strip_parens(segment);
    let tokens = tokenize(segment);
    let Some(first) = tokens.first() else {
        return Ok(JsonValue::Null);
    };
    match first.as_str() {
        "include" => {
            let name = tokens
                .get(1)
                .map(|t| unquote(t))
                .ok_or_else(|| anyhow!("'include' needs a template name"))?;
            Ok(JsonValue::String(render_include(&name, ctx)?))
        }
        "default" if tokens.len() >= 3 => {
            let fallback = eval_token(&tokens[1], ctx, dot)?;
            let given = eval_token(&tokens[2], ctx, dot)?;
            Ok(if is_truthy(&given) { given } else { fallback })
        }
        "printf" if tokens.len() >= 2 => {
            let mut text = unquote(&tokens[1]);
            for arg in &tokens[2..] {
                let rendered = value_to_string(&eval_token(arg, ctx, dot)?);
                if let Some(pos) = text.find("%s").or_else(|| text.find("%d")) {
                    text.replace_range(pos..pos + 2, &rendered);
                }
            }
            Ok(JsonValue::String(text))
        }
        "not" if tokens.len() >= 2 => {
            let v = eval_token(&tokens[1], ctx, dot)?;
            Ok(JsonValue::Bool(!is_truthy(&v)))
        }
        _ if tokens.len() == 1 => eval_token(first, ctx, dot),
        other => bail!("unsupported template expression '{other}'"),
    }
}

fn eval_token(token: &str, ctx: &TemplateContext, dot: Option<&JsonValue>) -> Result<JsonValue> {
    let token = strip_parens(token);
    if token.starts_with('"') {
        return Ok(JsonValue::String(unquote(token)));
    }
    if token == "true" {
        return Ok(JsonValue::Bool(true));
    }
    if token == "false" {
        return Ok(JsonValue::Bool(false));
    }
    if token.starts_with('.') || token.starts_with('$') {
        return Ok(lookup(token.trim_start_matches('$'), ctx, dot));
    }
    if let Ok(i) = token.parse::<i64>() {
        return Ok(JsonValue::from(i));
    }
    if let Ok(f) = token.parse::<f64>() {
        return Ok(serde_json::Number::from_f64(f)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null));
    }
    bail!("unsupported template operand '{token}'")
}

fn apply_function(
    segment: &str,
    value: JsonValue,
    ctx: &TemplateContext,
    dot: Option<&JsonValue>,
) -> Result<JsonValue> {
    let tokens = tokenize(segment);
    let Some(name) = tokens.first() else {
        return Ok(value);
    };
    let text = value_to_string(&value);
    let out = match name.as_str() {
        "nindent" => {
            let n: usize = arg_number(&tokens, 1)?;
            JsonValue::String(format!("\n{}", indent_lines(&text, n)))
        }
        "indent" => {
            let n: usize = arg_number(&tokens, 1)?;
            JsonValue::String(indent_lines(&text, n))
        }
        "quote" => JsonValue::String(format!("\"{text}\"")),
        "squote" => JsonValue::String(format!("'{text}'")),
        "toYaml" => {
            let rendered = serde_yaml::to_string(&value)?;
            JsonValue::String(rendered.trim_end().to_string())
        }
        "trunc" => {
            let n: usize = arg_number(&tokens, 1)?;
            JsonValue::String(text.chars().take(n).collect())
        }
        "trimSuffix" => {
            let suffix = unquote(tokens.get(1).map(String::as_str).unwrap_or_default());
            match text.strip_suffix(&suffix) {
                Some(stripped) => JsonValue::String(stripped.to_string()),
                None => JsonValue::String(text),
            }
        }
        "trimPrefix" => {
            let prefix = unquote(tokens.get(1).map(String::as_str).unwrap_or_default());
            match text.strip_prefix(&prefix) {
                Some(stripped) => JsonValue::String(stripped.to_string()),
                None => JsonValue::String(text),
            }
        }
        "trim" => JsonValue::String(text.trim().to_string()),
        "lower" => JsonValue::String(text.to_lowercase()),
        "upper" => JsonValue::String(text.to_uppercase()),
        "default" => {
            if is_truthy(&value) {
                value
            } else {
                eval_token(
                    tokens
                        .get(1)
                        .ok_or_else(|| anyhow!("'default' needs a fallback"))?,
                    ctx,
                    dot,
                )?
            }
        }
        other => bail!("unsupported template function '{other}'"),
    };
    Ok(out)
}

fn arg_number(tokens: &[String], idx: usize) -> Result<usize> {
    tokens
        .get(idx)
        .and_then(|t| t.parse().ok())
        .ok_or_else(|| anyhow!("'{}' needs a numeric argument", tokens[0]))
}

fn indent_lines(text: &str, n: usize) -> String {
    let pad = " ".repeat(n);
    text.lines()
        .map(|l| {
            if l.is_empty() {
                l.to_string()
            } else {
                format!("{pad}{l}")
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn lookup(path: &str, ctx: &TemplateContext, dot: Option<&JsonValue>) -> JsonValue {
    if path == "." {
        return dot.cloned().unwrap_or_else(|| root_object(ctx));
    }
    let segments: Vec<&str> = path
        .trim_start_matches('.')
        .split('.')
        .filter(|s| !s.is_empty())
        .collect();
    let (root, rest): (JsonValue, &[&str]) = match segments.first() {
        Some(&"Values") => (ctx.values.clone(), &segments[1..]),
        Some(&"Chart") => (chart_object(ctx), &segments[1..]),
        Some(&"Release") => (release_object(ctx), &segments[1..]),
        _ => match dot {
            Some(d) => (d.clone(), &segments[..]),
            None => (root_object(ctx), &segments[..]),
        },
    };
    let mut current = root;
    for seg in rest {
        current = current.get(seg).cloned().unwrap_or(JsonValue::Null);
    }
    current
}

fn root_object(ctx: &TemplateContext) -> JsonValue {
    json!({
        "Values": ctx.values,
        "Chart": chart_object(ctx),
        "Release": release_object(ctx),
    })
}

fn chart_object(ctx: &TemplateContext) -> JsonValue {
    json!({
        "Name": ctx.chart.name,
        "Version": ctx.chart.version,
        "AppVersion": ctx.chart.app_version,
    })
}

fn release_object(ctx: &TemplateContext) -> JsonValue {
    json!({
        "Name": ctx.release_name,
        "Namespace": "default",
        "Service": "Helm",
    })
}

fn render_include(name: &str, ctx: &TemplateContext) -> Result<String> {
    if ctx.depth.get() >= MAX_INCLUDE_DEPTH {
        bail!("template include depth exceeded at '{name}'");
    }
    ctx.depth.set(ctx.depth.get() + 1);
    let result = render_include_inner(name, ctx);
    ctx.depth.set(ctx.depth.get() - 1);
    result
}

fn render_include_inner(name: &str, ctx: &TemplateContext) -> Result<String> {
    if let Some(body) = ctx.defines.get(name) {
        match render_to_string(body, ctx) {
            Ok(text) => return Ok(text.trim().to_string()),
            // A chart-defined helper using syntax outside the supported
            // subset still renders when a standard helper exists for it.
            Err(e) => {
                if let Some(builtin) = builtin_helper(name, ctx) {
                    return Ok(builtin);
                }
                return Err(e);
            }
        }
    }
    builtin_helper(name, ctx).ok_or_else(|| anyhow!("undefined template '{name}'"))
}

/// The helpers `helm create` scaffolds, synthesized for charts that rely
/// on them without carrying a renderable `_helpers.tpl`.
fn builtin_helper(name: &str, ctx: &TemplateContext) -> Option<String> {
    let helper = name.rsplit('.').next()?;
    let chart_name = ctx
        .values
        .get("nameOverride")
        .and_then(JsonValue::as_str)
        .filter(|s| !s.is_empty())
        .unwrap_or(&ctx.chart.name)
        .to_string();
    let fullname = match ctx
        .values
        .get("fullnameOverride")
        .and_then(JsonValue::as_str)
        .filter(|s| !s.is_empty())
    {
        Some(over) => over.to_string(),
        None if ctx.release_name.contains(&chart_name) => ctx.release_name.to_string(),
        None => format!("{}-{}", ctx.release_name, chart_name),
    };
    match helper {
        "name" => Some(chart_name),
        "fullname" => Some(fullname),
        "chart" => Some(format!("{}-{}", ctx.chart.name, ctx.chart.version)),
        "labels" => Some(format!(
            "helm.sh/chart: {}-{}\napp.kubernetes.io/name: {}\napp.kubernetes.io/instance: {}\napp.kubernetes.io/version: \"{}\"\napp.kubernetes.io/managed-by: Helm",
            ctx.chart.name, ctx.chart.version, chart_name, ctx.release_name, ctx.chart.app_version,
        )),
        "selectorLabels" => Some(format!(
            "app.kubernetes.io/name: {}\napp.kubernetes.io/instance: {}",
            chart_name, ctx.release_name,
        )),
        "serviceAccountName" => {
            let sa = ctx.values.get("serviceAccount");
            let create = sa
                .and_then(|s| s.get("create"))
                .map(is_truthy)
                .unwrap_or(false);
            let explicit = sa
                .and_then(|s| s.get("name"))
                .and_then(JsonValue::as_str)
                .filter(|s| !s.is_empty());
            Some(match (create, explicit) {
                (_, Some(name)) => name.to_string(),
                (true, None) => fullname,
                (false, None) => "default".to_string(),
            })
        }
        _ => None,
    }
}

fn is_truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        JsonValue::String(s) => !s.is_empty(),
        JsonValue::Array(a) => !a.is_empty(),
        JsonValue::Object(o) => !o.is_empty(),
    }
}

fn value_to_string(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::Bool(b) => b.to_string(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::String(s) => s.clone(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}

fn split_pipeline(expr: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for c in expr.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            '|' if !in_quotes => segments.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    segments.push(current);
    segments
}

fn tokenize(s: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for c in s.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

fn strip_parens(s: &str) -> &str {
    let s = s.trim();
    if s.starts_with('(') && s.ends_with(')') {
        s[1..s.len() - 1].trim()
    } else {
        s
    }
}

fn unquote(s: &str) -> String {
    s.trim().trim_matches('"').to_string()
}
