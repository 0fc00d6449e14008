//! Helm chart resolution: renders every template of a chart (dependencies
//! first) into concrete manifests, injecting one split marker per template
//! so the line detector can map findings back to the template source.

pub mod template;

use crate::{RenderedFile, RenderedFiles, SPLIT_ID_PREFIX};
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use template::{ChartInfo, TemplateContext};
use tracing::debug;

/// Release name `helm template` uses when none is given; rendered values
/// derived from it (fullname, labels) follow the same convention.
const RELEASE_NAME: &str = "RELEASE-NAME";

#[derive(Debug, Deserialize)]
struct ChartManifest {
    name: String,
    #[serde(default)]
    version: String,
    #[serde(default, rename = "appVersion")]
    app_version: String,
}

#[derive(Debug)]
struct Chart {
    dir: PathBuf,
    info: ChartInfo,
    values: JsonValue,
    defines: HashMap<String, String>,
    /// Template path prefix in rendered `# Source:` headers, e.g.
    /// `parent/charts/subchart`.
    source_prefix: String,
}

/// Renders the chart at `chart_dir`. Deterministic: subcharts before their
/// parent, templates in path order, split ids assigned sequentially.
/// Any template that fails to render fails the whole chart.
pub fn resolve(chart_dir: &Path) -> Result<RenderedFiles> {
    if !chart_dir.join("Chart.yaml").is_file() {
        bail!("not a Helm chart (missing Chart.yaml): {}", chart_dir.display());
    }
    let root_values = load_values(chart_dir)?;
    let mut charts = Vec::new();
    gather_charts(chart_dir, None, &root_values, &mut charts)?;

    let mut files = Vec::new();
    let mut next_id = 0usize;
    for chart in &charts {
        let templates = list_templates(&chart.dir)?;
        let ctx = TemplateContext::new(&chart.info, &chart.values, RELEASE_NAME, &chart.defines);
        for template_path in templates {
            let split_number = next_id;
            next_id += 1;
            if let Some(file) = render_template(chart, &template_path, split_number, &ctx)
                .with_context(|| format!("failed to render {}", template_path.display()))?
            {
                files.push(file);
            }
        }
    }
    debug!(chart = %chart_dir.display(), rendered = files.len(), "Chart resolved");
    Ok(RenderedFiles { files })
}

/// Collects the chart and its dependencies, dependencies first, each in
/// sorted directory order.
fn gather_charts(
    dir: &Path,
    parent_prefix: Option<&str>,
    values: &JsonValue,
    out: &mut Vec<Chart>,
) -> Result<()> {
    let manifest_path = dir.join("Chart.yaml");
    let manifest_text = fs::read_to_string(&manifest_path)
        .with_context(|| format!("failed to read {}", manifest_path.display()))?;
    let manifest: ChartManifest = serde_yaml::from_str(&manifest_text)
        .with_context(|| format!("malformed chart manifest: {}", manifest_path.display()))?;

    let source_prefix = match parent_prefix {
        Some(prefix) => format!("{prefix}/charts/{}", manifest.name),
        None => manifest.name.clone(),
    };

    let charts_dir = dir.join("charts");
    if charts_dir.is_dir() {
        let mut subdirs: Vec<PathBuf> = fs::read_dir(&charts_dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.join("Chart.yaml").is_file())
            .collect();
        subdirs.sort();
        for subdir in subdirs {
            let sub_name = subdir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let sub_values = merge_values(
                load_values(&subdir)?,
                values.get(&sub_name).cloned().unwrap_or(JsonValue::Null),
            );
            gather_charts(&subdir, Some(&source_prefix), &sub_values, out)?;
        }
    }

    out.push(Chart {
        dir: dir.to_path_buf(),
        defines: collect_chart_defines(dir)?,
        info: ChartInfo {
            name: manifest.name,
            version: manifest.version,
            app_version: manifest.app_version,
        },
        values: values.clone(),
        source_prefix,
    });
    Ok(())
}

fn load_values(chart_dir: &Path) -> Result<JsonValue> {
    let path = chart_dir.join("values.yaml");
    if !path.is_file() {
        return Ok(JsonValue::Object(Default::default()));
    }
    let text =
        fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
    if text.trim().is_empty() {
        return Ok(JsonValue::Object(Default::default()));
    }
    serde_yaml::from_str(&text).with_context(|| format!("malformed values: {}", path.display()))
}

/// Parent values for a subchart override the subchart's own defaults.
fn merge_values(base: JsonValue, over: JsonValue) -> JsonValue {
    match (base, over) {
        (JsonValue::Object(mut base_map), JsonValue::Object(over_map)) => {
            for (k, v) in over_map {
                let merged = match base_map.remove(&k) {
                    Some(existing) => merge_values(existing, v),
                    None => v,
                };
                base_map.insert(k, merged);
            }
            JsonValue::Object(base_map)
        }
        (base, JsonValue::Null) => base,
        (_, over) => over,
    }
}

fn list_templates(chart_dir: &Path) -> Result<Vec<PathBuf>> {
    let templates_dir = chart_dir.join("templates");
    if !templates_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut templates: Vec<PathBuf> = fs::read_dir(&templates_dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && is_template(p))
        .collect();
    templates.sort();
    Ok(templates)
}

fn is_template(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    if name.starts_with('_') {
        return false;
    }
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

/// Named helpers from every `_*.tpl` partial of the chart.
fn collect_chart_defines(chart_dir: &Path) -> Result<HashMap<String, String>> {
    let mut defines = HashMap::new();
    let templates_dir = chart_dir.join("templates");
    if !templates_dir.is_dir() {
        return Ok(defines);
    }
    let mut partials: Vec<PathBuf> = fs::read_dir(&templates_dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("tpl"))
        .collect();
    partials.sort();
    for partial in partials {
        let text = fs::read_to_string(&partial)
            .with_context(|| format!("failed to read {}", partial.display()))?;
        collect_defines(&text, &mut defines);
    }
    Ok(defines)
}

fn collect_defines(content: &str, defines: &mut HashMap<String, String>) {
    let mut name: Option<String> = None;
    let mut body: Vec<String> = Vec::new();
    let mut depth = 0usize;
    for line in content.lines() {
        let trimmed = line.trim();
        let action = trimmed
            .strip_prefix("{{")
            .and_then(|s| s.strip_suffix("}}"))
            .map(|s| s.trim_matches(|c: char| c == '-' || c.is_whitespace()));
        if name.is_none() {
            if let Some(action) = action {
                if let Some(rest) = action.strip_prefix("define ") {
                    name = Some(rest.trim().trim_matches('"').to_string());
                    body.clear();
                    depth = 0;
                }
            }
            continue;
        }
        if let Some(action) = action {
            if action.starts_with("if ") || action.starts_with("with ") || action.starts_with("range ")
            {
                depth += 1;
            } else if action == "end" {
                if depth == 0 {
                    let done = name.take().expect("open define");
                    defines.insert(done, body.join("\n"));
                    continue;
                }
                depth -= 1;
            }
        }
        body.push(line.to_string());
    }
}

fn render_template(
    chart: &Chart,
    template_path: &Path,
    split_number: usize,
    ctx: &TemplateContext,
) -> Result<Option<RenderedFile>> {
    let original = fs::read_to_string(template_path)
        .with_context(|| format!("failed to read {}", template_path.display()))?;
    let split_id = format!("{SPLIT_ID_PREFIX}{split_number}:");
    let (marked, marker_index) = inject_marker(&original, &split_id);

    let rendered = template::render(&marked, ctx)?;
    let is_manifest = rendered
        .iter()
        .any(|l| !l.text.trim().is_empty() && !l.text.trim_start().starts_with('#'));
    if !is_manifest {
        debug!(template = %template_path.display(), "Template rendered empty, skipped");
        return Ok(None);
    }

    let file_stem = template_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let mut content = format!("\n# Source: {}/templates/{}\n", chart.source_prefix, file_stem);
    for line in &rendered {
        content.push_str(&line.text);
        content.push('\n');
    }

    // The injected marker occupies one line of the marked template; map
    // every other marked line back to its 1-based line in the user's file.
    let mut line_map = HashMap::new();
    let total = marked.lines().count();
    for i in 0..total {
        if i == marker_index {
            continue;
        }
        let user_line = if i < marker_index { i + 1 } else { i };
        line_map.insert(i, user_line);
    }
    let mut id_info = HashMap::new();
    id_info.insert(split_number, line_map);

    Ok(Some(RenderedFile {
        file_name: template_path.to_path_buf(),
        split_id,
        content,
        original_data: marked,
        id_info,
    }))
}

/// Inserts the split marker before the first line that renders as-is,
/// keeping it inside any leading guard blocks so it only appears when the
/// template produces output.
fn inject_marker(original: &str, split_id: &str) -> (String, usize) {
    let lines: Vec<&str> = original.lines().collect();
    let index = lines
        .iter()
        .position(|l| !l.trim().starts_with("{{") && !l.trim().is_empty())
        .unwrap_or(lines.len());
    let mut out = Vec::with_capacity(lines.len() + 1);
    out.extend_from_slice(&lines[..index]);
    out.push(split_id);
    out.extend_from_slice(&lines[index..]);
    let mut text = out.join("\n");
    if original.ends_with('\n') {
        text.push('\n');
    }
    (text, index)
}
