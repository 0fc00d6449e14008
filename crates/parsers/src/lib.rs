//! Converters of IaC source files into the canonical document model
//! used by the policy engine.

use anyhow::{bail, Result};
use model::{Document, FileKind};
use std::path::Path;
use tracing::debug;

pub mod formats;
pub use formats::*;

/// Determines the supported format from the file name/extension.
///
/// # Example
/// ```
/// use parsers::detect_format;
/// assert_eq!(detect_format(std::path::Path::new("Dockerfile")), Some("dockerfile"));
/// assert_eq!(detect_format(std::path::Path::new("main.tf")), Some("terraform"));
/// ```
pub fn detect_format(path: &Path) -> Option<&'static str> {
    let name = path.file_name()?.to_string_lossy().to_lowercase();
    if name == "dockerfile" {
        return Some("dockerfile");
    }
    let ext = path.extension().map(|e| e.to_string_lossy().to_lowercase());
    match ext.as_deref() {
        Some("yaml") | Some("yml") => Some("yaml"),
        Some("json") => Some("json"),
        Some("tf") => Some("terraform"),
        Some("dockerfile") => Some("dockerfile"),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, Default)]
/// Dispatches raw file bytes to the format backend selected by extension
/// and name, returning the parsed documents plus the detected kind.
pub struct Parser;

impl Parser {
    pub fn new() -> Self {
        Self
    }

    /// Extensions routed to a backend. `Dockerfile` without extension is
    /// matched by name, see [`Parser::supports`].
    pub fn supported_extensions(&self) -> &'static [&'static str] {
        &["tf", "yaml", "yml", "json", "dockerfile"]
    }

    pub fn supports(&self, path: &Path) -> bool {
        detect_format(path).is_some()
    }

    /// Parses `content` into zero or more canonical documents. A single
    /// file may yield several documents (YAML streams). Unparseable input
    /// is an error; the caller excludes the file from inspection.
    pub fn parse(&self, file_name: &Path, content: &str) -> Result<(Vec<Document>, FileKind)> {
        let Some(format) = detect_format(file_name) else {
            bail!("unsupported file: {}", file_name.display());
        };
        debug!(file = %file_name.display(), format, "Parsing file");
        let (documents, kind) = match format {
            "yaml" => parse_yaml(content)?,
            "json" => parse_json(content)?,
            "terraform" => parse_terraform(content)?,
            "dockerfile" => parse_dockerfile(content)?,
            _ => bail!("unsupported format: {format}"),
        };
        debug!(file = %file_name.display(), %kind, documents = documents.len(), "Parsed file");
        Ok((documents, kind))
    }
}
