//! Resolver for file kinds that need pre-processing before parsing.
//! Currently that means Helm charts: the chart is rendered into concrete
//! manifests carrying injected split markers so findings can be mapped
//! back to the original templates.

use anyhow::{bail, Result};
use model::{FileKind, IdInfo};
use std::path::{Path, PathBuf};

pub mod helm;

/// Marker comment prefix injected into every rendered sub-document. This
/// is a wire-level contract with the line detector; changing it breaks
/// both components and their fixtures.
pub const SPLIT_ID_PREFIX: &str = "# KICS_HELM_ID_";

#[derive(Debug, Clone, PartialEq)]
/// One rendered sub-document together with its back-references to the
/// template it came from.
pub struct RenderedFile {
    /// Original template path on disk, not the rendered output.
    pub file_name: PathBuf,
    /// Full marker line, e.g. `# KICS_HELM_ID_0:`.
    pub split_id: String,
    /// Rendered manifest text.
    pub content: String,
    /// Template text with the marker injected, otherwise untouched.
    pub original_data: String,
    /// Line map inverting the marker injection, keyed by split number.
    pub id_info: IdInfo,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderedFiles {
    pub files: Vec<RenderedFile>,
}

#[derive(Debug, Clone, Copy, Default)]
/// Dispatches resolvable artifacts to the renderer for their kind.
pub struct Resolver;

impl Resolver {
    pub fn new() -> Self {
        Self
    }

    /// Kinds this resolver can render.
    pub fn supported_kinds(&self) -> &'static [FileKind] {
        &[FileKind::Helm]
    }

    /// Classifies a path routed to the resolve sink. Directories holding a
    /// `Chart.yaml` are Helm charts; anything else is left alone.
    pub fn kind_of(&self, path: &Path) -> FileKind {
        if path.is_dir() && path.join("Chart.yaml").is_file() {
            FileKind::Helm
        } else {
            FileKind::Common
        }
    }

    /// Renders `path` according to `kind`. Rendering is deterministic: the
    /// same tree on disk produces the same files with the same split ids
    /// in the same order.
    pub fn resolve(&self, path: &Path, kind: FileKind) -> Result<RenderedFiles> {
        match kind {
            FileKind::Helm => helm::resolve(path),
            other => bail!("kind {other} is not resolvable"),
        }
    }
}
