//! Filesystem source provider. Walks an input root and yields each
//! discovered artifact to the parse sink, or to the resolve sink when the
//! artifact needs rendering first (Helm chart directories).

use anyhow::{Context, Result};
use model::ScanContext;
use std::collections::{HashSet, VecDeque};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Receives `(filename, reader)` for directly parseable artifacts. The
/// reader is opened lazily and closed when the sink returns.
pub type ParseSink<'a> = dyn FnMut(&Path, &mut dyn Read) -> Result<()> + 'a;

/// Receives the path of template-like artifacts that must be rendered
/// before parsing.
pub type ResolveSink<'a> = dyn FnMut(&Path) -> Result<()> + 'a;

#[derive(Debug, Clone)]
/// Source provider rooted at one directory (or single file) on disk.
pub struct FileSystemSourceProvider {
    base: PathBuf,
}

impl FileSystemSourceProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { base: path.into() }
    }

    pub fn base_path(&self) -> &Path {
        &self.base
    }

    /// Walks the root and routes every entry. Sink failures are logged and
    /// the file skipped; errors reaching the root itself are fatal.
    /// Symlinks are not followed, so cyclic trees terminate.
    pub fn get_sources(
        &self,
        ctx: &ScanContext,
        extensions: &[&str],
        parse_sink: &mut ParseSink,
        resolve_sink: &mut ResolveSink,
    ) -> Result<()> {
        if !self.base.exists() {
            anyhow::bail!("source path not found: {}", self.base.display());
        }

        let mut pending: VecDeque<PathBuf> = VecDeque::new();
        let mut visited: HashSet<PathBuf> = HashSet::new();
        pending.push_back(self.base.clone());

        while let Some(current) = pending.pop_front() {
            ctx.ensure_active()?;
            if !visited.insert(current.clone()) {
                continue;
            }
            let metadata = match fs::symlink_metadata(&current) {
                Ok(m) => m,
                Err(e) if current == self.base => {
                    return Err(e).with_context(|| {
                        format!("failed to read source root: {}", self.base.display())
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                    debug!(path = %current.display(), "Permission denied");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let file_type = metadata.file_type();
            if file_type.is_symlink() {
                debug!(path = %current.display(), "Symlink skipped");
                continue;
            }
            if file_type.is_file() {
                if is_supported(&current, extensions) {
                    debug!(path = %current.display(), "File discovered");
                    self.feed_parse_sink(&current, parse_sink);
                }
            } else if file_type.is_dir() {
                if is_chart_dir(&current) {
                    debug!(path = %current.display(), "Chart directory discovered");
                    if let Err(e) = resolve_sink(&current) {
                        warn!(path = %current.display(), error = ?e, "Resolve sink failed, skipping");
                    }
                    continue;
                }
                let entries = match fs::read_dir(&current) {
                    Ok(e) => e,
                    Err(e) if current == self.base => {
                        return Err(e).with_context(|| {
                            format!("failed to read source root: {}", self.base.display())
                        });
                    }
                    Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                        debug!(path = %current.display(), "Permission denied");
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                };
                for entry in entries {
                    let entry = match entry {
                        Ok(e) => e,
                        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => continue,
                        Err(e) => return Err(e.into()),
                    };
                    pending.push_back(entry.path());
                }
            }
        }
        Ok(())
    }

    fn feed_parse_sink(&self, path: &Path, parse_sink: &mut ParseSink) {
        let mut file = match File::open(path) {
            Ok(f) => f,
            Err(e) => {
                warn!(path = %path.display(), error = ?e, "Failed to open file, skipping");
                return;
            }
        };
        if let Err(e) = parse_sink(path, &mut file) {
            warn!(path = %path.display(), error = ?e, "Parse sink failed, skipping");
        }
    }
}

fn is_supported(path: &Path, extensions: &[&str]) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if name == "dockerfile" {
        return true;
    }
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .is_some_and(|ext| extensions.iter().any(|s| *s == ext))
}

/// A directory holding `Chart.yaml` is a Helm chart and must be rendered,
/// not walked file by file.
fn is_chart_dir(path: &Path) -> bool {
    path.join("Chart.yaml").is_file()
}
