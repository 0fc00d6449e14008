//! Scan service: drives the pipeline for one scan. Sources are
//! enumerated by the provider and routed into the parse or resolve sink;
//! every parsed document is saved to storage and kept for inspection;
//! the inspector's vulnerabilities are written back at the end.
//!
//! Per-file errors are isolated: one rotten file never poisons the scan.
//! Errors from the source walk, the inspector or storage are fatal.

use anyhow::{Context, Result};
use engine::Inspector;
use model::{FileKind, FileMetadata, FileMetadatas, ScanContext, SeveritySummary, Tracker,
    Vulnerability};
use parsers::Parser;
use provider::FileSystemSourceProvider;
use resolver::Resolver;
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::{Arc, Mutex};
use storage::Storage;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Files are read in fixed-size chunks to keep memory bounded on
/// pathological inputs.
pub const READ_CHUNK_BYTES: usize = 1024 * 1024;
/// Hard cap on a single file; larger files are skipped.
pub const MAX_FILE_SIZE_BYTES: usize = 5 * 1024 * 1024;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("file size limit exceeded")]
pub struct SizeLimitExceeded;

/// Reads the whole stream in [`READ_CHUNK_BYTES`] chunks, failing as soon
/// as the accumulated size would exceed [`MAX_FILE_SIZE_BYTES`]. Never
/// holds more than cap + one chunk in memory.
pub fn read_bounded(reader: &mut dyn Read) -> Result<String> {
    let mut content: Vec<u8> = Vec::new();
    let mut chunk = vec![0u8; READ_CHUNK_BYTES];
    loop {
        let n = reader.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        if content.len() + n > MAX_FILE_SIZE_BYTES {
            return Err(SizeLimitExceeded.into());
        }
        content.extend_from_slice(&chunk[..n]);
    }
    String::from_utf8(content).context("file content is not valid UTF-8")
}

/// Wires the provider, resolver, parser, inspector, storage and tracker
/// into one scan pipeline.
pub struct Service {
    pub source_provider: FileSystemSourceProvider,
    pub storage: Arc<dyn Storage>,
    pub parser: Parser,
    pub inspector: Inspector,
    pub tracker: Arc<dyn Tracker>,
    pub resolver: Resolver,
}

impl Service {
    /// Executes a scan over the provider's root, grouping everything it
    /// writes under `scan_id`.
    pub fn start_scan(&self, ctx: &ScanContext, scan_id: &str) -> Result<()> {
        debug!(scan_id, "service.start_scan");
        let files: Mutex<FileMetadatas> = Mutex::new(Vec::new());

        let mut parse_sink = |filename: &Path, reader: &mut dyn Read| -> Result<()> {
            self.tracker.track_file_found();
            let content = read_bounded(reader)
                .with_context(|| format!("failed to get file content: {}", filename.display()))?;
            let (documents, kind) = self
                .parser
                .parse(filename, &content)
                .context("failed to parse file content")?;
            for document in documents {
                let metadata = FileMetadata {
                    id: Uuid::new_v4().to_string(),
                    scan_id: scan_id.to_string(),
                    file_name: filename.to_path_buf(),
                    kind,
                    document,
                    original_data: content.clone(),
                    content: content.clone(),
                    helm_id: String::new(),
                    id_info: HashMap::new(),
                };
                self.save_file(ctx, metadata, &files);
            }
            Ok(())
        };

        let mut resolve_sink = |filename: &Path| -> Result<()> {
            self.tracker.track_file_found();
            let kind = self.resolver.kind_of(filename);
            if kind == FileKind::Common {
                return Ok(());
            }
            let rendered = self
                .resolver
                .resolve(filename, kind)
                .context("failed to render file content")?;
            for rfile in rendered.files {
                let (documents, _) = self
                    .parser
                    .parse(&rfile.file_name, &rfile.content)
                    .context("failed to parse rendered content")?;
                for document in documents {
                    let metadata = FileMetadata {
                        id: Uuid::new_v4().to_string(),
                        scan_id: scan_id.to_string(),
                        file_name: rfile.file_name.clone(),
                        kind,
                        document,
                        original_data: rfile.original_data.clone(),
                        content: rfile.content.clone(),
                        helm_id: rfile.split_id.clone(),
                        id_info: rfile.id_info.clone(),
                    };
                    self.save_file(ctx, metadata, &files);
                }
            }
            Ok(())
        };

        self.source_provider
            .get_sources(
                ctx,
                self.parser.supported_extensions(),
                &mut parse_sink,
                &mut resolve_sink,
            )
            .context("failed to read sources")?;

        let files = files.into_inner().unwrap_or_else(|e| e.into_inner());
        info!(scan_id, files = files.len(), "Sources enumerated");

        let vulnerabilities = self
            .inspector
            .inspect(
                ctx,
                scan_id,
                &files,
                self.source_provider.base_path(),
                self.tracker.as_ref(),
            )
            .context("failed to inspect files")?;

        self.storage
            .save_vulnerabilities(ctx, &vulnerabilities)
            .context("failed to save vulnerabilities")
    }

    pub fn get_vulnerabilities(
        &self,
        ctx: &ScanContext,
        scan_id: &str,
    ) -> Result<Vec<Vulnerability>> {
        self.storage.get_vulnerabilities(ctx, scan_id)
    }

    pub fn get_scan_summary(
        &self,
        ctx: &ScanContext,
        scan_ids: &[String],
    ) -> Result<Vec<SeveritySummary>> {
        self.storage.get_scan_summary(ctx, scan_ids)
    }

    fn save_file(&self, ctx: &ScanContext, metadata: FileMetadata, files: &Mutex<FileMetadatas>) {
        match self.storage.save_file(ctx, &metadata) {
            Ok(()) => {
                files
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(metadata);
                self.tracker.track_file_parse();
            }
            Err(e) => {
                warn!(file = %metadata.file_name.display(), error = ?e, "Failed to save file metadata");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    struct ChunkedReader {
        remaining: usize,
    }

    impl Read for ChunkedReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.remaining == 0 {
                return Ok(0);
            }
            let n = buf.len().min(self.remaining);
            buf[..n].fill(b'a');
            self.remaining -= n;
            Ok(n)
        }
    }

    #[test]
    fn reads_small_files_whole() {
        let mut reader = Cursor::new(b"key: value\n".to_vec());
        assert_eq!(read_bounded(&mut reader).unwrap(), "key: value\n");
    }

    #[test]
    fn oversized_files_are_rejected() {
        let mut reader = ChunkedReader {
            remaining: MAX_FILE_SIZE_BYTES + 1,
        };
        let err = read_bounded(&mut reader).unwrap_err();
        assert!(err.downcast_ref::<SizeLimitExceeded>().is_some());
    }

    #[test]
    fn exactly_at_the_cap_is_accepted() {
        let mut reader = ChunkedReader {
            remaining: MAX_FILE_SIZE_BYTES,
        };
        assert_eq!(read_bounded(&mut reader).unwrap().len(), MAX_FILE_SIZE_BYTES);
    }

    #[test]
    fn invalid_utf8_is_an_error() {
        let mut reader = Cursor::new(vec![0xff, 0xfe, 0x00]);
        assert!(read_bounded(&mut reader).is_err());
    }
}
