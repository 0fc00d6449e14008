//! Shared cancellation token threaded through every pipeline stage.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("scan cancelled")]
pub struct Cancelled;

#[derive(Debug, Clone, Default)]
/// Cooperative cancellation context for one scan. Cloning shares the flag;
/// in-flight work stops at its next suspension point once `cancel` is
/// called.
///
/// # Example
/// ```
/// use model::ScanContext;
/// let ctx = ScanContext::new();
/// assert!(ctx.ensure_active().is_ok());
/// ctx.cancel();
/// assert!(ctx.ensure_active().is_err());
/// ```
pub struct ScanContext {
    cancelled: Arc<AtomicBool>,
}

impl ScanContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Checked at suspension points; returns `Err(Cancelled)` once the
    /// scan has been cancelled.
    pub fn ensure_active(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }
}
