//! Cooperative cancellation flag shared between the task slot and byte-copy loops

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{FirmwareUpdateError, Result};

/// Cheap clonable cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create an untriggered token
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Check if cancellation was requested
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Raise [`FirmwareUpdateError::Cancelled`] when cancelled
    #[inline]
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(FirmwareUpdateError::Cancelled)
        } else {
            Ok(())
        }
    }
}
