//! Synchronous byte-stream contract.
//!
//! Demuxers read through [`IoReader`], muxers write through [`IoWriter`].
//! These are the only places a format call can block.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub mod reader;
pub mod writer;

pub use reader::IoReader;
pub use writer::IoWriter;

/// Cancellation flag shared between a reader and whoever may close it.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
