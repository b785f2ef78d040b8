//! Run-scoped state shared by every suite of one invocation

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// Flags that live for exactly one top-level invocation.
///
/// Created once by the caller and passed by `Arc` to the strategies that need
/// it. Nothing here is persisted; a new invocation starts from a fresh
/// context.
#[derive(Debug)]
pub struct RunContext {
    logs_root: PathBuf,
    images_built: AtomicBool,
    compose_used: AtomicBool,
}

impl RunContext {
    /// Create a context writing logs under `logs_root`
    pub fn new(logs_root: impl Into<PathBuf>) -> Self {
        Self {
            logs_root: logs_root.into(),
            images_built: AtomicBool::new(false),
            compose_used: AtomicBool::new(false),
        }
    }

    /// Root directory of the per-service log tree
    pub fn logs_root(&self) -> &Path {
        &self.logs_root
    }

    /// Claim the image build for this run.
    ///
    /// Returns `true` only for the first caller.
    pub fn claim_image_build(&self) -> bool {
        !self.images_built.swap(true, Ordering::SeqCst)
    }

    /// Record that a compose project was brought up and needs teardown
    pub fn mark_compose_used(&self) {
        self.compose_used.store(true, Ordering::SeqCst);
    }

    pub fn compose_used(&self) -> bool {
        self.compose_used.load(Ordering::SeqCst)
    }

    /// Clear every flag
    pub fn reset(&self) {
        self.images_built.store(false, Ordering::SeqCst);
        self.compose_used.store(false, Ordering::SeqCst);
    }
}
