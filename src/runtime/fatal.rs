//! One-shot fatal error capture that cancels the run.

use crate::runtime::stage::StageError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Records the first fatal error observed anywhere in the run and cancels
/// the run token so every in-flight wait unwinds. Later triggers are ignored;
/// the first failure is the one worth reporting.
pub struct FatalErrorHandler {
    triggered: AtomicBool,
    run_token: CancellationToken,
    captured: Mutex<Option<Arc<StageError>>>,
}

impl FatalErrorHandler {
    pub fn new(run_token: CancellationToken) -> Self {
        Self {
            triggered: AtomicBool::new(false),
            run_token,
            captured: Mutex::new(None),
        }
    }

    pub fn trigger(&self, error: StageError) {
        if self.triggered.swap(true, Ordering::SeqCst) {
            tracing::debug!(error = %error, "fatal error after the first, ignored");
            return;
        }

        tracing::error!(stage = %error.stage(), error = %error, "fatal error; cancelling run");
        *self.captured.lock().unwrap() = Some(Arc::new(error));
        self.run_token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// The captured error, if a fatal condition was seen.
    pub fn error(&self) -> Option<Arc<StageError>> {
        self.captured.lock().unwrap().clone()
    }
}
