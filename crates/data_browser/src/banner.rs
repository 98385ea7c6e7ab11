use std::sync::Arc;

use errors::ErrorMetadataAnyhowExt;
use parking_lot::Mutex;

/// The single dismissible error line shown above the data grid. Canceled
/// operations never reach it.
#[derive(Clone, Default)]
pub struct ErrorBanner {
    message: Arc<Mutex<Option<String>>>,
}

impl ErrorBanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&self, e: &anyhow::Error) {
        if !e.should_surface() {
            return;
        }
        tracing::warn!("Surfacing error: {e:#}");
        *self.message.lock() = Some(e.user_facing_message());
    }

    pub fn message(&self) -> Option<String> {
        self.message.lock().clone()
    }

    pub fn dismiss(&self) {
        self.message.lock().take();
    }
}
