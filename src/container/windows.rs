//! # Windows Backend (stub)
//!
//! The Windows container path (HCI / app containers) is not part of this
//! implementation. The backend is selectable so policy structures carrying
//! Windows extensions deserialize and report cleanly, but every operation
//! returns `unsupported`.

use crate::container::{ContainerBackend, ContainerConfig, Supervisor};
use crate::error::{Error, Result};
use crate::layer::{LayerComposer, LayerContext};
use async_trait::async_trait;
use std::sync::Arc;

/// Stub backend reporting `unsupported` for all operations.
pub struct WindowsBackend {
    _private: (),
}

impl WindowsBackend {
    pub fn new() -> Self {
        Self { _private: () }
    }
}

impl Default for WindowsBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerBackend for WindowsBackend {
    fn name(&self) -> &str {
        "windows"
    }

    fn is_available(&self) -> bool {
        false
    }

    async fn launch(
        &self,
        _config: &ContainerConfig,
        _ctx: &LayerContext,
        _composer: &LayerComposer,
    ) -> Result<Arc<dyn Supervisor>> {
        Err(Error::Internal(
            "unsupported: the Windows container backend is a stub".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stub_reports_unavailable() {
        let backend = WindowsBackend::new();
        assert!(!backend.is_available());
        assert_eq!(backend.name(), "windows");
    }
}
