//! Server state management.

use std::sync::Arc;

use waymark_core::ElementService;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    service: Arc<ElementService>,
}

impl AppState {
    /// Create state around an opened service.
    pub fn new(service: ElementService) -> Self {
        Self {
            service: Arc::new(service),
        }
    }

    pub fn service(&self) -> &ElementService {
        &self.service
    }
}
