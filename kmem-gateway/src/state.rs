use std::sync::Arc;

use kmem_pipeline::MemoryService;

/// Shared state handed to every request handler.
pub struct AppState {
    pub service: Arc<MemoryService>,
    /// Request body limit for uploads, in bytes.
    pub max_upload_bytes: usize,
}

impl AppState {
    pub fn new(service: Arc<MemoryService>, max_upload_bytes: usize) -> Self {
        Self {
            service,
            max_upload_bytes,
        }
    }
}
