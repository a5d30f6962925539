use std::sync::Arc;

use pgrollback_pg::registry::SessionRegistry;

/// Required state and dependencies for the http api
#[derive(Clone)]
pub struct HttpApiState {
    /// The proxy's session registry
    registry: Arc<SessionRegistry>,
}

impl HttpApiState {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }
}
