use std::sync::Arc;

use crate::config::Settings;
use crate::database::DbPool;
use crate::mcp::ToolDispatcher;
use crate::security::{IdentityResolver, ThreatDetector};

/// Application state shared across handlers
pub struct AppState {
    pub settings: Settings,
    pub chunk_pool: DbPool,
    pub identity_pool: DbPool,
    pub dispatcher: Arc<ToolDispatcher>,
    pub identity_resolver: Arc<IdentityResolver>,
    pub threat: Arc<ThreatDetector>,
}
