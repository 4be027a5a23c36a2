pub mod chunk_repository;
pub mod identity_repository;
pub mod models;
pub mod pool;

pub use chunk_repository::{ChunkRepository, ChunkStore};
pub use identity_repository::{IdentityRepository, IdentityStore, UserRecord};
pub use models::{ChunkHit, PageDocument, ToolKind, UsageEvent};
pub use pool::DbPool;
