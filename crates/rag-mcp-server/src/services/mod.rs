pub mod embedding;
pub mod key_pool;
pub mod query_cleaner;
pub mod rerank;
pub mod search_engine;

pub use embedding::{Embedder, EmbeddingClient};
pub use key_pool::KeyPool;
pub use rerank::{Reranker, RerankClient};
pub use search_engine::SearchEngine;
