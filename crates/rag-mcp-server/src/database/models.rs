use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

/// One retrievable chunk as returned by either search branch.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ChunkHit {
    pub id: i64,
    pub url: String,
    pub title: Option<String>,
    pub content: String,
    pub chunk_index: i32,
    pub total_chunks: i32,
    pub score: f32,
}

/// A full page assembled from its chunks in `chunk_index` order.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct PageDocument {
    pub id: i64,
    pub title: Option<String>,
    pub content: String,
}

/// Which tool produced a usage event; selects the target log table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    Search,
    Fetch,
}

impl ToolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::Fetch => "fetch",
        }
    }
}

/// Append-only usage record written after every tool invocation.
#[derive(Debug, Clone)]
pub struct UsageEvent {
    pub kind: ToolKind,
    pub user_id: String,
    pub ip: String,
    pub token_prefix: Option<String>,
    /// Query text for search events, URL for fetch events.
    pub payload: String,
    pub result_count: i32,
    pub response_time_ms: i32,
    pub status_code: i16,
    pub error_code: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl UsageEvent {
    pub fn builder(kind: ToolKind, user_id: impl Into<String>, ip: impl Into<String>) -> UsageEventBuilder {
        UsageEventBuilder::new(kind, user_id, ip)
    }
}

/// Builder pattern for UsageEvent
pub struct UsageEventBuilder {
    event: UsageEvent,
}

impl UsageEventBuilder {
    pub fn new(kind: ToolKind, user_id: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            event: UsageEvent {
                kind,
                user_id: user_id.into(),
                ip: ip.into(),
                token_prefix: None,
                payload: String::new(),
                result_count: 0,
                response_time_ms: 0,
                status_code: 200,
                error_code: None,
                created_at: Utc::now(),
            },
        }
    }

    pub fn token_prefix(mut self, prefix: Option<String>) -> Self {
        self.event.token_prefix = prefix;
        self
    }

    pub fn payload(mut self, payload: impl Into<String>) -> Self {
        self.event.payload = payload.into();
        self
    }

    pub fn result_count(mut self, count: i32) -> Self {
        self.event.result_count = count;
        self
    }

    pub fn response_time(mut self, ms: i32) -> Self {
        self.event.response_time_ms = ms;
        self
    }

    pub fn status(mut self, code: i16) -> Self {
        self.event.status_code = code;
        self
    }

    pub fn error_code(mut self, code: impl Into<String>) -> Self {
        self.event.error_code = Some(code.into());
        self
    }

    pub fn build(self) -> UsageEvent {
        self.event
    }
}
