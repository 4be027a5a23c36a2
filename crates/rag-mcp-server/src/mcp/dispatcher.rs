use crate::config::LinksConfig;
use crate::database::{ChunkStore, ToolKind, UsageEvent};
use crate::logging::UsageSink;
use crate::mcp::protocol::JsonRpcResponse;
use crate::mcp::render;
use crate::security::identity::{Identity, IdentityResolver};
use crate::security::rate_limit::{RateDecision, RateLimiter};
use crate::services::query_cleaner::clean_temporal_tokens;
use crate::services::SearchEngine;
use crate::utils::error::{ServiceError, RPC_INVALID_PARAMS, RPC_RATE_LIMIT_EXCEEDED};
use crate::utils::url::normalize_url;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

const DEFAULT_RESULT_COUNT: usize = 4;
const MAX_RESULT_COUNT: usize = 10;

/// Request-scoped client facts gathered by the transport.
#[derive(Debug, Clone)]
pub struct ClientMeta {
    pub ip: String,
    pub user_agent: String,
    pub authorization: Option<String>,
}

/// Validates tool arguments, runs the governance chain, invokes retrieval,
/// renders the response, and accounts for usage.
pub struct ToolDispatcher {
    identity_resolver: Arc<IdentityResolver>,
    rate_limiter: Arc<RateLimiter>,
    engine: Arc<SearchEngine>,
    chunks: Arc<dyn ChunkStore>,
    usage: Arc<dyn UsageSink>,
    links: LinksConfig,
}

impl ToolDispatcher {
    pub fn new(
        identity_resolver: Arc<IdentityResolver>,
        rate_limiter: Arc<RateLimiter>,
        engine: Arc<SearchEngine>,
        chunks: Arc<dyn ChunkStore>,
        usage: Arc<dyn UsageSink>,
        links: LinksConfig,
    ) -> Self {
        Self {
            identity_resolver,
            rate_limiter,
            engine,
            chunks,
            usage,
            links,
        }
    }

    /// Handle a `tools/call` request.
    pub async fn handle_tool_call(
        &self,
        id: Option<Value>,
        params: &Value,
        client: &ClientMeta,
    ) -> JsonRpcResponse {
        let tool_name = params.get("name").and_then(|v| v.as_str()).unwrap_or("");
        let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

        let kind = match tool_name {
            "search" => ToolKind::Search,
            "fetch" => ToolKind::Fetch,
            other => {
                return JsonRpcResponse::error(
                    id,
                    RPC_INVALID_PARAMS,
                    format!("Unknown tool: {}", other),
                );
            }
        };

        let started = Instant::now();
        let identity = self
            .identity_resolver
            .resolve(client.authorization.as_deref(), &client.ip)
            .await;

        if let RateDecision::Denied(denial) = self.rate_limiter.check(&identity).await {
            let message =
                render::render_rate_limit_message(&denial, &identity, &self.links, Utc::now());

            self.log_event(kind, &identity, client, payload_of(kind, &arguments), 0, started, 429, Some("RATE_LIMIT_EXCEEDED"));

            return JsonRpcResponse::error_with_data(
                id,
                RPC_RATE_LIMIT_EXCEEDED,
                message,
                json!({
                    "limitType": denial.limit_type.as_str(),
                    "plan": denial.plan,
                    "weeklyLimit": denial.weekly_limit,
                    "minuteLimit": denial.minute_limit,
                    "weeklyUsed": denial.weekly_used,
                    "minuteUsed": denial.minute_used,
                    "resetAt": denial.reset_at.to_rfc3339(),
                }),
            );
        }

        match kind {
            ToolKind::Search => self.handle_search(id, &arguments, &identity, client, started).await,
            ToolKind::Fetch => self.handle_fetch(id, &arguments, &identity, client, started).await,
        }
    }

    async fn handle_search(
        &self,
        id: Option<Value>,
        arguments: &Value,
        identity: &Identity,
        client: &ClientMeta,
        started: Instant,
    ) -> JsonRpcResponse {
        // Bad input returns without logging or provider calls.
        let query = match arguments.get("query").and_then(|v| v.as_str()) {
            Some(q) if !q.trim().is_empty() => q.trim().to_string(),
            _ => {
                return JsonRpcResponse::error(
                    id,
                    RPC_INVALID_PARAMS,
                    "Parameter 'query' must be a non-empty string".to_string(),
                );
            }
        };

        let result_count = match arguments.get("result_count") {
            None | Some(Value::Null) => DEFAULT_RESULT_COUNT,
            Some(value) => value
                .as_i64()
                .map(|n| n.clamp(1, MAX_RESULT_COUNT as i64) as usize)
                .unwrap_or(DEFAULT_RESULT_COUNT),
        };

        let cleaned = clean_temporal_tokens(&query);
        if cleaned != query {
            info!(original = %query, cleaned = %cleaned, "Stripped temporal tokens from query");
        }

        match self.engine.search(&cleaned, result_count).await {
            Ok(outcome) => {
                let text = render::render_search_response(
                    &outcome,
                    identity.is_anonymous(),
                    &self.links.subscription_url,
                );

                self.log_event(
                    ToolKind::Search,
                    identity,
                    client,
                    query,
                    outcome.results.len() as i32,
                    started,
                    200,
                    None,
                );

                JsonRpcResponse::tool_text(id, text)
            }
            Err(e @ ServiceError::InvalidParams(_)) => {
                JsonRpcResponse::error(id, e.rpc_code(), e.public_message())
            }
            Err(e) => {
                error!("Search tool failed: {}", e);
                self.log_event(
                    ToolKind::Search,
                    identity,
                    client,
                    query,
                    0,
                    started,
                    e.status_code(),
                    Some(e.error_code()),
                );
                JsonRpcResponse::error(id, e.rpc_code(), e.public_message())
            }
        }
    }

    async fn handle_fetch(
        &self,
        id: Option<Value>,
        arguments: &Value,
        identity: &Identity,
        client: &ClientMeta,
        started: Instant,
    ) -> JsonRpcResponse {
        let raw_url = match arguments.get("url").and_then(|v| v.as_str()) {
            Some(u) => u,
            None => {
                return JsonRpcResponse::error(
                    id,
                    RPC_INVALID_PARAMS,
                    "Parameter 'url' must be a string".to_string(),
                );
            }
        };

        let url = match normalize_url(raw_url) {
            Ok(u) => u,
            Err(e) => return JsonRpcResponse::error(id, e.rpc_code(), e.public_message()),
        };

        match self.chunks.get_page_by_url(&url).await {
            Ok(Some(document)) => {
                let text = render::render_fetch_response(
                    &document,
                    identity.is_anonymous(),
                    &self.links.subscription_url,
                );

                self.log_event(ToolKind::Fetch, identity, client, url, 1, started, 200, None);

                JsonRpcResponse::tool_text(id, text)
            }
            Ok(None) => {
                let e = ServiceError::NotFound(format!("Document not found: {}", url));
                self.log_event(
                    ToolKind::Fetch,
                    identity,
                    client,
                    url,
                    0,
                    started,
                    e.status_code(),
                    Some(e.error_code()),
                );
                JsonRpcResponse::error_with_data(
                    id,
                    e.rpc_code(),
                    e.public_message(),
                    json!({ "status": 404 }),
                )
            }
            Err(err) => {
                warn!("Page lookup failed for {}: {}", url, err);
                let e = ServiceError::StoreError(err.to_string());
                self.log_event(
                    ToolKind::Fetch,
                    identity,
                    client,
                    url,
                    0,
                    started,
                    e.status_code(),
                    Some(e.error_code()),
                );
                JsonRpcResponse::error(id, e.rpc_code(), e.public_message())
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn log_event(
        &self,
        kind: ToolKind,
        identity: &Identity,
        client: &ClientMeta,
        payload: String,
        result_count: i32,
        started: Instant,
        status: i16,
        error_code: Option<&str>,
    ) {
        let mut builder = UsageEvent::builder(kind, identity.user_id.clone(), client.ip.clone())
            .token_prefix(identity.token_prefix.clone())
            .payload(payload)
            .result_count(result_count)
            .response_time(started.elapsed().as_millis() as i32)
            .status(status);
        if let Some(code) = error_code {
            builder = builder.error_code(code);
        }

        self.usage.log(builder.build());
    }
}

fn payload_of(kind: ToolKind, arguments: &Value) -> String {
    let key = match kind {
        ToolKind::Search => "query",
        ToolKind::Fetch => "url",
    };
    arguments
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}
