use crate::mcp::protocol::{JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION};
use crate::mcp::{tools, ClientMeta};
use crate::security::identity::client_ip;
use crate::state::AppState;
use crate::utils::error::{RPC_INVALID_REQUEST, RPC_METHOD_NOT_FOUND};
use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

/// POST / JSON-RPC MCP handler.
///
/// RPC-level outcomes (including logical errors) are served with HTTP 200;
/// only a threat-detector block answers at the transport level with 429.
pub async fn jsonrpc_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let ip = client_ip(&headers, Some(addr.ip()));
    let user_agent = headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let url = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let verdict = state.threat.evaluate(&ip, "POST", url, &user_agent);
    if verdict.blocked {
        return (StatusCode::TOO_MANY_REQUESTS, "Too Many Requests").into_response();
    }

    let request: JsonRpcRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => {
            let response = JsonRpcResponse::error(
                None,
                RPC_INVALID_REQUEST,
                format!("Invalid JSON-RPC request body: {}", e),
            );
            return Json(response).into_response();
        }
    };

    debug!(method = %request.method, ip = %ip, "Handling MCP request");

    let client = ClientMeta {
        ip,
        user_agent,
        authorization: headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string()),
    };

    let response = handle_request(&state, &request, &client).await;
    Json(response).into_response()
}

async fn handle_request(
    state: &AppState,
    request: &JsonRpcRequest,
    client: &ClientMeta,
) -> JsonRpcResponse {
    match request.method.as_str() {
        "initialize" => JsonRpcResponse::success(
            request.id.clone(),
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {
                    "tools": {}
                },
                "serverInfo": {
                    "name": "rag-mcp-server",
                    "version": env!("CARGO_PKG_VERSION")
                }
            }),
        ),
        "notifications/initialized" => JsonRpcResponse::success(request.id.clone(), json!({})),
        "ping" => JsonRpcResponse::success(request.id.clone(), json!({})),
        "tools/list" => JsonRpcResponse::success(
            request.id.clone(),
            json!({ "tools": tools::list_tools() }),
        ),
        "tools/call" => {
            state
                .dispatcher
                .handle_tool_call(request.id.clone(), &request.params, client)
                .await
        }
        other => JsonRpcResponse::error(
            request.id.clone(),
            RPC_METHOD_NOT_FOUND,
            format!("Method not found: {}", other),
        ),
    }
}
