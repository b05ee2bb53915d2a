//! JSON-RPC method handlers.

use serde_json::{Value, json};

use aion_cron::CronError;
use aion_cron::bridge::BridgeError;
use aion_types::Conversation;

use crate::GatewayState;
use crate::jsonrpc::{INTERNAL_ERROR, INVALID_PARAMS, JsonRpcResponse, METHOD_NOT_FOUND, NOT_FOUND};

/// Route a JSON-RPC request to the appropriate handler.
pub async fn handle_rpc(
    method: &str,
    params: Value,
    id: Value,
    state: &GatewayState,
) -> JsonRpcResponse {
    match method {
        "health" => handle_health(id, state).await,
        m if m.starts_with("cron.") => handle_cron(m, params, id, state).await,
        "conversation.create" => handle_conversation_create(&params, id, state).await,
        "conversation.list" => handle_conversation_list(id, state).await,
        "conversation.messages" => handle_conversation_messages(&params, id, state).await,
        "conversation.setProcessing" => handle_set_processing(&params, id, state).await,
        "conversation.delete" => handle_conversation_delete(&params, id, state).await,
        "system.resume" => handle_system_resume(id, state).await,
        _ => JsonRpcResponse::error(id, METHOD_NOT_FOUND, format!("Method not found: {method}")),
    }
}

/// Map a bridge failure onto a JSON-RPC error code.
pub fn bridge_error(id: Value, err: BridgeError) -> JsonRpcResponse {
    let code = match &err {
        BridgeError::UnknownMethod(_) => METHOD_NOT_FOUND,
        BridgeError::InvalidParams(_) | BridgeError::Cron(CronError::Validation(_)) => {
            INVALID_PARAMS
        }
        BridgeError::Cron(CronError::NotFound(_)) => NOT_FOUND,
        BridgeError::Cron(_) => INTERNAL_ERROR,
    };
    JsonRpcResponse::error(id, code, err.to_string())
}

/// health: returns system status.
async fn handle_health(id: Value, state: &GatewayState) -> JsonRpcResponse {
    let timers = state.service.pending_timers().await;
    JsonRpcResponse::success(
        id,
        json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "scheduler": state.service.is_initialized(),
            "timers": timers,
        }),
    )
}

/// cron.*: delegated to the bridge.
async fn handle_cron(method: &str, params: Value, id: Value, state: &GatewayState) -> JsonRpcResponse {
    match state.bridge.handle(method, params).await {
        Ok(result) => JsonRpcResponse::success(id, result),
        Err(e) => {
            tracing::debug!(method, "cron request failed: {e}");
            bridge_error(id, e)
        }
    }
}

fn required_str<'a>(params: &'a Value, key: &str) -> Result<&'a str, String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| format!("Missing '{key}' parameter"))
}

/// conversation.create: register a conversation jobs can deliver into.
///
/// Params:
///   - title: string (required)
///   - agentType: string (optional, defaults to "gemini")
///   - id: string (optional, generated when missing)
async fn handle_conversation_create(
    params: &Value,
    id: Value,
    state: &GatewayState,
) -> JsonRpcResponse {
    let title = match required_str(params, "title") {
        Ok(t) => t,
        Err(e) => return JsonRpcResponse::error(id, INVALID_PARAMS, e),
    };
    let agent_type = params
        .get("agentType")
        .and_then(|v| v.as_str())
        .unwrap_or("gemini");
    let conversation_id = params
        .get("id")
        .and_then(|v| v.as_str())
        .map(String::from)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let now = chrono::Utc::now().timestamp_millis();
    let conversation = Conversation {
        id: conversation_id,
        title: title.to_string(),
        agent_type: agent_type.to_string(),
        created_at: now,
        modify_time: now,
    };

    match state.storage.save_conversation(&conversation).await {
        Ok(()) => JsonRpcResponse::success(id, json!(conversation)),
        Err(e) => JsonRpcResponse::error(id, INTERNAL_ERROR, e.to_string()),
    }
}

/// conversation.list: most recently active first.
async fn handle_conversation_list(id: Value, state: &GatewayState) -> JsonRpcResponse {
    match state.storage.list_conversations().await {
        Ok(conversations) => JsonRpcResponse::success(id, json!(conversations)),
        Err(e) => JsonRpcResponse::error(id, INTERNAL_ERROR, e.to_string()),
    }
}

/// conversation.messages: messages of one conversation, oldest first.
///
/// Params:
///   - conversationId: string (required)
async fn handle_conversation_messages(
    params: &Value,
    id: Value,
    state: &GatewayState,
) -> JsonRpcResponse {
    let conversation_id = match required_str(params, "conversationId") {
        Ok(c) => c,
        Err(e) => return JsonRpcResponse::error(id, INVALID_PARAMS, e),
    };
    match state.storage.list_messages(conversation_id).await {
        Ok(messages) => JsonRpcResponse::success(id, json!(messages)),
        Err(e) => JsonRpcResponse::error(id, INTERNAL_ERROR, e.to_string()),
    }
}

/// conversation.setProcessing: agent runtime reports the start/end of a turn.
///
/// Params:
///   - conversationId: string (required)
///   - processing: bool (required)
async fn handle_set_processing(params: &Value, id: Value, state: &GatewayState) -> JsonRpcResponse {
    let conversation_id = match required_str(params, "conversationId") {
        Ok(c) => c,
        Err(e) => return JsonRpcResponse::error(id, INVALID_PARAMS, e),
    };
    let Some(processing) = params.get("processing").and_then(|v| v.as_bool()) else {
        return JsonRpcResponse::error(id, INVALID_PARAMS, "Missing 'processing' parameter");
    };

    state.busy.set_processing(conversation_id, processing).await;
    JsonRpcResponse::success(
        id,
        json!({
            "conversationId": conversation_id,
            "processing": processing,
        }),
    )
}

/// conversation.delete: delete a conversation together with its jobs.
///
/// Params:
///   - conversationId: string (required)
async fn handle_conversation_delete(
    params: &Value,
    id: Value,
    state: &GatewayState,
) -> JsonRpcResponse {
    let conversation_id = match required_str(params, "conversationId") {
        Ok(c) => c,
        Err(e) => return JsonRpcResponse::error(id, INVALID_PARAMS, e),
    };

    let removed_jobs = match state.bridge.remove_jobs_by_conversation(conversation_id).await {
        Ok(removed) => removed,
        Err(e) => return bridge_error(id, e),
    };
    state.busy.remove(conversation_id).await;

    match state.storage.delete_conversation(conversation_id).await {
        Ok(deleted) => JsonRpcResponse::success(
            id,
            json!({
                "deleted": deleted,
                "removedJobs": removed_jobs,
            }),
        ),
        Err(e) => JsonRpcResponse::error(id, INTERNAL_ERROR, e.to_string()),
    }
}

/// system.resume: host woke from sleep; mark missed jobs and re-arm timers.
async fn handle_system_resume(id: Value, state: &GatewayState) -> JsonRpcResponse {
    match state.service.handle_system_resume().await {
        Ok(missed) => JsonRpcResponse::success(id, json!({ "missed": missed })),
        Err(e) => JsonRpcResponse::error(id, INTERNAL_ERROR, e.to_string()),
    }
}
