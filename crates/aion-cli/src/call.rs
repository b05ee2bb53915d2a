use anyhow::{Context, Result, bail};
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio_tungstenite::tungstenite;

/// Call one JSON-RPC method on the Gateway and print its result.
///
/// With `watch`, the connection stays open afterwards and every pushed
/// notification is printed until the Gateway closes it or Ctrl-C.
pub async fn run_call(
    method: String,
    params: Value,
    url: String,
    token: Option<String>,
    watch: bool,
) -> Result<()> {
    let ws_url = with_token_query(&url, token.as_deref());

    let mut request = tungstenite::http::Request::builder()
        .uri(&ws_url)
        .header("Sec-WebSocket-Version", "13")
        .header(
            "Sec-WebSocket-Key",
            tungstenite::handshake::client::generate_key(),
        )
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Host", extract_host(&ws_url).unwrap_or("localhost"));

    if let Some(ref token) = token {
        request = request.header("Authorization", format!("Bearer {token}"));
    }

    let request = request
        .body(())
        .context("Failed to build WebSocket request")?;

    let (mut ws, _response) = tokio_tungstenite::connect_async(request)
        .await
        .context("Failed to connect to Gateway WebSocket")?;

    let rpc_request = json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": method,
        "params": params,
    });

    ws.send(tungstenite::Message::Text(rpc_request.to_string().into()))
        .await
        .context("Failed to send request")?;

    let mut answered = false;
    loop {
        let msg = tokio::select! {
            msg = ws.next() => msg,
            _ = tokio::signal::ctrl_c(), if answered => break,
        };
        let Some(msg) = msg else { break };

        match msg? {
            tungstenite::Message::Text(text) => {
                let message: Value =
                    serde_json::from_str(&text).context("Failed to parse response")?;

                if message.get("id").is_none() {
                    print_notification(&message);
                    continue;
                }

                if let Some(error) = message.get("error") {
                    bail!(
                        "{} (code {})",
                        error
                            .get("message")
                            .and_then(|m| m.as_str())
                            .unwrap_or("Unknown error"),
                        error.get("code").and_then(|c| c.as_i64()).unwrap_or(0)
                    );
                }
                if let Some(result) = message.get("result") {
                    println!("{}", serde_json::to_string_pretty(result)?);
                }
                answered = true;
                if !watch {
                    break;
                }
                eprintln!("(watching for events, Ctrl-C to stop)");
            }
            tungstenite::Message::Close(_) => break,
            _ => {}
        }
    }

    let _ = ws.close(None).await;

    Ok(())
}

fn print_notification(message: &Value) {
    let method = message
        .get("method")
        .and_then(|m| m.as_str())
        .unwrap_or("?");
    let params = message.get("params").cloned().unwrap_or(Value::Null);
    println!("[{method}] {params}");
}

fn with_token_query(url: &str, token: Option<&str>) -> String {
    match token {
        Some(token) if url.contains('?') => format!("{url}&token={token}"),
        Some(token) => format!("{url}?token={token}"),
        None => url.to_string(),
    }
}

/// Extract host from a URL string.
fn extract_host(url: &str) -> Option<&str> {
    let after_scheme = url
        .strip_prefix("ws://")
        .or_else(|| url.strip_prefix("wss://"))?;
    after_scheme.split(['/', '?']).next()
}
