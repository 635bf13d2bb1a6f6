//! JSON-RPC over HTTP transport.
//!
//! Each request is a `POST` of one JSON-RPC 2.0 message to the server URL.
//! Replies are read either as a plain JSON body or as a server-sent event
//! stream carrying the reply in a `data:` line. A session identifier handed
//! out by the server in the `Mcp-Session-Id` header is echoed on every later
//! request and used to end the session.

use crate::fleet::{
    domain::ToolDescriptor,
    ports::{Transport, TransportError, TransportResult, TransportSession},
};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

const SESSION_HEADER: &str = "Mcp-Session-Id";
const PROTOCOL_VERSION: &str = "2025-03-26";
const INTERNAL_ERROR: i64 = -32603;

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct ToolsPage {
    #[serde(default)]
    tools: Vec<Value>,
    #[serde(default, rename = "nextCursor")]
    next_cursor: Option<String>,
}

fn extract_result(response: JsonRpcResponse) -> TransportResult<Value> {
    if let Some(err) = response.error {
        return Err(TransportError::Remote {
            code: err.code,
            message: err.message,
        });
    }

    response.result.ok_or_else(|| TransportError::Remote {
        code: INTERNAL_ERROR,
        message: "response missing both result and error".to_owned(),
    })
}

fn parse_reply(content_type: &str, body: &str) -> TransportResult<JsonRpcResponse> {
    if content_type.starts_with("text/event-stream") {
        return body
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .find_map(|data| serde_json::from_str::<JsonRpcResponse>(data.trim()).ok())
            .ok_or_else(|| TransportError::Remote {
                code: INTERNAL_ERROR,
                message: "event stream carried no JSON-RPC reply".to_owned(),
            });
    }

    serde_json::from_str(body).map_err(TransportError::runtime)
}

fn map_send_error(url: &str, timeout: Duration, err: &reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(timeout)
    } else {
        TransportError::Unreachable {
            url: url.to_owned(),
            reason: err.to_string(),
        }
    }
}

/// Transport speaking JSON-RPC 2.0 over HTTP `POST`.
#[derive(Debug, Clone)]
pub struct HttpJsonRpcTransport {
    client: reqwest::Client,
    handshake_timeout: Duration,
}

impl HttpJsonRpcTransport {
    /// Creates a transport whose handshake waits at most `handshake_timeout`.
    #[must_use]
    pub fn new(handshake_timeout: Duration) -> Self {
        Self::with_client(reqwest::Client::new(), handshake_timeout)
    }

    /// Creates a transport sharing an existing client.
    #[must_use]
    pub const fn with_client(client: reqwest::Client, handshake_timeout: Duration) -> Self {
        Self {
            client,
            handshake_timeout,
        }
    }
}

#[async_trait]
impl Transport for HttpJsonRpcTransport {
    async fn open(&self, url: &str) -> TransportResult<Box<dyn TransportSession>> {
        let mut session = HttpJsonRpcSession {
            client: self.client.clone(),
            url: url.to_owned(),
            session_id: None,
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            default_timeout: self.handshake_timeout,
        };

        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
        });
        let (session_id, initial) = session
            .post("initialize", Some(params), true, self.handshake_timeout)
            .await
            .map_err(|err| match err {
                TransportError::Remote { code, message } => {
                    TransportError::Handshake(format!("[{code}] {message}"))
                }
                other => other,
            })?;
        session.session_id = session_id;

        if let Err(err) = finish_handshake(&session, initial, self.handshake_timeout).await {
            // Release the session id the server already issued.
            if let Err(close_err) = session.close().await {
                tracing::debug!(url, error = %close_err, "partial session close failed");
            }
            return Err(err);
        }
        Ok(Box::new(session))
    }
}

/// Checks the initialize reply and sends the `initialized` notification.
async fn finish_handshake(
    session: &HttpJsonRpcSession,
    initial: Option<JsonRpcResponse>,
    timeout: Duration,
) -> TransportResult<()> {
    let reply =
        initial.ok_or_else(|| TransportError::Handshake("initialize got no reply".to_owned()))?;
    extract_result(reply).map_err(|err| TransportError::Handshake(err.to_string()))?;
    session
        .post("notifications/initialized", None, false, timeout)
        .await?;
    Ok(())
}

struct HttpJsonRpcSession {
    client: reqwest::Client,
    url: String,
    session_id: Option<String>,
    next_id: AtomicU64,
    closed: AtomicBool,
    default_timeout: Duration,
}

impl HttpJsonRpcSession {
    fn ensure_open(&self) -> TransportResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    /// Posts one message; requests expect a reply, notifications do not.
    async fn post(
        &self,
        method: &str,
        params: Option<Value>,
        expects_reply: bool,
        timeout: Duration,
    ) -> TransportResult<(Option<String>, Option<JsonRpcResponse>)> {
        let id = expects_reply.then(|| self.next_id.fetch_add(1, Ordering::Relaxed));
        let message = JsonRpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };

        let mut request = self
            .client
            .post(&self.url)
            .timeout(timeout)
            .header(
                ACCEPT,
                HeaderValue::from_static("application/json, text/event-stream"),
            )
            .json(&message);
        if let Some(session_id) = &self.session_id {
            request = request.header(SESSION_HEADER, session_id);
        }

        let response = request
            .send()
            .await
            .map_err(|err| map_send_error(&self.url, timeout, &err))?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Unreachable {
                url: self.url.clone(),
                reason: format!("HTTP status {status}"),
            });
        }

        let session_id = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        if !expects_reply {
            return Ok((session_id, None));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("application/json")
            .to_owned();
        let body = response
            .text()
            .await
            .map_err(|err| map_send_error(&self.url, timeout, &err))?;
        let reply = parse_reply(&content_type, &body)?;
        Ok((session_id, Some(reply)))
    }

    async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> TransportResult<Value> {
        let (_, maybe_reply) = self.post(method, Some(params), true, timeout).await?;
        let reply = maybe_reply.ok_or_else(|| TransportError::Remote {
            code: INTERNAL_ERROR,
            message: format!("{method} got no reply"),
        })?;
        extract_result(reply)
    }
}

#[async_trait]
impl TransportSession for HttpJsonRpcSession {
    async fn list_tools(&self) -> TransportResult<Vec<ToolDescriptor>> {
        self.ensure_open()?;
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = cursor
                .as_ref()
                .map_or_else(|| json!({}), |next| json!({ "cursor": next }));
            let result = self
                .request("tools/list", params, self.default_timeout)
                .await?;
            let page: ToolsPage = serde_json::from_value(result).map_err(TransportError::runtime)?;
            tools.extend(page.tools.into_iter().filter_map(|raw| {
                serde_json::from_value::<ToolDescriptor>(raw)
                    .inspect_err(|err| {
                        tracing::warn!(url = %self.url, error = %err, "skipping invalid tool");
                    })
                    .ok()
            }));
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(tools),
            }
        }
    }

    async fn call(
        &self,
        tool_name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> TransportResult<Value> {
        self.ensure_open()?;
        let params = json!({ "name": tool_name, "arguments": arguments });
        self.request("tools/call", params, timeout).await
    }

    async fn close(&self) -> TransportResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let Some(session_id) = &self.session_id else {
            return Ok(());
        };

        // Servers may refuse explicit termination; the session is gone
        // from our side either way.
        let outcome = self
            .client
            .delete(&self.url)
            .timeout(self.default_timeout)
            .header(SESSION_HEADER, session_id)
            .send()
            .await;
        if let Err(err) = outcome {
            tracing::debug!(url = %self.url, error = %err, "session termination request failed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn extract_result_maps_error_object() {
        let reply = JsonRpcResponse {
            result: None,
            error: Some(JsonRpcError {
                code: -32601,
                message: "Method not found".to_owned(),
            }),
        };

        let result = extract_result(reply);

        assert!(matches!(
            result,
            Err(TransportError::Remote { code: -32601, .. })
        ));
    }

    #[rstest]
    fn extract_result_rejects_empty_reply() {
        let reply = JsonRpcResponse {
            result: None,
            error: None,
        };

        assert!(matches!(
            extract_result(reply),
            Err(TransportError::Remote { code: INTERNAL_ERROR, .. })
        ));
    }

    #[rstest]
    #[case("application/json", r#"{"jsonrpc":"2.0","id":1,"result":{"ok":true}}"#)]
    #[case(
        "text/event-stream",
        "event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"ok\":true}}\n\n"
    )]
    fn parse_reply_accepts_json_and_event_stream(#[case] content_type: &str, #[case] body: &str) {
        let reply = parse_reply(content_type, body).expect("reply should parse");

        let result = extract_result(reply).expect("reply should carry a result");
        assert_eq!(result, json!({ "ok": true }));
    }
}
