use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Context as _;
use iam_mcp_sigv4::RequestSigner;
use tokio::sync::oneshot;
use tracing::{info, warn};
use uuid::Uuid;

use crate::PROTOCOL_VERSION_LATEST;
use crate::jsonrpc::{
    JsonRpcId, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
};
use crate::transport::{
    MessageHandler, SignedHttpTransport, SignedHttpTransportOptions, Transport,
};
use crate::types::{
    CallToolParams, CallToolResult, InitializeParams, InitializeResult, ListToolsParams,
    ListToolsResult,
};

/// Routes responses back to the request that is waiting for them.
#[derive(Default)]
pub struct ResponseInbox {
    pending: Mutex<HashMap<JsonRpcId, oneshot::Sender<JsonRpcResponse>>>,
}

impl ResponseInbox {
    fn register(&self, id: JsonRpcId) -> oneshot::Receiver<JsonRpcResponse> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);
        rx
    }

    fn forget(&self, id: &JsonRpcId) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl MessageHandler for ResponseInbox {
    fn on_message(&self, message: JsonRpcMessage) {
        match message {
            JsonRpcMessage::Response(r) => {
                let tx = self
                    .pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&r.id);
                match tx {
                    Some(tx) => {
                        let _ = tx.send(r);
                    }
                    None => match &r.error {
                        Some(e) => warn!(
                            id = %r.id,
                            code = e.code,
                            message = %e.message,
                            "error response for unknown request id"
                        ),
                        None => warn!(id = %r.id, "response for unknown request id"),
                    },
                }
            }
            JsonRpcMessage::Other(v) => {
                warn!(value = %v, "ignoring non json-rpc message");
            }
            JsonRpcMessage::Notification(n) => {
                info!(method = %n.method, "server notification");
            }
            JsonRpcMessage::Request(r) => {
                warn!(method = %r.method, id = %r.id, "ignoring server-initiated request");
            }
        }
    }
}

/// Minimal MCP client session on top of any [`Transport`].
///
/// The transport must deliver a request's response to the shared
/// [`ResponseInbox`] before its `send` resolves.
pub struct McpClient<T> {
    transport: T,
    inbox: Arc<ResponseInbox>,
    protocol_version: String,
    initialized: bool,
    ready: bool,
}

impl<S: RequestSigner + 'static> McpClient<SignedHttpTransport<S>> {
    pub fn connect(opts: SignedHttpTransportOptions, signer: S) -> anyhow::Result<Self> {
        let inbox = Arc::new(ResponseInbox::default());
        let transport = SignedHttpTransport::new(opts, signer)?.with_handler(inbox.clone());
        Ok(Self::new(transport, inbox))
    }
}

impl<T: Transport> McpClient<T> {
    pub fn new(transport: T, inbox: Arc<ResponseInbox>) -> Self {
        Self {
            transport,
            inbox,
            protocol_version: PROTOCOL_VERSION_LATEST.to_string(),
            initialized: false,
            ready: false,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn protocol_version(&self) -> &str {
        &self.protocol_version
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub async fn initialize(
        &mut self,
        client_name: &str,
        client_version: &str,
    ) -> anyhow::Result<InitializeResult> {
        if self.initialized {
            anyhow::bail!("already initialized");
        }

        let params = InitializeParams::new_default(client_name, client_version);
        let req = JsonRpcRequest::new(
            new_request_id(),
            "initialize",
            Some(serde_json::to_value(params)?),
        );
        let resp = self.send_request(req).await?;

        let init: InitializeResult = parse_result(resp)?;
        self.protocol_version = init.protocol_version.clone();
        self.initialized = true;
        info!(
            server = %init.server_info.name,
            protocol_version = %init.protocol_version,
            "mcp session initialized"
        );

        // Complete lifecycle handshake.
        self.send_notification(JsonRpcNotification::new(
            "notifications/initialized",
            None,
        ))
        .await?;
        self.ready = true;

        Ok(init)
    }

    pub async fn list_tools(&self, params: ListToolsParams) -> anyhow::Result<ListToolsResult> {
        self.ensure_ready()?;
        let req = JsonRpcRequest::new(
            new_request_id(),
            "tools/list",
            Some(serde_json::to_value(params)?),
        );
        let resp = self.send_request(req).await?;
        parse_result::<ListToolsResult>(resp)
    }

    pub async fn call_tool(&self, params: CallToolParams) -> anyhow::Result<CallToolResult> {
        self.ensure_ready()?;
        let req = JsonRpcRequest::new(
            new_request_id(),
            "tools/call",
            Some(serde_json::to_value(params)?),
        );
        let resp = self.send_request(req).await?;
        parse_result::<CallToolResult>(resp)
    }

    fn ensure_ready(&self) -> anyhow::Result<()> {
        if !self.ready {
            anyhow::bail!("mcp client not ready (missing initialize)");
        }
        Ok(())
    }

    async fn send_notification(&self, n: JsonRpcNotification) -> anyhow::Result<()> {
        let method = n.method.clone();
        self.transport
            .send(&JsonRpcMessage::Notification(n))
            .await
            .with_context(|| format!("send notification {method}"))
    }

    async fn send_request(&self, req: JsonRpcRequest) -> anyhow::Result<JsonRpcResponse> {
        let id = req.id.clone();
        let method = req.method.clone();
        let mut rx = self.inbox.register(id.clone());

        if let Err(e) = self.transport.send(&JsonRpcMessage::Request(req)).await {
            self.inbox.forget(&id);
            return Err(e).with_context(|| format!("send request {method}"));
        }

        match rx.try_recv() {
            Ok(resp) => Ok(resp),
            Err(_) => {
                self.inbox.forget(&id);
                anyhow::bail!("no response for request {method} (id {id})");
            }
        }
    }
}

fn new_request_id() -> JsonRpcId {
    JsonRpcId::String(Uuid::new_v4().to_string())
}

fn parse_result<T: serde::de::DeserializeOwned>(resp: JsonRpcResponse) -> anyhow::Result<T> {
    if resp.jsonrpc != "2.0" {
        anyhow::bail!("invalid jsonrpc version in response");
    }
    if let Some(err) = resp.error {
        anyhow::bail!("mcp json-rpc error {}: {}", err.code, err.message);
    }
    let Some(v) = resp.result else {
        anyhow::bail!("missing result");
    };
    serde_json::from_value(v).context("decode result")
}
