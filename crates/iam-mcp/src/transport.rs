use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt as _};
use http::header::{ACCEPT, CONTENT_TYPE, HOST, HeaderMap, HeaderValue};
use http::{Method, StatusCode};
use iam_mcp_sigv4::{RequestSigner, SigV4Signer, SigningRequest};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::error::TransportError;
use crate::jsonrpc::JsonRpcMessage;
use crate::sse::{DEFAULT_MAX_LINE_BYTES, EventStreamDecoder};

pub const ACCEPT_JSON_AND_SSE: &str = "application/json, text/event-stream";

/// Receives every JSON-RPC message decoded from a response, in arrival order.
///
/// Called synchronously from the receive loop, so implementations should not block.
pub trait MessageHandler: Send + Sync {
    fn on_message(&self, message: JsonRpcMessage);
}

impl<F> MessageHandler for F
where
    F: Fn(JsonRpcMessage) + Send + Sync,
{
    fn on_message(&self, message: JsonRpcMessage) {
        self(message)
    }
}

/// Moves one JSON-RPC message to the server.
///
/// Resolves once the server's response has been fully consumed and every
/// message in it handed to the registered [`MessageHandler`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, message: &JsonRpcMessage) -> Result<(), TransportError>;
}

#[derive(Debug, Clone)]
pub struct SignedHttpTransportOptions {
    pub endpoint: Url,
    pub timeout: Duration,
    /// Bound on one buffered event-stream line, and on a whole `application/json` body.
    pub max_line_bytes: usize,
}

impl SignedHttpTransportOptions {
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            timeout: Duration::from_secs(30),
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

/// MCP streamable HTTP transport that signs every POST.
pub struct SignedHttpTransport<S = SigV4Signer> {
    http: reqwest::Client,
    endpoint: Url,
    host_header: HeaderValue,
    max_line_bytes: usize,
    signer: S,
    handler: Option<Arc<dyn MessageHandler>>,
}

impl<S: RequestSigner> SignedHttpTransport<S> {
    pub fn new(opts: SignedHttpTransportOptions, signer: S) -> anyhow::Result<Self> {
        let host = opts
            .endpoint
            .host_str()
            .context("endpoint url has no host")?;
        // The signature covers Host, so send exactly what was signed.
        let authority = match opts.endpoint.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        let host_header = HeaderValue::from_str(&authority).context("encode host header")?;

        let http = reqwest::Client::builder()
            .timeout(opts.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("build reqwest client")?;

        Ok(Self {
            http,
            endpoint: opts.endpoint,
            host_header,
            max_line_bytes: opts.max_line_bytes,
            signer,
            handler: None,
        })
    }

    /// Register the handler that receives decoded messages for this transport's lifetime.
    pub fn with_handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    fn base_headers(&self) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        h.insert(ACCEPT, HeaderValue::from_static(ACCEPT_JSON_AND_SSE));
        h.insert(HOST, self.host_header.clone());
        h
    }
}

#[async_trait]
impl<S: RequestSigner> Transport for SignedHttpTransport<S> {
    async fn send(&self, message: &JsonRpcMessage) -> Result<(), TransportError> {
        let body = serde_json::to_vec(message)?;
        let req =
            SigningRequest::from_url(Method::POST, &self.endpoint, self.base_headers(), body)?;
        let signed = self.signer.sign(req).await?;

        let resp = self
            .http
            .request(signed.method, self.endpoint.clone())
            .headers(signed.headers)
            .body(signed.body)
            .send()
            .await
            .map_err(TransportError::Request)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(TransportError::Http { status });
        }

        let Some(handler) = self.handler.as_deref() else {
            debug!(%status, "no message handler registered; ignoring response body");
            return Ok(());
        };
        if matches!(status, StatusCode::ACCEPTED | StatusCode::NO_CONTENT)
            || resp.content_length() == Some(0)
        {
            debug!(%status, "response has no body");
            return Ok(());
        }

        let ct = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|h| h.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();
        debug!(%status, content_type = %ct, "mcp http response");

        if ct.starts_with("application/json") {
            if resp
                .content_length()
                .is_some_and(|n| n > self.max_line_bytes as u64)
            {
                return Err(TransportError::BodyTooLarge {
                    limit: self.max_line_bytes,
                });
            }
            let body = read_bounded_body(resp.bytes_stream(), self.max_line_bytes).await?;
            let delivered = dispatch_json_document(&body, handler);
            debug!(delivered, "json response dispatched");
            return Ok(());
        }

        consume_event_stream(resp.bytes_stream(), self.max_line_bytes, handler).await
    }
}

/// Drive an event-stream body to completion, dispatching messages as lines complete.
pub(crate) async fn consume_event_stream<St>(
    stream: St,
    max_line_bytes: usize,
    handler: &dyn MessageHandler,
) -> Result<(), TransportError>
where
    St: Stream<Item = Result<Bytes, reqwest::Error>>,
{
    let mut stream = std::pin::pin!(stream);
    let mut decoder = EventStreamDecoder::new(max_line_bytes);
    let mut delivered = 0usize;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(TransportError::StreamRead)?;
        decoder.feed(&chunk, |m| {
            delivered += 1;
            handler.on_message(m);
        })?;
    }

    let discarded = decoder.finish();
    debug!(delivered, discarded, "event stream ended");
    Ok(())
}

/// Collect a whole response body, failing once it grows past `limit`.
pub(crate) async fn read_bounded_body<St>(
    stream: St,
    limit: usize,
) -> Result<Bytes, TransportError>
where
    St: Stream<Item = Result<Bytes, reqwest::Error>>,
{
    let mut stream = std::pin::pin!(stream);
    let mut body = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(TransportError::StreamRead)?;
        if body.len() + chunk.len() > limit {
            return Err(TransportError::BodyTooLarge { limit });
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body.freeze())
}

/// A plain JSON response: one message or a batch array. Returns how many were delivered.
fn dispatch_json_document(body: &[u8], handler: &dyn MessageHandler) -> usize {
    if body.iter().all(u8::is_ascii_whitespace) {
        return 0;
    }
    let document: Value = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "dropping undecodable json response body");
            return 0;
        }
    };

    let messages = JsonRpcMessage::from_document(document);
    let delivered = messages.len();
    for m in messages {
        handler.on_message(m);
    }
    delivered
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::jsonrpc::JsonRpcId;

    #[derive(Default)]
    struct Collect(Mutex<Vec<JsonRpcMessage>>);

    impl MessageHandler for Collect {
        fn on_message(&self, message: JsonRpcMessage) {
            self.0.lock().unwrap().push(message);
        }
    }

    #[test]
    fn json_document_single_and_batch() {
        let c = Collect::default();
        assert_eq!(
            dispatch_json_document(br#"{"jsonrpc":"2.0","id":1,"result":{}}"#, &c),
            1
        );
        assert_eq!(
            dispatch_json_document(
                br#"[{"jsonrpc":"2.0","id":2,"result":1},{"nope":true},{"jsonrpc":"2.0","method":"n"}]"#,
                &c
            ),
            3
        );
        assert_eq!(
            dispatch_json_document(
                br#"{"jsonrpc":"2.0","id":null,"error":{"code":-32700,"message":"Parse error"}}"#,
                &c
            ),
            1
        );
        assert_eq!(dispatch_json_document(b"  \n", &c), 0);
        assert_eq!(dispatch_json_document(b"{oops", &c), 0);

        let got = c.0.lock().unwrap();
        let ids: Vec<_> = got.iter().map(|m| m.id().cloned()).collect();
        assert_eq!(
            ids,
            vec![
                Some(JsonRpcId::Number(1)),
                Some(JsonRpcId::Number(2)),
                None,
                None,
                Some(JsonRpcId::Null),
            ]
        );
        assert_eq!(got[2], JsonRpcMessage::Other(serde_json::json!({"nope": true})));
    }

    #[tokio::test]
    async fn json_body_is_bounded() -> anyhow::Result<()> {
        let chunks = || -> Vec<Result<Bytes, reqwest::Error>> {
            vec![Ok(Bytes::from(vec![b' '; 60])), Ok(Bytes::from(vec![b' '; 60]))]
        };
        let body = read_bounded_body(futures_util::stream::iter(chunks()), 120).await?;
        assert_eq!(body.len(), 120);

        let err = read_bounded_body(futures_util::stream::iter(chunks()), 100)
            .await
            .unwrap_err();
        assert!(
            matches!(err, TransportError::BodyTooLarge { limit: 100 }),
            "err={err}"
        );
        assert!(!err.is_transmit_failure());
        Ok(())
    }

    #[tokio::test]
    async fn event_stream_driver_preserves_order_across_chunks() -> anyhow::Result<()> {
        let chunks: Vec<Result<Bytes, reqwest::Error>> = vec![
            Ok(Bytes::from_static(b"data: {\"jsonrpc\":\"2.0\",\"id\":1,\"res")),
            Ok(Bytes::from_static(b"ult\":1}\n\nevent: ping\n\ndata: {\"jsonrpc\":")),
            Ok(Bytes::from_static(b"\"2.0\",\"id\":2,\"result\":2}\n\ndata: {\"jsonrpc\"")),
        ];
        let c = Collect::default();
        consume_event_stream(futures_util::stream::iter(chunks), 1024, &c).await?;

        let got = c.0.lock().unwrap();
        let ids: Vec<_> = got.iter().map(|m| m.id().cloned()).collect();
        assert_eq!(
            ids,
            vec![Some(JsonRpcId::Number(1)), Some(JsonRpcId::Number(2))]
        );
        Ok(())
    }

    #[tokio::test]
    async fn event_stream_driver_enforces_line_limit() {
        let chunks: Vec<Result<Bytes, reqwest::Error>> =
            vec![Ok(Bytes::from(vec![b'x'; 64])), Ok(Bytes::from(vec![b'y'; 64]))];
        let c = Collect::default();
        let err = consume_event_stream(futures_util::stream::iter(chunks), 100, &c)
            .await
            .unwrap_err();
        assert!(
            matches!(err, TransportError::LineTooLong(ref e) if e.limit == 100),
            "err={err}"
        );
        assert!(!err.is_transmit_failure());
    }

    #[test]
    fn closures_are_handlers() {
        let seen = Arc::new(Mutex::new(0));
        let s = seen.clone();
        let h: Arc<dyn MessageHandler> = Arc::new(move |_m: JsonRpcMessage| {
            *s.lock().unwrap() += 1;
        });
        h.on_message(JsonRpcMessage::from(crate::jsonrpc::JsonRpcNotification::new(
            "x", None,
        )));
        assert_eq!(*seen.lock().unwrap(), 1);
    }
}
