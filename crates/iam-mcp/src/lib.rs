//! MCP streamable HTTP client transport with AWS SigV4 request signing.

pub mod client;
pub mod error;
pub mod jsonrpc;
pub mod sse;
pub mod transport;
pub mod types;

pub use client::{McpClient, ResponseInbox};
pub use error::{LineTooLong, MessageDecodeError, TransportError};
pub use jsonrpc::{
    JsonRpcError, JsonRpcId, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse,
};
pub use sse::{EventStreamDecoder, parse_event_line};
pub use transport::{MessageHandler, SignedHttpTransport, SignedHttpTransportOptions, Transport};

pub const PROTOCOL_VERSION_LATEST: &str = "2025-11-25";
