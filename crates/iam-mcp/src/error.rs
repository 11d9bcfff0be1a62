use http::StatusCode;
use iam_mcp_sigv4::{CredentialsError, SigningError};
use thiserror::Error;

/// Failure of one `send` call. Every variant is scoped to that call.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("resolve signing credentials")]
    Credential(#[source] CredentialsError),
    #[error("sign request: {0}")]
    Signing(String),
    #[error("serialize message")]
    Serialize(#[from] serde_json::Error),
    #[error("send request")]
    Request(#[source] reqwest::Error),
    #[error("HTTP error! status: {status}")]
    Http { status: StatusCode },
    #[error("read response stream")]
    StreamRead(#[source] reqwest::Error),
    #[error(transparent)]
    LineTooLong(#[from] LineTooLong),
    #[error("json response body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },
}

impl TransportError {
    /// True when the message never reached the server or was refused by it, as
    /// opposed to a failure while consuming the server's response.
    pub fn is_transmit_failure(&self) -> bool {
        !matches!(
            self,
            TransportError::StreamRead(_)
                | TransportError::LineTooLong(_)
                | TransportError::BodyTooLarge { .. }
        )
    }
}

impl From<SigningError> for TransportError {
    fn from(e: SigningError) -> Self {
        match e {
            SigningError::Credentials(c) => TransportError::Credential(c),
            other => TransportError::Signing(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("event stream line exceeds {limit} bytes")]
pub struct LineTooLong {
    pub limit: usize,
}

/// A `data:` line whose payload is not JSON. Logged, never raised.
#[derive(Debug, Error)]
#[error("decode event data as json")]
pub struct MessageDecodeError {
    pub source: serde_json::Error,
    /// Leading part of the offending payload.
    pub data: String,
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn chained_messages_name_each_cause_once() {
        let err = TransportError::from(SigningError::Credentials(CredentialsError::NotFound(
            "no provider configured".to_string(),
        )));
        assert_eq!(err.to_string(), "resolve signing credentials");
        let source = err.source().map(|s| s.to_string());
        assert_eq!(
            source.as_deref(),
            Some("credentials not found: no provider configured")
        );

        let json = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = TransportError::from(json);
        let chain = format!("{:#}", anyhow::Error::new(err));
        assert_eq!(chain.matches("EOF while parsing").count(), 1, "{chain}");
        assert!(chain.starts_with("serialize message: "), "{chain}");
    }
}
