//! AWS Signature Version 4 request signing and credential resolution.
//!
//! - callers hand over a [`SigningRequest`] and get back the final header set
//! - credentials are resolved per call through [`ProvideCredentials`]
//! - secret material stays wrapped in [`iam_mcp_core::Sensitive`]

mod credentials;
mod profile;
mod signer;

pub use credentials::{
    CachingProvider, ChainProvider, Credentials, EnvironmentProvider, ProvideCredentials,
    StaticProvider, default_provider,
};
pub use profile::ProfileFileProvider;
pub use signer::{
    RequestSigner, SigV4Signer, SignedRequest, SigningRequest, SigningScope, derive_signing_key,
    sign_with_credentials,
};

use thiserror::Error;

/// Signing algorithm identifier used in the string to sign and `Authorization`.
pub const ALGORITHM: &str = "AWS4-HMAC-SHA256";

pub const X_AMZ_DATE: &str = "x-amz-date";
pub const X_AMZ_SECURITY_TOKEN: &str = "x-amz-security-token";

#[derive(Debug, Error)]
pub enum CredentialsError {
    #[error("credentials not found: {0}")]
    NotFound(String),
    #[error("credentials expired")]
    Expired,
    #[error("invalid credentials: {0}")]
    Invalid(String),
    #[error("read credentials file")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum SigningError {
    #[error(transparent)]
    Credentials(#[from] CredentialsError),
    #[error("request url has no host")]
    MissingHost,
    #[error("header {0} is not valid for signing")]
    InvalidHeader(String),
}
