use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use http::Method;
use http::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use iam_mcp_core::util::{sha256_hex, uri_encode};
use sha2::Sha256;
use url::Url;

use crate::credentials::{Credentials, ProvideCredentials};
use crate::{ALGORITHM, CredentialsError, SigningError, X_AMZ_DATE, X_AMZ_SECURITY_TOKEN};

type HmacSha256 = Hmac<Sha256>;

/// Headers that proxies and clients are free to rewrite, so they never enter the signature.
const UNSIGNABLE_HEADERS: &[&str] = &[
    "authorization",
    "cache-control",
    "connection",
    "expect",
    "from",
    "keep-alive",
    "max-forwards",
    "pragma",
    "referer",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "user-agent",
    "x-amzn-trace-id",
];

/// Service and region the signature is scoped to, e.g. `lambda` / `us-east-1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningScope {
    pub service: String,
    pub region: String,
}

impl SigningScope {
    pub fn new(service: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            region: region.into(),
        }
    }
}

/// A request as seen by the signer. Consumed by value when signed.
#[derive(Debug, Clone)]
pub struct SigningRequest {
    method: Method,
    scheme: String,
    host: String,
    port: Option<u16>,
    path: String,
    query: Option<String>,
    headers: HeaderMap,
    body: Bytes,
}

impl SigningRequest {
    pub fn from_url(
        method: Method,
        url: &Url,
        headers: HeaderMap,
        body: impl Into<Bytes>,
    ) -> Result<Self, SigningError> {
        let host = url.host_str().ok_or(SigningError::MissingHost)?;
        Ok(Self {
            method,
            scheme: url.scheme().to_string(),
            host: host.to_string(),
            port: url.port(),
            path: url.path().to_string(),
            query: url.query().map(str::to_string),
            headers,
            body: body.into(),
        })
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Explicit port; `None` when the URL uses the scheme's default.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }
}

/// Output of signing: the original headers merged with the authentication headers.
#[derive(Debug, Clone)]
pub struct SignedRequest {
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Pluggable signing strategy used by the transport.
#[async_trait]
pub trait RequestSigner: Send + Sync {
    async fn sign(&self, request: SigningRequest) -> Result<SignedRequest, SigningError>;
}

#[async_trait]
impl<S: RequestSigner + ?Sized> RequestSigner for Arc<S> {
    async fn sign(&self, request: SigningRequest) -> Result<SignedRequest, SigningError> {
        (**self).sign(request).await
    }
}

/// AWS Signature Version 4 signer.
#[derive(Clone)]
pub struct SigV4Signer {
    scope: SigningScope,
    credentials: Arc<dyn ProvideCredentials>,
}

impl SigV4Signer {
    pub fn new(scope: SigningScope, credentials: impl ProvideCredentials + 'static) -> Self {
        Self {
            scope,
            credentials: Arc::new(credentials),
        }
    }

    /// Sign as of `now`. Credentials are resolved from the provider on every call.
    pub async fn sign_at(
        &self,
        request: SigningRequest,
        now: DateTime<Utc>,
    ) -> Result<SignedRequest, SigningError> {
        let creds = self.credentials.provide_credentials().await?;
        if creds.is_expired_at(now) {
            return Err(CredentialsError::Expired.into());
        }
        sign_with_credentials(request, &creds, &self.scope, now)
    }
}

impl fmt::Debug for SigV4Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigV4Signer")
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl RequestSigner for SigV4Signer {
    async fn sign(&self, request: SigningRequest) -> Result<SignedRequest, SigningError> {
        self.sign_at(request, Utc::now()).await
    }
}

/// Pure SigV4 signing with already-resolved credentials.
pub fn sign_with_credentials(
    request: SigningRequest,
    creds: &Credentials,
    scope: &SigningScope,
    now: DateTime<Utc>,
) -> Result<SignedRequest, SigningError> {
    let SigningRequest {
        method,
        path,
        query,
        mut headers,
        body,
        ..
    } = request;

    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = now.format("%Y%m%d").to_string();

    headers.insert(
        HeaderName::from_static(X_AMZ_DATE),
        header_value(X_AMZ_DATE, &amz_date, false)?,
    );
    if let Some(token) = &creds.session_token {
        headers.insert(
            HeaderName::from_static(X_AMZ_SECURITY_TOKEN),
            header_value(X_AMZ_SECURITY_TOKEN, token.expose(), true)?,
        );
    }

    let payload_hash = sha256_hex(&body);
    let (canonical, signed_headers) =
        canonical_request(&method, &path, query.as_deref(), &headers, &payload_hash)?;

    let credential_scope = format!(
        "{date}/{}/{}/aws4_request",
        scope.region, scope.service
    );
    let string_to_sign = format!(
        "{ALGORITHM}\n{amz_date}\n{credential_scope}\n{}",
        sha256_hex(canonical.as_bytes())
    );

    let key = derive_signing_key(
        creds.secret_access_key.expose(),
        &date,
        &scope.region,
        &scope.service,
    );
    let signature = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes()));

    let authorization = format!(
        "{ALGORITHM} Credential={}/{credential_scope}, SignedHeaders={signed_headers}, Signature={signature}",
        creds.access_key_id
    );
    headers.insert(
        AUTHORIZATION,
        header_value("authorization", &authorization, true)?,
    );

    Ok(SignedRequest {
        method,
        headers,
        body,
    })
}

/// `kSigning = HMAC(HMAC(HMAC(HMAC("AWS4" + secret, date), region), service), "aws4_request")`.
pub fn derive_signing_key(secret: &str, date: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{secret}").as_bytes(), date.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

fn hmac_sha256(key: &[u8], msg: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(msg);
    mac.finalize().into_bytes().to_vec()
}

fn header_value(name: &str, value: &str, sensitive: bool) -> Result<HeaderValue, SigningError> {
    let mut v =
        HeaderValue::from_str(value).map_err(|_| SigningError::InvalidHeader(name.to_string()))?;
    v.set_sensitive(sensitive);
    Ok(v)
}

/// Returns `(canonical_request, signed_headers)`.
pub(crate) fn canonical_request(
    method: &Method,
    path: &str,
    query: Option<&str>,
    headers: &HeaderMap,
    payload_hash: &str,
) -> Result<(String, String), SigningError> {
    // HeaderMap names are already lowercase.
    let mut canon: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for (name, value) in headers {
        let n = name.as_str();
        if UNSIGNABLE_HEADERS.contains(&n) {
            continue;
        }
        let v = value
            .to_str()
            .map_err(|_| SigningError::InvalidHeader(n.to_string()))?;
        canon.entry(n).or_default().push(normalize_header_value(v));
    }

    let canonical_headers: String = canon
        .iter()
        .map(|(k, vs)| format!("{k}:{}\n", vs.join(",")))
        .collect();
    let signed_headers = canon.keys().copied().collect::<Vec<_>>().join(";");

    let canonical = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        method.as_str(),
        canonical_uri(path),
        canonical_query(query),
        canonical_headers,
        signed_headers,
        payload_hash
    );
    Ok((canonical, signed_headers))
}

fn normalize_header_value(v: &str) -> String {
    v.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn canonical_uri(path: &str) -> String {
    let mut segs: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                segs.pop();
            }
            s => segs.push(s),
        }
    }

    let mut normalized = String::from("/");
    normalized.push_str(&segs.join("/"));
    if !segs.is_empty() && path.ends_with('/') {
        normalized.push('/');
    }
    // The URL path is already percent-encoded, so this is the double encoding
    // non-S3 services expect.
    uri_encode(&normalized, true)
}

fn canonical_query(query: Option<&str>) -> String {
    let Some(q) = query.filter(|q| !q.is_empty()) else {
        return String::new();
    };
    let mut pairs: Vec<(String, String)> = url::form_urlencoded::parse(q.as_bytes())
        .map(|(k, v)| (uri_encode(&k, false), uri_encode(&v, false)))
        .collect();
    pairs.sort();
    pairs
        .into_iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}
