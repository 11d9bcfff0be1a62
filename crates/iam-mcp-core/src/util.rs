use sha2::Digest as _;

/// Lowercase hex SHA-256 of `msg`.
pub fn sha256_hex(msg: &[u8]) -> String {
    hex::encode(sha2::Sha256::digest(msg))
}

/// Percent-encode every byte outside the RFC 3986 unreserved set.
///
/// When `keep_slash` is set, `/` passes through unchanged (used for paths).
pub fn uri_encode(input: &str, keep_slash: bool) -> String {
    let mut out = String::with_capacity(input.len());
    for b in input.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            b'/' if keep_slash => out.push('/'),
            _ => {
                out.push('%');
                out.push_str(&format!("{b:02X}"));
            }
        }
    }
    out
}
