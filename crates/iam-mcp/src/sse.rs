use bytes::BytesMut;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{LineTooLong, MessageDecodeError};
use crate::jsonrpc::JsonRpcMessage;

/// Only lines starting with exactly this prefix carry messages.
pub const DATA_PREFIX: &str = "data: ";

/// Default bound on a single buffered (not yet newline-terminated) line.
pub const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;

/// Incremental decoder for MCP streamable HTTP event streams.
///
/// Bytes are buffered until a `\n` arrives. Each complete line starting with
/// `data: ` is parsed as one JSON document (an array yields each element);
/// every other line (event names, comments, blank separators) is ignored.
/// Splitting on the newline byte keeps multi-byte UTF-8 sequences intact across
/// chunk boundaries, since `\n` never occurs inside one.
#[derive(Debug)]
pub struct EventStreamDecoder {
    buf: BytesMut,
    // Bytes of `buf` already known to contain no newline.
    scanned: usize,
    max_line_bytes: usize,
}

impl Default for EventStreamDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_BYTES)
    }
}

impl EventStreamDecoder {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            scanned: 0,
            max_line_bytes,
        }
    }

    /// Feed one chunk, invoking `on_message` for each decoded message in arrival order.
    ///
    /// Undecodable `data:` lines are logged and skipped. Fails only when the
    /// incomplete tail grows past the configured line limit.
    pub fn feed(
        &mut self,
        chunk: &[u8],
        mut on_message: impl FnMut(JsonRpcMessage),
    ) -> Result<(), LineTooLong> {
        self.buf.extend_from_slice(chunk);

        let mut from = self.scanned;
        while let Some(off) = self.buf[from..].iter().position(|b| *b == b'\n') {
            let line = self.buf.split_to(from + off + 1);
            match parse_event_line(&line[..line.len() - 1]) {
                Ok(msgs) => msgs.into_iter().for_each(&mut on_message),
                Err(e) => {
                    warn!(error = %e.source, data = %e.data, "dropping undecodable event data");
                }
            }
            from = 0;
        }
        self.scanned = self.buf.len();

        if self.buf.len() > self.max_line_bytes {
            return Err(LineTooLong {
                limit: self.max_line_bytes,
            });
        }
        Ok(())
    }

    /// Bytes currently held back waiting for a newline.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// End of stream. Any incomplete final line is discarded; returns its length.
    pub fn finish(self) -> usize {
        let leftover = self.buf.len();
        if leftover > 0 {
            debug!(bytes = leftover, "discarding unterminated trailing line");
        }
        leftover
    }
}

/// Decode one complete line (without its `\n`).
///
/// Empty for lines that carry no message.
pub fn parse_event_line(line: &[u8]) -> Result<Vec<JsonRpcMessage>, MessageDecodeError> {
    let text = String::from_utf8_lossy(line);
    let text = text.strip_suffix('\r').unwrap_or(&text);
    let Some(payload) = text.strip_prefix(DATA_PREFIX) else {
        return Ok(Vec::new());
    };
    let document: Value = serde_json::from_str(payload).map_err(|source| MessageDecodeError {
        source,
        data: payload.chars().take(256).collect(),
    })?;
    Ok(JsonRpcMessage::from_document(document))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jsonrpc::JsonRpcId;

    fn ids_and_results(msgs: &[JsonRpcMessage]) -> Vec<(JsonRpcId, serde_json::Value)> {
        msgs.iter()
            .filter_map(|m| match m {
                JsonRpcMessage::Response(r) => Some((r.id.clone(), r.result.clone()?)),
                _ => None,
            })
            .collect()
    }

    fn decode_chunks(chunks: &[&[u8]]) -> anyhow::Result<Vec<JsonRpcMessage>> {
        let mut d = EventStreamDecoder::default();
        let mut out = Vec::new();
        for c in chunks {
            d.feed(c, |m| out.push(m))?;
        }
        d.finish();
        Ok(out)
    }

    fn decode_lines(lines: &[&str]) -> anyhow::Result<Vec<JsonRpcMessage>> {
        let chunks: Vec<&[u8]> = lines.iter().map(|l| l.as_bytes()).collect();
        decode_chunks(&chunks)
    }

    #[test]
    fn message_split_across_two_chunks() -> anyhow::Result<()> {
        let first: &[u8] = b"data: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":5}\n\ndata: {\"jsonrpc\":\"2.0\",\"id\":2,\"resu";
        let second: &[u8] = b"lt\":6}\n\n";

        let mut d = EventStreamDecoder::default();
        let mut out = Vec::new();
        d.feed(first, |m| out.push(m))?;
        assert_eq!(out.len(), 1);
        d.feed(second, |m| out.push(m))?;

        assert_eq!(
            ids_and_results(&out),
            vec![
                (JsonRpcId::Number(1), serde_json::json!(5)),
                (JsonRpcId::Number(2), serde_json::json!(6)),
            ]
        );
        assert_eq!(d.finish(), 0);
        Ok(())
    }

    #[test]
    fn every_split_point_yields_the_same_messages() -> anyhow::Result<()> {
        // Multi-byte characters so some splits land inside a UTF-8 sequence.
        let stream = "event: message\n\
                      data: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":\"héllo ✓\"}\n\n\
                      : keep-alive\n\
                      data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/message\",\"params\":{\"t\":\"日本\"}}\r\n\r\n\
                      data: {\"jsonrpc\":\"2.0\",\"id\":2,\"result\":{\"emoji\":\"🦀\"}}\n\n"
            .as_bytes();

        let whole = decode_chunks(&[stream])?;
        assert_eq!(whole.len(), 3);

        for i in 0..=stream.len() {
            let (a, b) = stream.split_at(i);
            assert_eq!(decode_chunks(&[a, b])?, whole, "split at {i}");
        }

        let bytewise: Vec<&[u8]> = stream.chunks(1).collect();
        assert_eq!(decode_chunks(&bytewise)?, whole);
        for size in [2, 3, 7, 13] {
            let chunks: Vec<&[u8]> = stream.chunks(size).collect();
            assert_eq!(decode_chunks(&chunks)?, whole, "chunk size {size}");
        }
        Ok(())
    }

    #[test]
    fn invalid_json_is_skipped_and_stream_continues() -> anyhow::Result<()> {
        let out = decode_lines(&[
            "data: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":1}\n",
            "data: {not json}\n",
            "data: \n",
            "data: {\"jsonrpc\":\"2.0\",\"id\":2,\"result\":2}\n",
        ])?;
        assert_eq!(out.len(), 2, "{out:?}");
        assert_eq!(
            ids_and_results(&out),
            vec![
                (JsonRpcId::Number(1), serde_json::json!(1)),
                (JsonRpcId::Number(2), serde_json::json!(2)),
            ]
        );
        Ok(())
    }

    #[test]
    fn any_json_payload_is_delivered() -> anyhow::Result<()> {
        let out = decode_lines(&[
            "data: {\"jsonrpc\":\"2.0\",\"id\":null,\"error\":{\"code\":-32700,\"message\":\"Parse error\"}}\n",
            "data: [{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":1},{\"jsonrpc\":\"2.0\",\"id\":2,\"result\":2}]\n",
            "data: {\"hello\":\"world\"}\n",
        ])?;
        assert_eq!(out.len(), 4, "{out:?}");

        let JsonRpcMessage::Response(r) = &out[0] else {
            anyhow::bail!("expected response, got {:?}", out[0]);
        };
        assert_eq!(r.id, JsonRpcId::Null);
        assert_eq!(r.error.as_ref().map(|e| e.code), Some(-32700));

        assert_eq!(
            ids_and_results(&out[1..3]),
            vec![
                (JsonRpcId::Number(1), serde_json::json!(1)),
                (JsonRpcId::Number(2), serde_json::json!(2)),
            ]
        );
        assert_eq!(
            out[3],
            JsonRpcMessage::Other(serde_json::json!({"hello": "world"}))
        );
        Ok(())
    }

    #[test]
    fn non_data_lines_produce_nothing() -> anyhow::Result<()> {
        let out = decode_lines(&[
            "event: ping\n",
            "\n",
            ": comment\n",
            "id: 7\n",
            "retry: 1000\n",
            "data:{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":1}\n",
            " data: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":1}\n",
        ])?;
        assert!(out.is_empty(), "{out:?}");
        Ok(())
    }

    #[test]
    fn buffer_keeps_only_the_unterminated_tail() -> anyhow::Result<()> {
        let mut d = EventStreamDecoder::default();
        let mut n = 0;
        d.feed(b"event: a\ndata: {\"jsonrpc\":\"2.0\",\"id\":1,\"res", |_| n += 1)?;
        assert_eq!(d.buffered_len(), "data: {\"jsonrpc\":\"2.0\",\"id\":1,\"res".len());
        d.feed(b"ult\":1}\n", |_| n += 1)?;
        assert_eq!(d.buffered_len(), 0);
        assert_eq!(n, 1);
        Ok(())
    }

    #[test]
    fn trailing_line_without_newline_is_discarded() -> anyhow::Result<()> {
        let mut d = EventStreamDecoder::default();
        let mut out = Vec::new();
        let tail = b"data: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":1}";
        d.feed(tail, |m| out.push(m))?;
        assert!(out.is_empty());
        assert_eq!(d.finish(), tail.len());
        Ok(())
    }

    #[test]
    fn overlong_line_is_rejected() {
        let mut d = EventStreamDecoder::new(16);
        let mut n = 0;
        assert!(d.feed(b"data: 0123456789", |_| n += 1).is_ok());
        let err = d.feed(b"abc", |_| n += 1).unwrap_err();
        assert_eq!(err.limit, 16);

        // Complete lines are not held back, so they never count against the limit.
        let mut d = EventStreamDecoder::new(16);
        let result = "x".repeat(64);
        let long = format!(
            "data: {}\n",
            serde_json::json!({"jsonrpc": "2.0", "id": 1, "result": result})
        );
        assert!(d.feed(long.as_bytes(), |_| n += 1).is_ok());
        assert_eq!(n, 1);
    }

    #[test]
    fn parse_event_line_reports_decode_errors() {
        assert!(matches!(parse_event_line(b"event: ping"), Ok(v) if v.is_empty()));
        let err = parse_event_line(b"data: [1,").unwrap_err();
        assert_eq!(err.data, "[1,");
        assert!(matches!(
            parse_event_line(b"data: {\"jsonrpc\":\"2.0\",\"method\":\"x\"}\r").as_deref(),
            Ok([JsonRpcMessage::Notification(_)])
        ));
    }
}
