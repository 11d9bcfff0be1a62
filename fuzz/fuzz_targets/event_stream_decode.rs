#![no_main]

use iam_mcp::{EventStreamDecoder, JsonRpcMessage, parse_event_line};
use libfuzzer_sys::fuzz_target;

// First byte picks the chunk size; decoding must not depend on it.
fuzz_target!(|data: &[u8]| {
    let Some((&step, body)) = data.split_first() else {
        return;
    };
    let step = usize::from(step).max(1);

    let mut whole = Vec::new();
    let mut d = EventStreamDecoder::new(usize::MAX);
    let _ = d.feed(body, |m| whole.push(m));
    let whole_tail = d.finish();

    let mut chunked: Vec<JsonRpcMessage> = Vec::new();
    let mut d = EventStreamDecoder::new(usize::MAX);
    for c in body.chunks(step) {
        let _ = d.feed(c, |m| chunked.push(m));
    }
    assert_eq!(d.finish(), whole_tail);
    assert_eq!(whole, chunked);

    for line in body.split(|b| *b == b'\n') {
        let _ = parse_event_line(line);
    }
    let _ = serde_json::from_slice::<JsonRpcMessage>(body);
});
