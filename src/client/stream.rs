/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/client/stream.rs
*
* Line-delimited JSON decoding over a chunked HTTP byte stream (C2, spec
* §4.2). Kubernetes watch responses are one JSON object per line; a single
* line (a big Secret, say) can run to several megabytes, so chunks must be
* accumulated into a growing buffer and only split on newlines actually
* present in it — never assume one chunk is one line.
*
* SPDX-License-Identifier: Apache-2.0
*/

use bytes::{Buf, Bytes, BytesMut};
use serde_json::Value;

/// Accumulates raw byte chunks and yields complete JSON-line values as they
/// become available. Owns no I/O itself: callers feed it chunks from
/// whatever transport they're using (here, a `reqwest` streamed body).
#[derive(Default)]
pub struct JsonLineDecoder {
    buffer: BytesMut,
}

impl JsonLineDecoder {
    pub fn new() -> Self {
        JsonLineDecoder::default()
    }

    /// Feeds one chunk in and returns every complete line it can now
    /// produce, in order. An incomplete trailing fragment stays buffered
    /// for the next call.
    pub fn feed(&mut self, chunk: Bytes) -> Vec<Result<Value, serde_json::Error>> {
        self.buffer.extend_from_slice(&chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line = self.buffer.split_to(pos);
            self.buffer.advance(1); // drop the newline itself
            if line.is_empty() {
                continue;
            }
            out.push(serde_json::from_slice::<Value>(&line));
        }
        out
    }

    /// Call once the stream has ended: a final line without a trailing
    /// newline is still valid JSON and should be emitted.
    pub fn finish(mut self) -> Option<Result<Value, serde_json::Error>> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(serde_json::from_slice::<Value>(&self.buffer))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_one_line_per_chunk() {
        let mut decoder = JsonLineDecoder::new();
        let lines = decoder.feed(Bytes::from("{\"a\":1}\n{\"a\":2}\n"));
        assert_eq!(lines.len(), 2);
        assert!(lines[0].as_ref().unwrap().get("a").unwrap() == 1);
    }

    #[test]
    fn handles_a_line_split_across_chunks() {
        let mut decoder = JsonLineDecoder::new();
        assert!(decoder.feed(Bytes::from("{\"a\":")).is_empty());
        let lines = decoder.feed(Bytes::from("1}\n"));
        assert_eq!(lines.len(), 1);
    }

    #[test]
    fn finish_emits_trailing_line_without_newline() {
        let mut decoder = JsonLineDecoder::new();
        assert!(decoder.feed(Bytes::from("{\"a\":1}")).is_empty());
        let tail = decoder.finish();
        assert!(tail.is_some());
    }

    #[test]
    fn skips_blank_lines() {
        let mut decoder = JsonLineDecoder::new();
        let lines = decoder.feed(Bytes::from("\n{\"a\":1}\n\n"));
        assert_eq!(lines.len(), 1);
    }
}
