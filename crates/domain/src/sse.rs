//! Incremental `text/event-stream` decoding.
//!
//! Both streaming dependencies speak SSE: the LLM endpoint emits delta
//! chunks, the slide extractor emits job updates. [`SseDecoder`] is fed
//! raw body chunks as they arrive and yields one payload per finished
//! event. Field handling follows the event-stream grammar: an event ends
//! at a blank line, multiple `data` lines accumulate and join with a
//! newline, a single space after the colon is stripped, `:` comment lines
//! and non-`data` fields are ignored, and CRLF endings are accepted.

/// Streaming SSE decoder. Keeps the unfinished line and the in-progress
/// event's data across `feed` calls, so chunk boundaries can fall
/// anywhere.
#[derive(Debug, Default)]
pub struct SseDecoder {
    line: String,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one body chunk, returning the payload of every event the
    /// chunk completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut finished = Vec::new();
        for c in String::from_utf8_lossy(chunk).chars() {
            if c != '\n' {
                self.line.push(c);
                continue;
            }
            let line = std::mem::take(&mut self.line);
            if let Some(payload) = self.end_line(&line) {
                finished.push(payload);
            }
        }
        finished
    }

    /// Flush a trailing event that the stream closed without terminating.
    pub fn finish(&mut self) -> Option<String> {
        if !self.line.is_empty() {
            let line = std::mem::take(&mut self.line);
            self.end_line(&line);
        }
        self.take_event()
    }

    fn end_line(&mut self, line: &str) -> Option<String> {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if line.is_empty() {
            return self.take_event();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        if field == "data" {
            self.data.push(value.to_owned());
        }
        None
    }

    fn take_event(&mut self) -> Option<String> {
        if self.data.is_empty() {
            return None;
        }
        let payload = self.data.join("\n");
        self.data.clear();
        // Events whose data lines were all empty carry nothing.
        if payload.trim().is_empty() {
            None
        } else {
            Some(payload)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_event_per_blank_line() {
        let mut decoder = SseDecoder::new();
        let payloads = decoder.feed(b"data: {\"status\":\"extracting\"}\n\n");
        assert_eq!(payloads, vec!["{\"status\":\"extracting\"}"]);
    }

    #[test]
    fn chunk_boundaries_may_split_lines_and_events() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"da").is_empty());
        assert!(decoder.feed(b"ta: first ha").is_empty());
        assert!(decoder.feed(b"lf\n").is_empty());
        assert_eq!(decoder.feed(b"\ndata: second\n\n"), vec!["first half", "second"]);
    }

    #[test]
    fn multiple_data_lines_join_with_newline() {
        let mut decoder = SseDecoder::new();
        let payloads = decoder.feed(b"data: line one\ndata: line two\n\n");
        assert_eq!(payloads, vec!["line one\nline two"]);
    }

    #[test]
    fn crlf_endings_are_accepted() {
        let mut decoder = SseDecoder::new();
        let payloads = decoder.feed(b"data: payload\r\n\r\n");
        assert_eq!(payloads, vec!["payload"]);
    }

    #[test]
    fn comments_and_other_fields_are_ignored() {
        let mut decoder = SseDecoder::new();
        let payloads = decoder.feed(b": keepalive\nevent: update\nid: 9\ndata: kept\nretry: 500\n\n");
        assert_eq!(payloads, vec!["kept"]);
    }

    #[test]
    fn colon_without_space_keeps_full_value() {
        let mut decoder = SseDecoder::new();
        let payloads = decoder.feed(b"data:tight\n\n");
        assert_eq!(payloads, vec!["tight"]);
    }

    #[test]
    fn only_one_leading_space_is_stripped() {
        let mut decoder = SseDecoder::new();
        let payloads = decoder.feed(b"data:  spaced\n\n");
        assert_eq!(payloads, vec![" spaced"]);
    }

    #[test]
    fn blank_lines_without_data_yield_nothing() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"\n\n: ping\n\n").is_empty());
    }

    #[test]
    fn empty_data_events_are_dropped() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"data:\n\ndata:   \n\n").is_empty());
    }

    #[test]
    fn finish_flushes_an_unterminated_event() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"data: tail without blank line").is_empty());
        assert_eq!(decoder.finish().as_deref(), Some("tail without blank line"));
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn finish_on_clean_stream_is_none() {
        let mut decoder = SseDecoder::new();
        decoder.feed(b"data: done\n\n");
        assert!(decoder.finish().is_none());
    }
}
