//! Incremental JSON object assembly over a token stream.
//!
//! The dynamic-analysis step asks the model for one JSON object and wants
//! to surface it *as it grows* — each time the accumulated text parses
//! (after speculative completion of the open brackets), a `Partial`
//! snapshot is produced; the `Final` value is the strict parse of the
//! finished output.

use futures_util::StreamExt;
use serde_json::Value;

use vs_domain::stream::BoxStream;
use vs_domain::{Error, Result};

use crate::traits::{StreamEvent, TokenStream};

/// Events from an object-mode generation.
#[derive(Debug, Clone)]
pub enum ObjectStreamEvent {
    /// A speculative snapshot of the object so far.
    Partial(Value),
    /// The finished, strictly-parsed object.
    Final(Value),
}

/// Assemble a token stream into partial/final object events.
///
/// Malformed intermediate states yield no snapshot (the next token may
/// repair them); a final output that cannot be parsed is a fatal error.
pub fn objects_from_tokens(tokens: TokenStream) -> BoxStream<'static, Result<ObjectStreamEvent>> {
    Box::pin(async_stream::stream! {
        let mut tokens = tokens;
        let mut buffer = String::new();
        let mut last: Option<Value> = None;

        while let Some(item) = tokens.next().await {
            match item {
                Ok(StreamEvent::Token { text }) => {
                    buffer.push_str(&text);
                    if let Some(snapshot) = complete_partial_json(&buffer) {
                        if last.as_ref() != Some(&snapshot) {
                            last = Some(snapshot.clone());
                            yield Ok(ObjectStreamEvent::Partial(snapshot));
                        }
                    }
                }
                Ok(StreamEvent::Done { .. }) => {
                    yield extract_json(&buffer).map(ObjectStreamEvent::Final);
                    return;
                }
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }

        // Provider stream ended without a Done marker.
        yield extract_json(&buffer).map(ObjectStreamEvent::Final);
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Strictly parse a finished model output, tolerating markdown fences and
/// prose around the object.
pub fn extract_json(raw: &str) -> Result<Value> {
    let trimmed = strip_fences(raw);
    let start = trimmed
        .find('{')
        .ok_or_else(|| Error::Fatal("model output contains no JSON object".into()))?;
    let end = trimmed
        .rfind('}')
        .filter(|&end| end > start)
        .ok_or_else(|| Error::Fatal("model output contains no closed JSON object".into()))?;
    serde_json::from_str(&trimmed[start..=end])
        .map_err(|e| Error::Fatal(format!("model output is not valid JSON: {e}")))
}

fn strip_fences(raw: &str) -> &str {
    let mut s = raw.trim();
    for prefix in ["```json", "```"] {
        if let Some(rest) = s.strip_prefix(prefix) {
            s = rest;
            break;
        }
    }
    s.strip_suffix("```").unwrap_or(s).trim()
}

/// Speculatively complete a JSON prefix: close the open string, drop a
/// dangling comma, supply `null` after a dangling colon, then close every
/// open bracket. Returns the parsed value only when the completion is
/// valid JSON.
pub fn complete_partial_json(raw: &str) -> Option<Value> {
    let trimmed = strip_fences(raw);
    let start = trimmed.find('{')?;
    let fragment = &trimmed[start..];

    let mut completed = String::with_capacity(fragment.len() + 8);
    let mut closers: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in fragment.chars() {
        completed.push(c);
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => closers.push('}'),
            '[' => closers.push(']'),
            '}' | ']' => {
                closers.pop();
            }
            _ => {}
        }
    }

    if escaped {
        // A trailing lone backslash would escape our closing quote.
        completed.pop();
    }
    if in_string {
        completed.push('"');
    }

    let mut trimmed_end = completed.trim_end().to_owned();
    if trimmed_end.ends_with(',') {
        trimmed_end.pop();
    } else if trimmed_end.ends_with(':') {
        trimmed_end.push_str("null");
    }

    for closer in closers.iter().rev() {
        trimmed_end.push(*closer);
    }

    serde_json::from_str(&trimmed_end).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ── complete_partial_json ──────────────────────────────────────

    #[test]
    fn completes_open_object_and_string() {
        let v = complete_partial_json(r#"{"reasoning": "the video is"#).unwrap();
        assert_eq!(v, json!({"reasoning": "the video is"}));
    }

    #[test]
    fn completes_nested_arrays() {
        let v = complete_partial_json(r#"{"schema": [{"key": "points"#).unwrap();
        assert_eq!(v, json!({"schema": [{"key": "points"}]}));
    }

    #[test]
    fn dangling_comma_is_dropped() {
        let v = complete_partial_json(r#"{"a": 1,"#).unwrap();
        assert_eq!(v, json!({"a": 1}));
    }

    #[test]
    fn dangling_colon_becomes_null() {
        let v = complete_partial_json(r#"{"a":"#).unwrap();
        assert_eq!(v, json!({"a": null}));
    }

    #[test]
    fn partial_key_yields_no_snapshot() {
        // `{"reaso"}` would be a key with no value.
        assert!(complete_partial_json(r#"{"reaso"#).is_none());
    }

    #[test]
    fn escaped_quotes_inside_strings() {
        let v = complete_partial_json(r#"{"text": "a \"quoted\" wor"#).unwrap();
        assert_eq!(v, json!({"text": "a \"quoted\" wor"}));
    }

    #[test]
    fn trailing_backslash_does_not_break_closure() {
        let v = complete_partial_json(r#"{"text": "line\"#).unwrap();
        assert_eq!(v, json!({"text": "line"}));
    }

    #[test]
    fn complete_object_passes_through() {
        let v = complete_partial_json(r#"{"done": true}"#).unwrap();
        assert_eq!(v, json!({"done": true}));
    }

    #[test]
    fn no_object_start_is_none() {
        assert!(complete_partial_json("thinking about it").is_none());
    }

    // ── extract_json ───────────────────────────────────────────────

    #[test]
    fn extracts_plain_object() {
        let v = extract_json(r#"{"a": 1}"#).unwrap();
        assert_eq!(v["a"], 1);
    }

    #[test]
    fn extracts_from_markdown_fences() {
        let v = extract_json("```json\n{\"a\": 1}\n```").unwrap();
        assert_eq!(v["a"], 1);
    }

    #[test]
    fn extracts_object_surrounded_by_prose() {
        let v = extract_json("Here is the result: {\"a\": 1} hope it helps").unwrap();
        assert_eq!(v["a"], 1);
    }

    #[test]
    fn unclosed_object_is_fatal() {
        let err = extract_json(r#"{"a": 1"#).unwrap_err();
        assert!(!err.is_retriable());
    }

    #[test]
    fn empty_output_is_fatal() {
        assert!(extract_json("").is_err());
    }

    // ── objects_from_tokens ────────────────────────────────────────

    fn token_stream(parts: Vec<&str>) -> TokenStream {
        let events: Vec<Result<StreamEvent>> = parts
            .into_iter()
            .map(|text| {
                Ok(StreamEvent::Token {
                    text: text.to_owned(),
                })
            })
            .chain(std::iter::once(Ok(StreamEvent::Done {
                usage: None,
                finish_reason: Some("stop".into()),
            })))
            .collect();
        Box::pin(futures_util::stream::iter(events))
    }

    #[tokio::test]
    async fn partials_grow_then_final_matches() {
        let stream = objects_from_tokens(token_stream(vec![
            r#"{"reasoning": "#,
            r#""a lec"#,
            r#"ture", "tldr": "short"#,
            r#""}"#,
        ]));
        let events: Vec<_> = stream.collect().await;

        let partials: Vec<&Value> = events
            .iter()
            .filter_map(|e| match e {
                Ok(ObjectStreamEvent::Partial(v)) => Some(v),
                _ => None,
            })
            .collect();
        assert!(!partials.is_empty());
        // Snapshots only ever refine forward.
        assert_eq!(partials.last().unwrap()["tldr"], "short");

        match events.last().unwrap() {
            Ok(ObjectStreamEvent::Final(v)) => {
                assert_eq!(v["reasoning"], "a lecture");
                assert_eq!(v["tldr"], "short");
            }
            other => panic!("expected final, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_snapshots_are_suppressed() {
        // Whitespace tokens do not change the parsed snapshot.
        let stream = objects_from_tokens(token_stream(vec![r#"{"a": 1"#, " ", " ", "}"]));
        let events: Vec<_> = stream.collect().await;
        let partials = events
            .iter()
            .filter(|e| matches!(e, Ok(ObjectStreamEvent::Partial(_))))
            .count();
        assert_eq!(partials, 1);
    }

    #[tokio::test]
    async fn garbage_final_output_errors() {
        let stream = objects_from_tokens(token_stream(vec!["no json here"]));
        let events: Vec<_> = stream.collect().await;
        assert!(events.last().unwrap().is_err());
    }

    #[tokio::test]
    async fn provider_error_propagates() {
        let events: Vec<Result<StreamEvent>> = vec![
            Ok(StreamEvent::Token { text: "{".into() }),
            Err(Error::Transient("connection reset".into())),
        ];
        let stream = objects_from_tokens(Box::pin(futures_util::stream::iter(events)));
        let out: Vec<_> = stream.collect().await;
        assert!(out.last().unwrap().is_err());
    }
}
