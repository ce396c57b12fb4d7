//! OpenAI-compatible adapter.
//!
//! Works with OpenAI, Azure-style gateways, Ollama, vLLM, and any other
//! endpoint following the chat completions contract. Streaming responses
//! are SSE; each `data:` payload is a delta chunk, terminated by the
//! `[DONE]` sentinel.

use futures_util::StreamExt;

use vs_domain::config::LlmConfig;
use vs_domain::sse::SseDecoder;
use vs_domain::{Error, Result};

use crate::traits::{GenerateRequest, LanguageModel, StreamEvent, TokenStream, Usage};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct OpenAiCompatModel {
    id: String,
    base_url: String,
    api_key: String,
    default_model: String,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    client: reqwest::Client,
}

impl OpenAiCompatModel {
    pub fn new(cfg: &LlmConfig, api_key: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(cfg.timeout_ms))
            .build()
            .map_err(|e| Error::Provider {
                provider: "openai".into(),
                message: e.to_string(),
            })?;

        Ok(Self {
            id: "openai".into(),
            base_url: cfg.base_url.trim_end_matches('/').to_owned(),
            api_key,
            default_model: cfg.model.clone(),
            temperature: cfg.temperature,
            max_tokens: cfg.max_tokens,
            client,
        })
    }

    fn build_body(&self, req: &GenerateRequest) -> serde_json::Value {
        let mut messages = Vec::new();
        if let Some(system) = &req.system {
            messages.push(serde_json::json!({"role": "system", "content": system}));
        }

        // A prompt with an attached image becomes a multi-part user
        // message; a plain prompt stays a string.
        let user_content = match &req.image_url {
            Some(url) => serde_json::json!([
                {"type": "text", "text": req.prompt},
                {"type": "image_url", "image_url": {"url": url}},
            ]),
            None => serde_json::Value::String(req.prompt.clone()),
        };
        messages.push(serde_json::json!({"role": "user", "content": user_content}));

        let mut body = serde_json::json!({
            "model": req.model.clone().unwrap_or_else(|| self.default_model.clone()),
            "messages": messages,
            "stream": true,
            "stream_options": {"include_usage": true},
        });
        if let Some(t) = req.temperature.or(self.temperature) {
            body["temperature"] = serde_json::json!(t);
        }
        if let Some(m) = req.max_tokens.or(self.max_tokens) {
            body["max_tokens"] = serde_json::json!(m);
        }
        if req.json_mode {
            body["response_format"] = serde_json::json!({"type": "json_object"});
        }
        body
    }
}

#[async_trait::async_trait]
impl LanguageModel for OpenAiCompatModel {
    async fn stream_text(&self, req: GenerateRequest) -> Result<TokenStream> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_body(&req);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Transient(format!("LLM request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = format!("LLM endpoint returned {status}: {text}");
            return Err(if status.is_client_error() {
                Error::Fatal(message)
            } else {
                Error::Transient(message)
            });
        }

        let stream = async_stream::stream! {
            let mut body = response.bytes_stream();
            let mut decoder = SseDecoder::new();
            let mut done = false;

            while let Some(chunk) = body.next().await {
                match chunk {
                    Ok(bytes) => {
                        for payload in decoder.feed(&bytes) {
                            for event in parse_stream_payload(&payload) {
                                if matches!(event, Ok(StreamEvent::Done { .. })) {
                                    done = true;
                                }
                                yield event;
                            }
                        }
                    }
                    Err(e) => {
                        yield Err(Error::Transient(format!("LLM stream error: {e}")));
                        return;
                    }
                }
            }

            // Flush a trailing unterminated event, then guarantee a Done.
            if let Some(payload) = decoder.finish() {
                for event in parse_stream_payload(&payload) {
                    if matches!(event, Ok(StreamEvent::Done { .. })) {
                        done = true;
                    }
                    yield event;
                }
            }
            if !done {
                yield Ok(StreamEvent::Done { usage: None, finish_reason: Some("stop".into()) });
            }
        };

        Ok(Box::pin(stream))
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Payload parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Parse one SSE `data:` payload into zero or more stream events.
fn parse_stream_payload(data: &str) -> Vec<Result<StreamEvent>> {
    if data == "[DONE]" {
        return vec![Ok(StreamEvent::Done {
            usage: None,
            finish_reason: None,
        })];
    }

    let value: serde_json::Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            return vec![Err(Error::Transient(format!(
                "malformed LLM stream chunk: {e}"
            )))]
        }
    };

    let mut events = Vec::new();

    if let Some(choice) = value["choices"].get(0) {
        if let Some(text) = choice["delta"]["content"].as_str() {
            if !text.is_empty() {
                events.push(Ok(StreamEvent::Token {
                    text: text.to_owned(),
                }));
            }
        }
        if let Some(reason) = choice["finish_reason"].as_str() {
            events.push(Ok(StreamEvent::Done {
                usage: parse_usage(&value),
                finish_reason: Some(reason.to_owned()),
            }));
        }
    } else if value.get("usage").is_some() {
        // Usage-only trailer chunk (stream_options.include_usage).
        events.push(Ok(StreamEvent::Done {
            usage: parse_usage(&value),
            finish_reason: None,
        }));
    }

    events
}

fn parse_usage(value: &serde_json::Value) -> Option<Usage> {
    let usage = value.get("usage")?;
    Some(Usage {
        prompt_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
        completion_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
        total_tokens: usage["total_tokens"].as_u64().unwrap_or(0) as u32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_token_delta() {
        let events = parse_stream_payload(
            r#"{"choices":[{"delta":{"content":"hello"},"index":0}]}"#,
        );
        assert_eq!(events.len(), 1);
        match events[0].as_ref().unwrap() {
            StreamEvent::Token { text } => assert_eq!(text, "hello"),
            other => panic!("expected token, got {other:?}"),
        }
    }

    #[test]
    fn skips_empty_delta() {
        let events =
            parse_stream_payload(r#"{"choices":[{"delta":{"content":""},"index":0}]}"#);
        assert!(events.is_empty());
    }

    #[test]
    fn finish_reason_yields_done() {
        let events = parse_stream_payload(
            r#"{"choices":[{"delta":{},"finish_reason":"stop"}],"usage":{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}}"#,
        );
        match events[0].as_ref().unwrap() {
            StreamEvent::Done {
                usage,
                finish_reason,
            } => {
                assert_eq!(finish_reason.as_deref(), Some("stop"));
                assert_eq!(usage.as_ref().unwrap().total_tokens, 15);
            }
            other => panic!("expected done, got {other:?}"),
        }
    }

    #[test]
    fn done_sentinel() {
        let events = parse_stream_payload("[DONE]");
        assert!(matches!(
            events[0].as_ref().unwrap(),
            StreamEvent::Done { .. }
        ));
    }

    #[test]
    fn usage_only_trailer_chunk() {
        let events = parse_stream_payload(
            r#"{"choices":[],"usage":{"prompt_tokens":1,"completion_tokens":2,"total_tokens":3}}"#,
        );
        match events[0].as_ref().unwrap() {
            StreamEvent::Done { usage, .. } => {
                assert_eq!(usage.as_ref().unwrap().completion_tokens, 2);
            }
            other => panic!("expected done, got {other:?}"),
        }
    }

    #[test]
    fn malformed_chunk_is_an_error() {
        let events = parse_stream_payload("{not json");
        assert!(events[0].is_err());
    }

    #[test]
    fn body_includes_image_parts_only_with_image() {
        let cfg = LlmConfig::default();
        let model = OpenAiCompatModel::new(&cfg, "key".into()).unwrap();

        let plain = model.build_body(&GenerateRequest {
            prompt: "describe".into(),
            ..Default::default()
        });
        assert!(plain["messages"][0]["content"].is_string());

        let vision = model.build_body(&GenerateRequest {
            prompt: "describe".into(),
            image_url: Some("https://img.example/s.webp".into()),
            ..Default::default()
        });
        let content = &vision["messages"][0]["content"];
        assert!(content.is_array());
        assert_eq!(content[1]["image_url"]["url"], "https://img.example/s.webp");
    }

    #[test]
    fn body_carries_json_mode_and_system() {
        let cfg = LlmConfig::default();
        let model = OpenAiCompatModel::new(&cfg, "key".into()).unwrap();
        let body = model.build_body(&GenerateRequest {
            system: Some("you analyze videos".into()),
            prompt: "go".into(),
            json_mode: true,
            ..Default::default()
        });
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["response_format"]["type"], "json_object");
        assert_eq!(body["stream"], true);
    }
}
