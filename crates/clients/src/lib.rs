//! External service clients.
//!
//! Each dependency is a trait so workflows can be exercised against mocks:
//! [`TranscriptSource`] (transcript API), [`SlideExtractor`] (trigger +
//! SSE job monitor), [`ObjectStore`] (manifest/frame downloads), and
//! [`BlobStore`] (public image uploads). The `Http*` implementations share
//! one retry discipline: transient failures (network, 5xx) back off
//! exponentially; 4xx responses are permanent and fatal.

pub mod extractor;
pub mod storage;
pub mod transcript;

pub use extractor::{HttpSlideExtractor, JobStatus, JobUpdate, SlideExtractor, SlideManifest};
pub use storage::{BlobStore, HttpBlobStore, HttpObjectStore, ObjectStore};
pub use transcript::{HttpTranscriptSource, TranscriptSource};

use std::time::Duration;

use vs_domain::{Error, Result};

/// Execute a request with retry + exponential backoff on transient
/// failures.
///
/// * Retries network errors and 5xx responses, sleeping `100ms * 2^n`.
/// * 4xx responses are permanent: mapped to [`Error::Fatal`] carrying the
///   status and body, never retried.
pub(crate) async fn execute_with_retry(
    endpoint: &str,
    max_retries: u32,
    build_request: impl Fn() -> reqwest::RequestBuilder,
) -> Result<reqwest::Response> {
    let mut last_err = Error::Transient(format!("{endpoint}: no attempt made"));

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let backoff = Duration::from_millis(100 * 2u64.pow(attempt - 1));
            tokio::time::sleep(backoff).await;
        }

        match build_request().send().await {
            Ok(resp) => {
                let status = resp.status();
                if status.is_server_error() {
                    let body = resp.text().await.unwrap_or_default();
                    last_err =
                        Error::Transient(format!("{endpoint} returned HTTP {status}: {body}"));
                    tracing::warn!(endpoint, %status, attempt, "transient upstream error");
                    continue;
                }
                if status.is_client_error() {
                    let body = resp.text().await.unwrap_or_default();
                    return Err(Error::Fatal(format!(
                        "{endpoint} returned HTTP {status}: {body}"
                    )));
                }
                return Ok(resp);
            }
            Err(e) => {
                last_err = Error::Transient(format!("{endpoint} request failed: {e}"));
                tracing::warn!(endpoint, attempt, error = %e, "request failed");
            }
        }
    }

    Err(last_err)
}

/// Join a base URL and a path, tolerating either side's slashes.
pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_url_normalizes_slashes() {
        assert_eq!(join_url("https://a.example/", "/b/c"), "https://a.example/b/c");
        assert_eq!(join_url("https://a.example", "b/c"), "https://a.example/b/c");
    }
}
