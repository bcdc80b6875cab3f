//! HTTP plumbing shared by the REST engines.

use std::time::Duration;

use reqwest::{Client, RequestBuilder, StatusCode};

use lrs_core::status::Probe;
use lrs_core::{BackendError, BackendResult};

/// Build a client with a request timeout.
pub(crate) fn client(engine: &str, timeout_secs: u64) -> BackendResult<Client> {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs.max(1)))
        .build()
        .map_err(|e| BackendError::engine(format!("{engine}: failed to build HTTP client: {e}")))
}

/// Map a transport failure.
pub(crate) fn transport_error(engine: &str, err: &reqwest::Error) -> BackendError {
    if err.is_connect() || err.is_timeout() {
        BackendError::connection(format!("{engine}: {err}"))
    } else {
        BackendError::engine(format!("{engine}: {err}"))
    }
}

/// A response the engine answered with.
#[derive(Debug)]
pub(crate) struct Answer {
    pub status: StatusCode,
    pub body: String,
}

impl Answer {
    /// Body of a 2xx answer, or the engine's message verbatim.
    pub fn into_success(self) -> BackendResult<String> {
        if self.status.is_success() {
            Ok(self.body)
        } else {
            Err(BackendError::engine(self.body))
        }
    }

    /// Parse a 2xx JSON body.
    pub fn json<T: serde::de::DeserializeOwned>(self) -> BackendResult<T> {
        let body = self.into_success()?;
        serde_json::from_str(&body)
            .map_err(|e| BackendError::engine(format!("unexpected engine response: {e}")))
    }
}

/// Send `request` and read the whole body.
pub(crate) async fn send(engine: &str, request: RequestBuilder) -> BackendResult<Answer> {
    let response = request
        .send()
        .await
        .map_err(|e| transport_error(engine, &e))?;
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| transport_error(engine, &e))?;
    Ok(Answer { status, body })
}

/// Probe outcome of a liveness request: transport failures are unreachable,
/// non-2xx answers are degraded.
pub(crate) async fn probe(engine: &str, request: RequestBuilder) -> Result<String, Probe> {
    match send(engine, request).await {
        Ok(answer) if answer.status.is_success() => Ok(answer.body),
        Ok(answer) => Err(Probe::Degraded(format!("{}: {}", answer.status, answer.body))),
        Err(e) => Err(Probe::Unreachable(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_answer_keeps_engine_message() {
        let answer = Answer {
            status: StatusCode::BAD_REQUEST,
            body: r#"{"error":"index_not_found_exception"}"#.to_string(),
        };
        let err = answer.into_success().unwrap_err();
        assert_eq!(err.to_string(), r#"{"error":"index_not_found_exception"}"#);
        assert!(!err.is_parameter());
    }

    #[test]
    fn test_answer_json() {
        let answer = Answer {
            status: StatusCode::OK,
            body: r#"{"status":"green"}"#.to_string(),
        };
        let value: serde_json::Value = answer.json().unwrap();
        assert_eq!(value["status"], "green");
    }

    #[tokio::test]
    async fn test_probe_unreachable() {
        let client = client("test", 1).unwrap();
        // port 9 (discard) on localhost is closed in test environments
        let outcome = probe("test", client.get("http://127.0.0.1:9/")).await;
        assert!(matches!(outcome, Err(Probe::Unreachable(_))));
    }
}
