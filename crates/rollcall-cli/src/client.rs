//! Blocking JSON client for the rollcalld HTTP API.

use anyhow::{anyhow, Result};
use serde_json::Value;
use std::time::Duration;

pub struct DaemonClient {
    base: String,
    agent: ureq::Agent,
}

impl DaemonClient {
    /// `timeout` must cover capture enrollment, which holds the request open.
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        let base = base_url.trim_end_matches('/').to_string();
        tracing::debug!(base = %base, timeout_secs = timeout.as_secs(), "daemon client");
        Self {
            base,
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    pub fn get(&self, path: &str) -> Result<Value> {
        finish(self.agent.get(&self.url(path)).call())
    }

    pub fn get_query(&self, path: &str, query: &[(&str, String)]) -> Result<Value> {
        finish(self.query(path, query).call())
    }

    /// Like `get_query`, for endpoints that answer with plain text such as CSV.
    pub fn get_text(&self, path: &str, query: &[(&str, String)]) -> Result<String> {
        let resp = check(self.query(path, query).call())?;
        Ok(resp.into_string()?)
    }

    fn query(&self, path: &str, query: &[(&str, String)]) -> ureq::Request {
        let mut request = self.agent.get(&self.url(path));
        for (key, value) in query {
            request = request.query(key, value);
        }
        request
    }

    pub fn post(&self, path: &str, body: Option<Value>) -> Result<Value> {
        let request = self.agent.post(&self.url(path));
        finish(match body {
            Some(body) => request.send_json(body),
            None => request.call(),
        })
    }

    pub fn put(&self, path: &str, body: Value) -> Result<Value> {
        finish(self.agent.put(&self.url(path)).send_json(body))
    }
}

fn finish(result: Result<ureq::Response, ureq::Error>) -> Result<Value> {
    Ok(check(result)?.into_json()?)
}

fn check(result: Result<ureq::Response, ureq::Error>) -> Result<ureq::Response> {
    match result {
        Ok(resp) => Ok(resp),
        Err(ureq::Error::Status(code, resp)) => {
            let body = resp.into_string().unwrap_or_default();
            Err(anyhow!("HTTP {code}: {}", error_message(&body)))
        }
        Err(ureq::Error::Transport(t)) => Err(anyhow!("cannot reach rollcalld: {t}")),
    }
}

/// The daemon's `{"error": "..."}` message, or the raw body.
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_message() {
        assert_eq!(error_message(r#"{"error":"identity 4 not found"}"#), "identity 4 not found");
        assert_eq!(error_message("  Bad Gateway \n"), "Bad Gateway");
    }

    #[test]
    fn test_url_join() {
        let client = DaemonClient::new("http://127.0.0.1:8750/", Duration::from_secs(1));
        assert_eq!(client.url("/api/status"), "http://127.0.0.1:8750/api/status");
    }

    #[test]
    fn test_unreachable_daemon() {
        let client = DaemonClient::new("http://127.0.0.1:9", Duration::from_millis(200));
        let err = client.get("/health").unwrap_err();
        assert!(err.to_string().contains("cannot reach rollcalld"));
    }
}
