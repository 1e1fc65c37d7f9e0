//! Push, pull and poke requests
//!
//! [`SyncTransport`] is the seam between the coordinator and the network.
//! [`HttpTransport`] talks JSON over HTTPS with bearer auth; [`MockTransport`]
//! records calls in memory for tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::mutation::MutationRecord;
use crate::replica::PatchOp;

const MAX_LOG_BODY_CHARS: usize = 512;

/// Request timeout used unless configured otherwise
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Body of a push request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PushRequest {
    #[serde(rename = "clientID")]
    pub client_id: String,
    pub mutations: Vec<MutationRecord>,
}

/// Body of a pull request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PullRequest {
    #[serde(rename = "clientID")]
    pub client_id: String,
}

/// Body of a pull response
///
/// Patch values stay untyped here; the coordinator decodes them into the
/// domain's entity type.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PullResponse {
    /// Highest mutation id from this client the server has applied
    #[serde(
        rename = "lastMutationID",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub last_mutation_id: Option<u64>,
    #[serde(default)]
    pub patch: Vec<PatchOp<Value>>,
}

/// Network operations the coordinator depends on
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Send pending mutations; `Ok` means the server accepted the batch
    async fn push(&self, url: &str, token: &str, request: &PushRequest) -> Result<()>;

    /// Fetch the authoritative patch for this client
    async fn pull(&self, url: &str, token: &str, request: &PullRequest) -> Result<PullResponse>;

    /// Ask the server to notify the user's other sessions
    async fn poke(&self, url: &str, token: &str, user_id: &str) -> Result<()>;
}

/// JSON-over-HTTP transport
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    fn headers(token: &str) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let auth_value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| SyncError::auth("Invalid access token format"))?;
        headers.insert(AUTHORIZATION, auth_value);
        Ok(headers)
    }

    /// Read the body and turn non-2xx statuses into [`SyncError::Api`]
    async fn check(response: reqwest::Response) -> Result<String> {
        let status = response.status();
        let body = response.text().await?;
        if status.is_success() {
            debug!("API response status: {}", status);
            return Ok(body);
        }

        let mut preview = body.chars().take(MAX_LOG_BODY_CHARS).collect::<String>();
        if body.chars().count() > MAX_LOG_BODY_CHARS {
            preview.push_str("...");
        }
        debug!("API response error ({}): {}", status, preview);
        Err(SyncError::api(status.as_u16(), preview))
    }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn push(&self, url: &str, token: &str, request: &PushRequest) -> Result<()> {
        debug!("POST {} ({} mutation(s))", url, request.mutations.len());
        let response = self
            .client
            .post(url)
            .headers(Self::headers(token)?)
            .json(request)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn pull(&self, url: &str, token: &str, request: &PullRequest) -> Result<PullResponse> {
        debug!("POST {}", url);
        let response = self
            .client
            .post(url)
            .headers(Self::headers(token)?)
            .json(request)
            .send()
            .await?;
        let body = Self::check(response).await?;
        if body.trim().is_empty() {
            return Ok(PullResponse::default());
        }
        Ok(serde_json::from_str(&body)?)
    }

    async fn poke(&self, url: &str, token: &str, user_id: &str) -> Result<()> {
        debug!("POST {} (poke)", url);
        let response = self
            .client
            .post(url)
            .query(&[("userId", user_id)])
            .headers(Self::headers(token)?)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}

#[derive(Default)]
struct MockState {
    pushes: Vec<PushRequest>,
    pull_urls: Vec<String>,
    pokes: Vec<String>,
    tokens: Vec<String>,
    pull_responses: VecDeque<PullResponse>,
    failing_pushes: u32,
    failing_pulls: u32,
    failing_pokes: u32,
    failure_status: u16,
}

/// In-memory transport that records every call
///
/// Cloning shares the recorded state, so a test can keep one handle while the
/// coordinator owns another.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for the next pull; an empty patch is returned otherwise
    pub fn queue_pull_response(&self, response: PullResponse) {
        self.state.lock().pull_responses.push_back(response);
    }

    /// Make the next `count` pushes fail with `status`
    pub fn fail_pushes(&self, count: u32, status: u16) {
        let mut state = self.state.lock();
        state.failing_pushes = count;
        state.failure_status = status;
    }

    /// Make the next `count` pulls fail with `status`
    pub fn fail_pulls(&self, count: u32, status: u16) {
        let mut state = self.state.lock();
        state.failing_pulls = count;
        state.failure_status = status;
    }

    /// Make the next `count` pokes fail with `status`
    pub fn fail_pokes(&self, count: u32, status: u16) {
        let mut state = self.state.lock();
        state.failing_pokes = count;
        state.failure_status = status;
    }

    /// Successful and failed push attempts, in order
    pub fn pushes(&self) -> Vec<PushRequest> {
        self.state.lock().pushes.clone()
    }

    /// Number of pull requests that reached the transport
    pub fn pull_count(&self) -> usize {
        self.state.lock().pull_urls.len()
    }

    pub fn pull_urls(&self) -> Vec<String> {
        self.state.lock().pull_urls.clone()
    }

    /// User ids of every poke attempt
    pub fn pokes(&self) -> Vec<String> {
        self.state.lock().pokes.clone()
    }

    /// Bearer tokens seen, one per call
    pub fn tokens(&self) -> Vec<String> {
        self.state.lock().tokens.clone()
    }
}

#[async_trait]
impl SyncTransport for MockTransport {
    async fn push(&self, _url: &str, token: &str, request: &PushRequest) -> Result<()> {
        let mut state = self.state.lock();
        state.pushes.push(request.clone());
        state.tokens.push(token.to_string());
        if state.failing_pushes > 0 {
            state.failing_pushes -= 1;
            return Err(SyncError::api(state.failure_status, "push failed"));
        }
        Ok(())
    }

    async fn pull(&self, url: &str, token: &str, _request: &PullRequest) -> Result<PullResponse> {
        let mut state = self.state.lock();
        state.pull_urls.push(url.to_string());
        state.tokens.push(token.to_string());
        if state.failing_pulls > 0 {
            state.failing_pulls -= 1;
            return Err(SyncError::api(state.failure_status, "pull failed"));
        }
        Ok(state.pull_responses.pop_front().unwrap_or_default())
    }

    async fn poke(&self, _url: &str, token: &str, user_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.pokes.push(user_id.to_string());
        state.tokens.push(token.to_string());
        if state.failing_pokes > 0 {
            state.failing_pokes -= 1;
            return Err(SyncError::api(state.failure_status, "poke failed"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pull_response_wire_format() {
        let body = r#"{
            "lastMutationID": 4,
            "patch": [
                {"op": "clear"},
                {"op": "put", "key": "entry/a", "value": {"id": "a", "name": "Tea"}},
                {"op": "del", "key": "entry/b"}
            ]
        }"#;
        let response: PullResponse = serde_json::from_str(body).unwrap();
        assert_eq!(response.last_mutation_id, Some(4));
        assert_eq!(response.patch.len(), 3);
        assert_eq!(response.patch[0], PatchOp::Clear);

        // Both fields are optional
        let empty: PullResponse = serde_json::from_str("{}").unwrap();
        assert_eq!(empty, PullResponse::default());
    }

    #[test]
    fn test_push_request_wire_format() {
        let request = PushRequest {
            client_id: "c1".to_string(),
            mutations: Vec::new(),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value, serde_json::json!({"clientID": "c1", "mutations": []}));
    }

    #[test]
    fn test_invalid_token_is_auth_error() {
        let err = HttpTransport::headers("bad\ntoken").unwrap_err();
        assert!(matches!(err, SyncError::Auth(_)));
    }

    #[tokio::test]
    async fn test_mock_records_and_fails_on_demand() {
        let mock = MockTransport::new();
        let request = PushRequest {
            client_id: "c1".to_string(),
            mutations: Vec::new(),
        };

        mock.fail_pushes(1, 503);
        let err = mock.push("u", "t", &request).await.unwrap_err();
        assert_eq!(err.status_code(), Some(503));
        mock.push("u", "t", &request).await.unwrap();
        assert_eq!(mock.pushes().len(), 2);

        mock.queue_pull_response(PullResponse {
            last_mutation_id: Some(1),
            patch: Vec::new(),
        });
        let pull = PullRequest {
            client_id: "c1".to_string(),
        };
        assert_eq!(
            mock.pull("p", "t", &pull).await.unwrap().last_mutation_id,
            Some(1)
        );
        assert_eq!(mock.pull("p", "t", &pull).await.unwrap().last_mutation_id, None);
        assert_eq!(mock.pull_count(), 2);
    }
}
