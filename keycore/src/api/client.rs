//! HTTP client for the NoChat key server
//!
//! Handles every call the key lifecycle engine makes to the backend.

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::{de::DeserializeOwned, Serialize};

use crate::config::EngineConfig;
use crate::crypto::PreKeyBundle;
use crate::error::{EngineError, EngineResult};
use crate::models::{KeyUpload, PreKeySync, SenderKeyRotation, ServerKeyStatus};

/// Server operations the engine depends on
///
/// Every call is a suspension point; the engine assumes nothing about
/// ordering relative to other tasks.
#[async_trait]
pub trait KeyServer: Send + Sync {
    /// What the server holds for `user_id`/`device_id`
    async fn key_status(&self, user_id: &str, device_id: u32) -> EngineResult<ServerKeyStatus>;

    /// Upload a full or partial key set for this device
    async fn upload_keys(&self, upload: &KeyUpload) -> EngineResult<()>;

    /// Tell the server a sender key was rotated
    async fn notify_sender_key_rotation(&self, rotation: &SenderKeyRotation) -> EngineResult<()>;

    /// Push the complete local prekey id list
    async fn sync_prekeys(&self, sync: &PreKeySync) -> EngineResult<()>;

    /// Fetch a prekey bundle for a peer device (consumes one of its prekeys)
    async fn fetch_prekey_bundle(&self, user_id: &str, device_id: u32) -> EngineResult<PreKeyBundle>;
}

/// API client for the NoChat key server
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    token: String,
}

impl ApiClient {
    /// Create a new API client authenticated with `token`
    pub fn new(config: &EngineConfig, token: &str) -> EngineResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: config.api_base().to_string(),
            token: token.to_string(),
        })
    }

    /// Build URL for endpoint
    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.base_url, endpoint)
    }

    /// Make authenticated GET request
    async fn get<T: DeserializeOwned>(&self, endpoint: &str) -> EngineResult<T> {
        let response = self
            .client
            .get(self.url(endpoint))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(transport_error)?;
        let response = self.check_status(response).await?;
        Ok(response.json().await?)
    }

    /// Make authenticated POST request, ignoring the response body
    async fn post<B: Serialize>(&self, endpoint: &str, body: &B) -> EngineResult<()> {
        let response = self
            .client
            .post(self.url(endpoint))
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;
        self.check_status(response).await?;
        Ok(())
    }

    /// Turn non-success statuses into errors
    async fn check_status(&self, response: Response) -> EngineResult<Response> {
        let status = response.status();

        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(EngineError::NotLoggedIn);
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Server {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response)
    }
}

/// Timeouts and connection failures are network errors, not key-state errors
fn transport_error(e: reqwest::Error) -> EngineError {
    if e.is_timeout() {
        EngineError::Network(format!("Request timeout: {}", e))
    } else if e.is_connect() {
        EngineError::Network(format!("Network unreachable: {}", e))
    } else {
        EngineError::Http(e)
    }
}

#[async_trait]
impl KeyServer for ApiClient {
    async fn key_status(&self, user_id: &str, device_id: u32) -> EngineResult<ServerKeyStatus> {
        self.get(&format!(
            "/keys/status?userId={}&deviceId={}",
            urlencoding::encode(user_id),
            device_id
        ))
        .await
    }

    async fn upload_keys(&self, upload: &KeyUpload) -> EngineResult<()> {
        self.post("/keys/upload", upload).await
    }

    async fn notify_sender_key_rotation(&self, rotation: &SenderKeyRotation) -> EngineResult<()> {
        self.post("/senderkey/rotate", rotation).await
    }

    async fn sync_prekeys(&self, sync: &PreKeySync) -> EngineResult<()> {
        self.post("/prekeys/sync", sync).await
    }

    async fn fetch_prekey_bundle(&self, user_id: &str, device_id: u32) -> EngineResult<PreKeyBundle> {
        self.get(&format!(
            "/keys/bundle/{}/{}",
            urlencoding::encode(user_id),
            device_id
        ))
        .await
    }
}
