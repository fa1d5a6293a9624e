// Native HTTP client implementation using reqwest

use crate::error::CoreError;
use crate::http::{HttpClient, HttpResult};
use async_trait::async_trait;
use log::debug;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;

/// Native HTTP client using reqwest
pub struct NativeHttpClient {
    client: Client,
}

impl NativeHttpClient {
    pub fn new(timeout: Duration) -> Result<Self, CoreError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CoreError::Init(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    async fn read_json(response: reqwest::Response) -> HttpResult<Value> {
        let status = response.status();
        if !status.is_success() {
            return Err(CoreError::Http(format!("upstream returned {}", status)));
        }
        Ok(response.json::<Value>().await?)
    }
}

#[async_trait]
impl HttpClient for NativeHttpClient {
    async fn get_json(&self, url: &str) -> HttpResult<Value> {
        debug!("GET {}", url);
        let response = self.client.get(url).send().await?;
        Self::read_json(response).await
    }

    async fn post_json(&self, url: &str, bearer: Option<&str>, body: &Value) -> HttpResult<Value> {
        debug!("POST {}", url);
        let mut request = self.client.post(url).json(body);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        Self::read_json(request.send().await?).await
    }
}
