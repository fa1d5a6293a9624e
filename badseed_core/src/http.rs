// HTTP client abstraction for third-party JSON APIs (price feed, candle provider)

use crate::error::CoreError;
use async_trait::async_trait;
use serde_json::Value;

pub type HttpResult<T> = Result<T, CoreError>;

#[async_trait]
pub trait HttpClient: Send + Sync {
    /// GET a URL and parse the body as JSON
    async fn get_json(&self, url: &str) -> HttpResult<Value>;

    /// POST a JSON body, optionally with a bearer token, and parse the JSON reply
    async fn post_json(&self, url: &str, bearer: Option<&str>, body: &Value) -> HttpResult<Value>;
}
