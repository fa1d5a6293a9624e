// External price feed used once the token has left the bonding curve

use crate::error::CoreError;
use crate::http::HttpClient;
use async_trait::async_trait;
use log::debug;
use std::sync::Arc;

/// Wrapped SOL mint, the quote currency for prices.
pub const WSOL_MINT: &str = "So11111111111111111111111111111111111111112";

#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Price of one whole token in SOL; `Ok(None)` when the feed has no quote.
    async fn price_in_sol(&self, mint: &str) -> Result<Option<f64>, CoreError>;
}

/// Jupiter price API (`/price/v2?ids=<mint>&vsToken=<wSOL>`).
pub struct JupiterPriceSource {
    http: Arc<dyn HttpClient>,
    base_url: String,
}

impl JupiterPriceSource {
    pub fn new(http: Arc<dyn HttpClient>, base_url: impl Into<String>) -> Self {
        Self { http, base_url: base_url.into() }
    }

    fn quote_url(&self, mint: &str) -> Result<String, CoreError> {
        let url = url::Url::parse_with_params(&self.base_url, &[("ids", mint), ("vsToken", WSOL_MINT)])
            .map_err(|e| CoreError::Validation(format!("Invalid price API url: {}", e)))?;
        Ok(url.to_string())
    }
}

#[async_trait]
impl PriceSource for JupiterPriceSource {
    async fn price_in_sol(&self, mint: &str) -> Result<Option<f64>, CoreError> {
        let url = self.quote_url(mint)?;
        debug!("Fetching external price: {}", url);
        let body = self.http.get_json(&url).await?;
        let price = body
            .get("data")
            .and_then(|d| d.get(mint))
            .and_then(|entry| entry.get("price"))
            .and_then(|p| match p {
                serde_json::Value::String(s) => s.parse::<f64>().ok(),
                other => other.as_f64(),
            })
            .filter(|p| p.is_finite() && *p > 0.0);
        Ok(price)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StaticHttpClient;
    use serde_json::json;

    #[tokio::test]
    async fn test_parses_string_price() {
        let http = Arc::new(StaticHttpClient::with_get(json!({
            "data": {"MINT": {"id": "MINT", "price": "0.00000042"}}
        })));
        let source = JupiterPriceSource::new(http.clone(), "https://api.jup.ag/price/v2");
        assert_eq!(source.price_in_sol("MINT").await.unwrap(), Some(0.00000042));

        let requested = http.requests();
        assert!(requested[0].contains("ids=MINT"));
        assert!(requested[0].contains("vsToken=So11111111111111111111111111111111111111112"));
    }

    #[tokio::test]
    async fn test_missing_quote_is_none() {
        let http = Arc::new(StaticHttpClient::with_get(json!({"data": {}})));
        let source = JupiterPriceSource::new(http, "https://api.jup.ag/price/v2");
        assert_eq!(source.price_in_sol("MINT").await.unwrap(), None);
    }
}
