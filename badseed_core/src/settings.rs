use crate::error::CoreError;
use log::warn;
use serde::{Deserialize, Serialize};
use solana_sdk::signature::Keypair;

/// Public mainnet endpoint used when no provider key is configured.
pub const PUBLIC_RPC_URL: &str = "https://api.mainnet-beta.solana.com";

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    // Token identity
    #[serde(default = "default_mint")]
    pub mint: String,
    #[serde(default = "default_symbol")]
    pub symbol: String,
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_creator_wallet")]
    pub creator_wallet: String,
    #[serde(default = "default_donation_wallet")]
    pub donation_wallet: String,
    #[serde(default = "default_pump_fun_program")]
    pub pump_fun_program: String,

    // Chain access
    #[serde(default)]
    pub rpc_api_key: Option<String>,
    #[serde(default = "default_rpc_base_url")]
    pub rpc_base_url: String,
    #[serde(default)]
    pub fallback_rpc_url: Option<String>,

    // Store
    #[serde(default)]
    pub store_url: Option<String>,
    #[serde(default)]
    pub store_token: Option<String>,
    #[serde(default = "default_key_version")]
    pub key_version: String,

    // Secrets
    #[serde(default)]
    pub creator_secret_key: Option<String>,
    #[serde(default)]
    pub webhook_secret: Option<String>,
    #[serde(default)]
    pub bitquery_token: Option<String>,
    #[serde(default)]
    pub strict_config: bool,

    // State machine and accounting
    #[serde(default = "default_prelaunch_vsol_threshold_sol")]
    pub prelaunch_vsol_threshold_sol: f64,
    #[serde(default = "default_initial_sale_supply_tokens")]
    pub initial_sale_supply_tokens: f64,
    #[serde(default = "default_initial_total_supply_tokens")]
    pub initial_total_supply_tokens: f64,
    #[serde(default = "default_min_buffer_sol")]
    pub min_buffer_sol: f64,
    #[serde(default = "default_signature_scan_limit")]
    pub signature_scan_limit: usize,
    #[serde(default = "default_count_third_party_donations")]
    pub count_third_party_donations: bool,
    #[serde(default = "default_recent_activity_limit")]
    pub recent_activity_limit: usize,

    // External sources
    #[serde(default = "default_jupiter_price_url")]
    pub jupiter_price_url: String,
    #[serde(default = "default_bitquery_endpoint")]
    pub bitquery_endpoint: String,
    #[serde(default = "default_candle_cache_ttl_secs")]
    pub candle_cache_ttl_secs: u64,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,

    // Scheduler and API
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_api_host")]
    pub api_host: String,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
}

impl Default for Settings {
    fn default() -> Self {
        // Every field has a serde default, so an empty object is a complete config.
        serde_json::from_value(serde_json::json!({}))
            .unwrap_or_else(|e| unreachable!("default settings must deserialize: {}", e))
    }
}

/// Original deployment variable names, mapped onto settings keys.
#[cfg(feature = "native")]
const LEGACY_ENV_VARS: &[(&str, &str)] = &[
    ("HELIUS_API_KEY", "rpc_api_key"),
    ("QUICKNODE_RPC_URL", "fallback_rpc_url"),
    ("UPSTASH_REDIS_REST_URL", "store_url"),
    ("UPSTASH_REDIS_REST_TOKEN", "store_token"),
    ("CREATOR_SECRET_KEY", "creator_secret_key"),
    ("WEBHOOK_AUTH_TOKEN", "webhook_secret"),
    ("BITQUERY_TOKEN", "bitquery_token"),
];

impl Settings {
    /// Load settings from an optional TOML file, `BADSEED_*` environment variables
    /// and the legacy variable names, in increasing precedence.
    #[cfg(feature = "native")]
    pub fn load(path: &str) -> Result<Self, CoreError> {
        let mut builder = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix("BADSEED")
                    .try_parsing(true),
            );
        for (var, key) in LEGACY_ENV_VARS {
            let value = std::env::var(var).ok().filter(|v| !v.trim().is_empty());
            builder = builder.set_override_option(*key, value)?;
        }
        let cfg = builder.build()?;
        Ok(cfg.try_deserialize()?)
    }

    #[cfg(feature = "native")]
    pub fn from_file(path: &str) -> Result<Self, CoreError> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name(path));
        let cfg = builder.build()?;
        Ok(cfg.try_deserialize()?)
    }

    /// Validate settings ranges and constraints. Missing secrets are fatal only
    /// with `strict_config`; otherwise they are logged and the feature stays off.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.prelaunch_vsol_threshold_sol <= 0.0 {
            return Err(CoreError::Validation("prelaunch_vsol_threshold_sol must be > 0".to_string()));
        }
        if self.initial_sale_supply_tokens <= 0.0 {
            return Err(CoreError::Validation("initial_sale_supply_tokens must be > 0".to_string()));
        }
        if self.initial_total_supply_tokens <= 0.0 {
            return Err(CoreError::Validation("initial_total_supply_tokens must be > 0".to_string()));
        }
        if self.min_buffer_sol < 0.0 {
            return Err(CoreError::Validation("min_buffer_sol must be >= 0".to_string()));
        }
        if self.signature_scan_limit == 0 || self.signature_scan_limit > 1000 {
            return Err(CoreError::Validation("signature_scan_limit must be within 1..=1000".to_string()));
        }
        if self.poll_interval_secs == 0 || self.sweep_interval_secs == 0 {
            return Err(CoreError::Validation("poll and sweep intervals must be > 0".to_string()));
        }
        if self.key_version.trim().is_empty() {
            return Err(CoreError::Validation("key_version must not be empty".to_string()));
        }
        for (name, value) in [
            ("mint", &self.mint),
            ("creator_wallet", &self.creator_wallet),
            ("donation_wallet", &self.donation_wallet),
            ("pump_fun_program", &self.pump_fun_program),
        ] {
            if bs58::decode(value).into_vec().ok().map(|b| b.len()) != Some(32) {
                return Err(CoreError::Validation(format!("{} is not a valid address: {}", name, value)));
            }
        }

        let missing = self.missing_secrets();
        if !missing.is_empty() {
            if self.strict_config {
                return Err(CoreError::Validation(format!(
                    "missing required settings: {}",
                    missing.join(", ")
                )));
            }
            for name in missing {
                warn!("Missing setting: {} (running with the feature disabled)", name);
            }
        }
        Ok(())
    }

    fn missing_secrets(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        let blank = |v: &Option<String>| v.as_deref().map(str::trim).unwrap_or("").is_empty();
        if blank(&self.rpc_api_key) {
            missing.push("rpc_api_key");
        }
        if blank(&self.store_url) {
            missing.push("store_url");
        }
        if blank(&self.store_token) {
            missing.push("store_token");
        }
        if blank(&self.creator_secret_key) {
            missing.push("creator_secret_key");
        }
        if blank(&self.webhook_secret) {
            missing.push("webhook_secret");
        }
        missing
    }

    /// Primary RPC endpoint: the keyed provider URL, or the public cluster.
    pub fn primary_rpc_url(&self) -> String {
        match self.rpc_api_key.as_deref().map(str::trim) {
            Some(key) if !key.is_empty() => url::Url::parse_with_params(&self.rpc_base_url, &[("api-key", key)])
                .map(|u| u.to_string())
                .unwrap_or_else(|_| format!("{}?api-key={}", self.rpc_base_url, key)),
            _ => PUBLIC_RPC_URL.to_string(),
        }
    }

    pub fn prelaunch_threshold_lamports(&self) -> u64 {
        (self.prelaunch_vsol_threshold_sol * crate::models::LAMPORTS_PER_SOL).round() as u64
    }

    pub fn min_buffer_lamports(&self) -> u64 {
        (self.min_buffer_sol * crate::models::LAMPORTS_PER_SOL).round() as u64
    }

    /// Creator keypair used for auto-forwarding, if configured.
    pub fn creator_keypair(&self) -> Result<Option<Keypair>, CoreError> {
        let Some(raw) = self.creator_secret_key.as_deref().filter(|s| !s.trim().is_empty()) else {
            return Ok(None);
        };
        let bytes = parse_private_key_string(raw).map_err(CoreError::InvalidKeypair)?;
        let keypair = Keypair::try_from(bytes.as_slice())
            .map_err(|e| CoreError::InvalidKeypair(e.to_string()))?;
        Ok(Some(keypair))
    }

    /// Configured webhook secret, ignoring blank values.
    pub fn webhook_secret(&self) -> Option<&str> {
        self.webhook_secret.as_deref().filter(|s| !s.trim().is_empty())
    }
}

/// Parse a private key string in various formats:
/// - Base58 (standard Solana format, 88 chars)
/// - JSON array string like "[1,2,3,...]"
/// - Comma-separated bytes like "1,2,3,..."
pub fn parse_private_key_string(s: &str) -> Result<Vec<u8>, String> {
    let trimmed = s.trim();

    if trimmed.len() >= 80 && !trimmed.starts_with('[') && !trimmed.contains(',') {
        return bs58::decode(trimmed)
            .into_vec()
            .map_err(|e| format!("Base58 decode failed: {}", e));
    }

    if trimmed.starts_with('[') {
        return serde_json::from_str::<Vec<u8>>(trimmed)
            .map_err(|e| format!("JSON parse failed: {}", e));
    }

    if trimmed.contains(',') {
        let parts: Result<Vec<u8>, _> = trimmed
            .split(',')
            .map(|s| s.trim().parse::<u8>())
            .collect();
        return parts.map_err(|e| format!("CSV parse failed: {}", e));
    }

    Err("Unrecognized private key format. Expected: base58, JSON array, or comma-separated bytes".to_string())
}

fn default_mint() -> String { "3HPpMLK7LjKFqSnCsBYNiijhNTo7dkkx3FCSAHKSpump".to_string() }
fn default_symbol() -> String { "BADSEED".to_string() }
fn default_name() -> String { "BadSeed".to_string() }
fn default_creator_wallet() -> String { "9TyzcephhXEw67piYNc72EJtgVmbq3AZhyPFSvdfXWdr".to_string() }
fn default_donation_wallet() -> String { "CZ7Lv3QNVxbBivGPBhJG7m1HpCtfEDjEusBjjZ3qmVz5".to_string() }
fn default_pump_fun_program() -> String { "6EF8rrecthR5Dkzon8Nwu78hRvfCKubJ14M5uBEwF6P".to_string() }
fn default_rpc_base_url() -> String { "https://mainnet.helius-rpc.com/".to_string() }
fn default_key_version() -> String { "V2".to_string() }
fn default_prelaunch_vsol_threshold_sol() -> f64 { 30.05 }
fn default_initial_sale_supply_tokens() -> f64 { 793_100_000.0 }
fn default_initial_total_supply_tokens() -> f64 { 1_000_000_000.0 }
fn default_min_buffer_sol() -> f64 { 0.01 }
fn default_signature_scan_limit() -> usize { 100 }
fn default_count_third_party_donations() -> bool { true }
fn default_recent_activity_limit() -> usize { 10 }
fn default_jupiter_price_url() -> String { "https://api.jup.ag/price/v2".to_string() }
fn default_bitquery_endpoint() -> String { "https://streaming.bitquery.io/graphql".to_string() }
fn default_candle_cache_ttl_secs() -> u64 { 3600 }
fn default_http_timeout_secs() -> u64 { 15 }
fn default_poll_interval_secs() -> u64 { 60 }
fn default_sweep_interval_secs() -> u64 { 300 }
fn default_api_host() -> String { "0.0.0.0".to_string() }
fn default_api_port() -> u16 { 8080 }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_example_config() {
        let s = Settings::from_file("../config.example.toml").unwrap();
        assert_eq!(s.symbol, "BADSEED");
        assert_eq!(s.key_version, "V2");
        assert_eq!(s.signature_scan_limit, 100);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_defaults_are_complete_and_valid() {
        let s = Settings::default();
        assert_eq!(s.prelaunch_threshold_lamports(), 30_050_000_000);
        assert_eq!(s.min_buffer_lamports(), 10_000_000);
        assert_eq!(s.initial_sale_supply_tokens, 793_100_000.0);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_strict_config_rejects_missing_secrets() {
        let mut s = Settings::default();
        s.strict_config = true;
        let err = s.validate().unwrap_err().to_string();
        assert!(err.contains("webhook_secret"));
        assert!(err.contains("store_url"));
    }

    #[test]
    fn test_primary_rpc_url_uses_key_when_present() {
        let mut s = Settings::default();
        assert_eq!(s.primary_rpc_url(), PUBLIC_RPC_URL);
        s.rpc_api_key = Some("abc".to_string());
        assert_eq!(s.primary_rpc_url(), "https://mainnet.helius-rpc.com/?api-key=abc");
    }

    #[test]
    fn test_parse_private_key_formats() {
        let kp = Keypair::new();
        let bytes = kp.to_bytes().to_vec();

        let json = serde_json::to_string(&bytes).unwrap();
        assert_eq!(parse_private_key_string(&json).unwrap(), bytes);

        let csv = bytes.iter().map(|b| b.to_string()).collect::<Vec<_>>().join(",");
        assert_eq!(parse_private_key_string(&csv).unwrap(), bytes);

        let b58 = bs58::encode(&bytes).into_string();
        assert_eq!(parse_private_key_string(&b58).unwrap(), bytes);

        assert!(parse_private_key_string("nope").is_err());
    }

    #[test]
    fn test_creator_keypair_optional() {
        let mut s = Settings::default();
        assert!(s.creator_keypair().unwrap().is_none());
        let kp = Keypair::new();
        s.creator_secret_key = Some(serde_json::to_string(&kp.to_bytes().to_vec()).unwrap());
        let loaded = s.creator_keypair().unwrap().unwrap();
        assert_eq!(loaded.to_bytes(), kp.to_bytes());
    }
}
