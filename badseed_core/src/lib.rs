// BadSeed Core Library
// Token lifecycle tracking and donation accounting, independent of the HTTP surface

pub mod actor;
pub mod bonding_curve;
pub mod candles;
pub mod error;
pub mod http;
pub mod memory_store;
pub mod models;
pub mod price_source;
pub mod query;
pub mod reconciler;
pub mod rpc_client;
pub mod settings;
pub mod state_machine;
pub mod storage_trait;
pub mod tx_parser;
pub mod webhook;

#[cfg(feature = "native")]
pub mod native;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-exports
pub use actor::ReconcilerHandle;
pub use error::CoreError;
pub use models::*;
pub use settings::Settings;
pub use rpc_client::*;
pub use storage_trait::*;
pub use http::HttpClient;
pub use price_source::PriceSource;
