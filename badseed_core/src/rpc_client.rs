// RPC Client abstraction - the reconciler talks to the chain only through this trait

use crate::error::CoreError;
use crate::models::SignatureInfo;
use async_trait::async_trait;
use serde_json::Value;
use solana_sdk::signature::Keypair;

/// Result type for RPC operations
pub type RpcResult<T> = Result<T, CoreError>;

/// Read access to the chain plus the single write the tracker performs
/// (forwarding creator SOL to the donation wallet).
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// Raw account data; `Ok(None)` when the account does not exist
    async fn get_account_data(&self, address: &str) -> RpcResult<Option<Vec<u8>>>;

    /// SOL balance in lamports
    async fn get_balance(&self, address: &str) -> RpcResult<u64>;

    /// Sum of `owner`'s token accounts for `mint`, in base units
    async fn get_token_balance(&self, owner: &str, mint: &str) -> RpcResult<u64>;

    /// Current mint supply in base units
    async fn get_token_supply(&self, mint: &str) -> RpcResult<u64>;

    /// Signatures involving `address`, newest first, stopping before `until`
    async fn get_signatures_for_address(
        &self,
        address: &str,
        until: Option<&str>,
        limit: usize,
    ) -> RpcResult<Vec<SignatureInfo>>;

    /// Parsed transaction as JSON; `Ok(None)` when the node does not know it
    async fn get_transaction(&self, signature: &str) -> RpcResult<Option<Value>>;

    /// Sign, send and confirm a plain SOL transfer. Returns the signature.
    async fn transfer_lamports(&self, from: &Keypair, to: &str, lamports: u64) -> RpcResult<String>;
}
