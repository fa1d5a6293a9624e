// In-memory doubles for the chain, the price feed and outbound HTTP

use crate::bonding_curve::bonding_curve_address;
use crate::error::CoreError;
use crate::http::{HttpClient, HttpResult};
use crate::memory_store::MemoryStore;
use crate::models::{BondingCurveState, SignatureInfo};
use crate::price_source::PriceSource;
use crate::rpc_client::{ChainReader, RpcResult};
use crate::storage_trait::{KvStore, StorageResult};
use async_trait::async_trait;
use serde_json::{json, Value};
use solana_sdk::signature::Keypair;
use solana_sdk::signer::Signer;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Raw account bytes of a curve, discriminator included.
pub fn encode_curve(state: &BondingCurveState) -> Vec<u8> {
    let mut data = vec![0u8; 8];
    for v in [
        state.virtual_token_reserves,
        state.virtual_sol_reserves,
        state.real_token_reserves,
        state.real_sol_reserves,
        state.token_total_supply,
    ] {
        data.extend_from_slice(&v.to_le_bytes());
    }
    data.push(state.complete as u8);
    data
}

/// Parsed-encoding transaction moving `lamports` from `from` to `to`.
pub fn transfer_tx(signature: &str, slot: u64, from: &str, to: &str, lamports: u64) -> Value {
    let fee = 5_000u64;
    let from_pre = lamports + fee + 1_000_000_000;
    json!({
        "slot": slot,
        "transaction": {
            "signatures": [signature],
            "message": {
                "accountKeys": [
                    {"pubkey": from, "signer": true, "writable": true},
                    {"pubkey": to, "signer": false, "writable": true}
                ]
            }
        },
        "meta": {
            "err": null,
            "preBalances": [from_pre, 0u64],
            "postBalances": [from_pre - lamports - fee, lamports]
        }
    })
}

#[derive(Default)]
pub struct MockChainState {
    pub accounts: HashMap<String, Vec<u8>>,
    pub balances: HashMap<String, u64>,
    pub token_balances: HashMap<(String, String), u64>,
    pub token_supply: HashMap<String, u64>,
    /// Newest first, per address
    pub history: HashMap<String, Vec<SignatureInfo>>,
    pub transactions: HashMap<String, Value>,
    pub fail_reads: bool,
    pub fail_transfers: bool,
    pub sent: Vec<(String, String, u64)>,
    pub slot: u64,
}

/// Scriptable `ChainReader`. Forwarded transfers land in the recipient's
/// history like a real confirmed transaction would.
#[derive(Default)]
pub struct MockChain {
    state: Mutex<MockChainState>,
}

impl MockChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, MockChainState> {
        self.state.lock().unwrap()
    }

    pub fn set_curve(&self, mint: &str, program: &str, state: &BondingCurveState) {
        let address = bonding_curve_address(mint, program).unwrap().to_string();
        self.state().accounts.insert(address, encode_curve(state));
    }

    pub fn set_raw_curve(&self, mint: &str, program: &str, data: Vec<u8>) {
        let address = bonding_curve_address(mint, program).unwrap().to_string();
        self.state().accounts.insert(address, data);
    }

    pub fn set_balance(&self, address: &str, lamports: u64) {
        self.state().balances.insert(address.to_string(), lamports);
    }

    pub fn set_token_balance(&self, owner: &str, mint: &str, amount: u64) {
        self.state()
            .token_balances
            .insert((owner.to_string(), mint.to_string()), amount);
    }

    pub fn set_token_supply(&self, mint: &str, amount: u64) {
        self.state().token_supply.insert(mint.to_string(), amount);
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.state().fail_reads = fail;
    }

    pub fn set_fail_transfers(&self, fail: bool) {
        self.state().fail_transfers = fail;
    }

    /// Record a confirmed transaction touching each of `addresses`.
    pub fn push_transaction(&self, addresses: &[&str], signature: &str, tx: Value) {
        let mut state = self.state();
        state.slot += 1;
        let slot = state.slot;
        for address in addresses {
            state.history.entry(address.to_string()).or_default().insert(
                0,
                SignatureInfo { signature: signature.to_string(), slot, failed: false },
            );
        }
        state.transactions.insert(signature.to_string(), tx);
    }

    pub fn sent(&self) -> Vec<(String, String, u64)> {
        self.state().sent.clone()
    }

    fn check_reads(&self) -> RpcResult<()> {
        if self.state().fail_reads {
            return Err(CoreError::Rpc("mock RPC unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChainReader for MockChain {
    async fn get_account_data(&self, address: &str) -> RpcResult<Option<Vec<u8>>> {
        self.check_reads()?;
        Ok(self.state().accounts.get(address).cloned())
    }

    async fn get_balance(&self, address: &str) -> RpcResult<u64> {
        self.check_reads()?;
        Ok(self.state().balances.get(address).copied().unwrap_or(0))
    }

    async fn get_token_balance(&self, owner: &str, mint: &str) -> RpcResult<u64> {
        self.check_reads()?;
        Ok(self
            .state()
            .token_balances
            .get(&(owner.to_string(), mint.to_string()))
            .copied()
            .unwrap_or(0))
    }

    async fn get_token_supply(&self, mint: &str) -> RpcResult<u64> {
        self.check_reads()?;
        self.state()
            .token_supply
            .get(mint)
            .copied()
            .ok_or_else(|| CoreError::NotFound(format!("mint {}", mint)))
    }

    async fn get_signatures_for_address(
        &self,
        address: &str,
        until: Option<&str>,
        limit: usize,
    ) -> RpcResult<Vec<SignatureInfo>> {
        self.check_reads()?;
        let state = self.state();
        let history = state.history.get(address).cloned().unwrap_or_default();
        Ok(history
            .into_iter()
            .take_while(|s| Some(s.signature.as_str()) != until)
            .take(limit)
            .collect())
    }

    async fn get_transaction(&self, signature: &str) -> RpcResult<Option<Value>> {
        self.check_reads()?;
        Ok(self.state().transactions.get(signature).cloned())
    }

    async fn transfer_lamports(&self, from: &Keypair, to: &str, lamports: u64) -> RpcResult<String> {
        let from_address = from.pubkey().to_string();
        let signature = {
            let mut state = self.state();
            if state.fail_transfers {
                return Err(CoreError::Transaction("mock transfer rejected".to_string()));
            }
            let balance = state.balances.get(&from_address).copied().unwrap_or(0);
            if balance < lamports {
                return Err(CoreError::Transaction("insufficient funds".to_string()));
            }
            state.balances.insert(from_address.clone(), balance - lamports);
            *state.balances.entry(to.to_string()).or_insert(0) += lamports;
            state.sent.push((from_address.clone(), to.to_string(), lamports));
            format!("forward-{}", state.sent.len())
        };
        let slot = self.state().slot + 1;
        let tx = transfer_tx(&signature, slot, &from_address, to, lamports);
        self.push_transaction(&[&from_address, to], &signature, tx);
        Ok(signature)
    }
}

/// Price feed returning a fixed answer.
pub struct StaticPriceSource {
    price: Mutex<Result<Option<f64>, String>>,
}

impl StaticPriceSource {
    pub fn new(price: Option<f64>) -> Self {
        Self { price: Mutex::new(Ok(price)) }
    }

    pub fn failing() -> Self {
        Self { price: Mutex::new(Err("price feed down".to_string())) }
    }
}

#[async_trait]
impl PriceSource for StaticPriceSource {
    async fn price_in_sol(&self, _mint: &str) -> Result<Option<f64>, CoreError> {
        self.price.lock().unwrap().clone().map_err(CoreError::Http)
    }
}

/// HTTP client answering every GET and POST with canned bodies.
#[derive(Default)]
pub struct StaticHttpClient {
    get_body: Option<Value>,
    post_body: Option<Value>,
    requests: Mutex<Vec<String>>,
}

impl StaticHttpClient {
    pub fn with_get(body: Value) -> Self {
        Self { get_body: Some(body), ..Self::default() }
    }

    pub fn with_post(body: Value) -> Self {
        Self { post_body: Some(body), ..Self::default() }
    }

    /// Every call fails.
    pub fn unreachable() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpClient for StaticHttpClient {
    async fn get_json(&self, url: &str) -> HttpResult<Value> {
        self.requests.lock().unwrap().push(url.to_string());
        self.get_body
            .clone()
            .ok_or_else(|| CoreError::Http(format!("GET {} unreachable", url)))
    }

    async fn post_json(&self, url: &str, _bearer: Option<&str>, _body: &Value) -> HttpResult<Value> {
        self.requests.lock().unwrap().push(url.to_string());
        self.post_body
            .clone()
            .ok_or_else(|| CoreError::Http(format!("POST {} unreachable", url)))
    }
}

/// Memory store whose hash writes and set inserts can be made to fail a
/// given number of times.
#[derive(Default)]
pub struct FaultyStore {
    inner: MemoryStore,
    merge_hash_failures: AtomicUsize,
    insert_set_failures: AtomicUsize,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_merge_hash(&self, times: usize) {
        self.merge_hash_failures.store(times, Ordering::SeqCst);
    }

    pub fn fail_insert_set(&self, times: usize) {
        self.insert_set_failures.store(times, Ordering::SeqCst);
    }

    fn trip(counter: &AtomicUsize, op: &str) -> StorageResult<()> {
        match counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)) {
            Ok(_) => Err(CoreError::Store(format!("{} failed", op))),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl KvStore for FaultyStore {
    async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        self.inner.set(key, value).await
    }

    async fn get_hash(&self, key: &str) -> StorageResult<HashMap<String, String>> {
        self.inner.get_hash(key).await
    }

    async fn merge_hash(&self, key: &str, fields: &[(String, String)]) -> StorageResult<()> {
        Self::trip(&self.merge_hash_failures, "HSET")?;
        self.inner.merge_hash(key, fields).await
    }

    async fn append_series(&self, key: &str, score: f64, member: &str) -> StorageResult<()> {
        self.inner.append_series(key, score, member).await
    }

    async fn range_series(&self, key: &str, min: f64, max: f64) -> StorageResult<Vec<String>> {
        self.inner.range_series(key, min, max).await
    }

    async fn latest_series(&self, key: &str, limit: usize) -> StorageResult<Vec<String>> {
        self.inner.latest_series(key, limit).await
    }

    async fn insert_set(&self, key: &str, member: &str) -> StorageResult<bool> {
        Self::trip(&self.insert_set_failures, "SADD")?;
        self.inner.insert_set(key, member).await
    }

    async fn remove_set(&self, key: &str, member: &str) -> StorageResult<()> {
        self.inner.remove_set(key, member).await
    }
}
