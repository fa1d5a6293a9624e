// Native RPC client implementation wrapping solana_client::RpcClient

use crate::error::CoreError;
use crate::models::SignatureInfo;
use crate::rpc_client::{ChainReader, RpcResult};
use async_trait::async_trait;
use log::{debug, warn};
use serde_json::{json, Value};
use solana_account_decoder::UiAccountData;
use solana_client::client_error::Result as ClientResult;
use solana_client::rpc_client::{GetConfirmedSignaturesForAddress2Config, RpcClient as SolanaRpcClient};
use solana_client::rpc_request::{RpcRequest, TokenAccountsFilter};
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signature};
use solana_sdk::signer::Signer;
use solana_sdk::system_instruction;
use solana_sdk::transaction::Transaction;
use solana_transaction_status::UiTransactionEncoding;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Native RPC client over a primary endpoint and an optional fallback.
/// Reads that fail on the primary are retried once on the fallback; the
/// transfer is only ever sent through the primary.
pub struct NativeRpcClient {
    primary: Arc<SolanaRpcClient>,
    fallback: Option<Arc<SolanaRpcClient>>,
}

impl NativeRpcClient {
    pub fn new(primary_url: String, fallback_url: Option<String>, timeout: Duration) -> Self {
        let connect = |url: String| {
            Arc::new(SolanaRpcClient::new_with_timeout_and_commitment(
                url,
                timeout,
                CommitmentConfig::confirmed(),
            ))
        };
        Self {
            primary: connect(primary_url),
            fallback: fallback_url.filter(|u| !u.trim().is_empty()).map(connect),
        }
    }

    async fn call<T, F>(&self, op: &'static str, f: F) -> RpcResult<T>
    where
        T: Send + 'static,
        F: Fn(&SolanaRpcClient) -> ClientResult<T> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        match run_blocking(self.primary.clone(), f.clone()).await {
            Ok(value) => Ok(value),
            Err(primary_err) => match &self.fallback {
                Some(fallback) => {
                    warn!("{} failed on primary RPC ({}), trying fallback", op, primary_err);
                    run_blocking(fallback.clone(), f)
                        .await
                        .map_err(|e| CoreError::Rpc(format!("{} failed on both endpoints: {}", op, e)))
                }
                None => Err(CoreError::Rpc(format!("{} failed: {}", op, primary_err))),
            },
        }
    }
}

async fn run_blocking<T, F>(client: Arc<SolanaRpcClient>, f: Arc<F>) -> Result<T, String>
where
    T: Send + 'static,
    F: Fn(&SolanaRpcClient) -> ClientResult<T> + Send + Sync + 'static,
{
    tokio::task::spawn_blocking(move || f(&client))
        .await
        .map_err(|e| format!("Task join error: {}", e))?
        .map_err(|e| e.to_string())
}

fn parse_pubkey(address: &str) -> RpcResult<Pubkey> {
    Pubkey::from_str(address).map_err(|e| CoreError::ParseError(format!("Invalid pubkey {}: {}", address, e)))
}

fn parse_amount(raw: &str) -> RpcResult<u64> {
    raw.parse::<u64>()
        .map_err(|e| CoreError::ParseError(format!("Invalid token amount {}: {}", raw, e)))
}

#[async_trait]
impl ChainReader for NativeRpcClient {
    async fn get_account_data(&self, address: &str) -> RpcResult<Option<Vec<u8>>> {
        debug!("Native RPC: get_account_data for {}", address);
        let pubkey = parse_pubkey(address)?;
        let response = self
            .call("getAccountInfo", move |c| {
                c.get_account_with_commitment(&pubkey, CommitmentConfig::confirmed())
            })
            .await?;
        Ok(response.value.map(|account| account.data))
    }

    async fn get_balance(&self, address: &str) -> RpcResult<u64> {
        debug!("Native RPC: get_balance for {}", address);
        let pubkey = parse_pubkey(address)?;
        self.call("getBalance", move |c| c.get_balance(&pubkey)).await
    }

    async fn get_token_balance(&self, owner: &str, mint: &str) -> RpcResult<u64> {
        debug!("Native RPC: get_token_balance for {} / {}", owner, mint);
        let owner_pk = parse_pubkey(owner)?;
        let mint_pk = parse_pubkey(mint)?;
        let accounts = self
            .call("getTokenAccountsByOwner", move |c| {
                c.get_token_accounts_by_owner(&owner_pk, TokenAccountsFilter::Mint(mint_pk))
            })
            .await?;

        let mut total = 0u64;
        for keyed in accounts {
            let UiAccountData::Json(parsed) = &keyed.account.data else {
                return Err(CoreError::ParseError(format!(
                    "Token account {} not returned as jsonParsed",
                    keyed.pubkey
                )));
            };
            let amount = parsed
                .parsed
                .get("info")
                .and_then(|i| i.get("tokenAmount"))
                .and_then(|t| t.get("amount"))
                .and_then(|a| a.as_str())
                .ok_or_else(|| CoreError::ParseError(format!("Missing tokenAmount on {}", keyed.pubkey)))?;
            total = total.saturating_add(parse_amount(amount)?);
        }
        Ok(total)
    }

    async fn get_token_supply(&self, mint: &str) -> RpcResult<u64> {
        debug!("Native RPC: get_token_supply for {}", mint);
        let mint_pk = parse_pubkey(mint)?;
        let supply = self.call("getTokenSupply", move |c| c.get_token_supply(&mint_pk)).await?;
        parse_amount(&supply.amount)
    }

    async fn get_signatures_for_address(
        &self,
        address: &str,
        until: Option<&str>,
        limit: usize,
    ) -> RpcResult<Vec<SignatureInfo>> {
        debug!("Native RPC: get_signatures_for_address {} until {:?}", address, until);
        let pubkey = parse_pubkey(address)?;
        let until = until
            .map(|s| Signature::from_str(s).map_err(|e| CoreError::ParseError(format!("Invalid signature: {}", e))))
            .transpose()?;
        let statuses = self
            .call("getSignaturesForAddress", move |c| {
                c.get_signatures_for_address_with_config(
                    &pubkey,
                    GetConfirmedSignaturesForAddress2Config {
                        before: None,
                        until,
                        limit: Some(limit),
                        commitment: Some(CommitmentConfig::confirmed()),
                    },
                )
            })
            .await?;

        Ok(statuses
            .into_iter()
            .map(|s| SignatureInfo {
                signature: s.signature,
                slot: s.slot,
                failed: s.err.is_some(),
            })
            .collect())
    }

    async fn get_transaction(&self, signature: &str) -> RpcResult<Option<Value>> {
        debug!("Native RPC: get_transaction for {}", signature);
        let params = json!([
            signature,
            {
                "encoding": UiTransactionEncoding::JsonParsed,
                "commitment": "confirmed",
                "maxSupportedTransactionVersion": 0
            }
        ]);
        // Raw request so an unknown signature comes back as `null` instead of an error.
        let tx: Value = self
            .call("getTransaction", move |c| c.send(RpcRequest::GetTransaction, params.clone()))
            .await?;
        Ok(if tx.is_null() { None } else { Some(tx) })
    }

    async fn transfer_lamports(&self, from: &Keypair, to: &str, lamports: u64) -> RpcResult<String> {
        let to_pk = parse_pubkey(to)?;
        let client = self.primary.clone();
        let blockhash = tokio::task::spawn_blocking(move || client.get_latest_blockhash())
            .await
            .map_err(|e| CoreError::Rpc(format!("Task join error: {}", e)))?
            .map_err(|e| CoreError::Rpc(format!("get_latest_blockhash failed: {}", e)))?;

        let ix = system_instruction::transfer(&from.pubkey(), &to_pk, lamports);
        let tx = Transaction::new_signed_with_payer(&[ix], Some(&from.pubkey()), &[from], blockhash);
        debug!("Native RPC: sending {} lamports {} -> {}", lamports, from.pubkey(), to);

        let client = self.primary.clone();
        let signature = tokio::task::spawn_blocking(move || client.send_and_confirm_transaction(&tx))
            .await
            .map_err(|e| CoreError::Rpc(format!("Task join error: {}", e)))?
            .map_err(|e| CoreError::Transaction(format!("transfer failed: {}", e)))?;
        Ok(signature.to_string())
    }
}
