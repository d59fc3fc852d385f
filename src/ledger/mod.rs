//! Capability interface to the chain, the enhanced-transaction indexer and
//! the swap router
//!
//! The rest of the crate consumes only the `LedgerAdapter` trait; the
//! production implementation lives in `http`, tests script `mock`.

pub mod http;
#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;

pub const SOL_MINT: &str = "So11111111111111111111111111111111111111112";
pub const LAMPORTS_PER_SOL: f64 = 1_000_000_000.0;

/// Sentinel signature reported by dry-run executions
pub const DRY_RUN_SIGNATURE: &str = "DRY_RUN_NO_TX";

pub fn lamports_to_sol(lamports: u64) -> f64 {
    lamports as f64 / LAMPORTS_PER_SOL
}

pub fn sol_to_lamports(sol: f64) -> u64 {
    (sol * LAMPORTS_PER_SOL).floor() as u64
}

pub fn raw_to_ui(raw: u64, decimals: u8) -> f64 {
    raw as f64 / 10f64.powi(decimals as i32)
}

/// Transport or upstream failure from any adapter call
///
/// Carries the upstream message verbatim; the execution engine classifies
/// transient failures by substring match on it.
#[derive(Debug)]
pub struct AdapterError(pub String);

impl AdapterError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl fmt::Display for AdapterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for AdapterError {}

impl From<reqwest::Error> for AdapterError {
    fn from(err: reqwest::Error) -> Self {
        AdapterError(err.to_string())
    }
}

pub type AdapterResult<T> = Result<T, AdapterError>;

#[derive(Debug, Clone)]
pub struct SignatureInfo {
    pub signature: String,
    pub block_time: Option<i64>,
}

/// Post-processed view of an on-chain transaction from the indexer
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedTx {
    pub signature: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(rename = "type", default)]
    pub tx_type: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub token_transfers: Vec<TokenTransfer>,
    #[serde(default)]
    pub native_transfers: Vec<NativeTransfer>,
    #[serde(default)]
    pub events: TxEvents,
    #[serde(default)]
    pub account_data: Vec<AccountData>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenTransfer {
    #[serde(default)]
    pub from_user_account: Option<String>,
    #[serde(default)]
    pub to_user_account: Option<String>,
    #[serde(default)]
    pub mint: String,
    /// UI units as reported by the indexer
    #[serde(default)]
    pub token_amount: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NativeTransfer {
    #[serde(default)]
    pub from_user_account: String,
    #[serde(default)]
    pub to_user_account: String,
    /// Lamports
    #[serde(default)]
    pub amount: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TxEvents {
    #[serde(default)]
    pub swap: Option<SwapEvent>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapEvent {
    #[serde(default)]
    pub native_input: Option<NativeSide>,
    #[serde(default)]
    pub native_output: Option<NativeSide>,
    #[serde(default)]
    pub token_inputs: Vec<TokenSide>,
    #[serde(default)]
    pub token_outputs: Vec<TokenSide>,
}

/// Native leg of a recognized swap; amount is a lamport decimal string
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NativeSide {
    #[serde(default)]
    pub account: String,
    #[serde(default)]
    pub amount: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenSide {
    #[serde(default)]
    pub user_account: String,
    #[serde(default)]
    pub mint: String,
    #[serde(default)]
    pub raw_token_amount: RawTokenAmount,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTokenAmount {
    #[serde(default)]
    pub token_amount: String,
    #[serde(default)]
    pub decimals: u8,
}

impl RawTokenAmount {
    pub fn ui_amount(&self) -> f64 {
        let raw: f64 = self.token_amount.parse().unwrap_or(0.0);
        raw / 10f64.powi(self.decimals as i32)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountData {
    #[serde(default)]
    pub account: String,
    /// Lamport delta for the account, negative on spend
    #[serde(default)]
    pub native_balance_change: i64,
    #[serde(default)]
    pub token_balance_changes: Vec<TokenBalanceChange>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenBalanceChange {
    #[serde(default)]
    pub user_account: String,
    #[serde(default)]
    pub mint: String,
    #[serde(default)]
    pub raw_token_amount: RawTokenAmount,
}

/// Router quote; `raw` is echoed back verbatim on execution
#[derive(Debug, Clone)]
pub struct SwapQuote {
    pub input_mint: String,
    pub output_mint: String,
    pub in_amount: u64,
    pub out_amount: u64,
    pub slippage_bps: u16,
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct SwapOutcome {
    pub success: bool,
    pub signature: Option<String>,
    pub error: Option<String>,
    pub in_amount: u64,
    pub out_amount: u64,
}

#[derive(Debug, Clone)]
pub struct TokenRecipient {
    pub wallet: String,
    pub amount_raw: u64,
}

/// Everything the core needs from the outside world
#[async_trait]
pub trait LedgerAdapter: Send + Sync {
    /// Lamport balance of a system account
    async fn get_native_balance(&self, address: &str) -> AdapterResult<u64>;

    /// Raw token balance via the canonical associated account; missing
    /// account reads as zero
    async fn get_token_balance(&self, owner: &str, mint: &str) -> AdapterResult<u64>;

    /// Mint decimals, cached process-wide after the first fetch
    async fn get_token_decimals(&self, mint: &str) -> AdapterResult<u8>;

    async fn get_latest_blockhash(&self) -> AdapterResult<(String, u64)>;

    /// Paginated signature history, newest first
    async fn get_signatures_for_address(
        &self,
        address: &str,
        before: Option<&str>,
        limit: usize,
    ) -> AdapterResult<Vec<SignatureInfo>>;

    /// Enriched transactions from the indexer, newest first
    async fn fetch_enriched_transactions(
        &self,
        address: &str,
        limit: usize,
        before: Option<&str>,
    ) -> AdapterResult<Vec<EnrichedTx>>;

    async fn get_swap_quote(
        &self,
        input_mint: &str,
        output_mint: &str,
        amount: u64,
        slippage_bps: u16,
    ) -> AdapterResult<SwapQuote>;

    /// Execute a quoted swap with the treasury signer. In dry-run mode
    /// returns a synthetic success with the sentinel signature and performs
    /// no network I/O.
    async fn execute_swap(&self, quote: &SwapQuote) -> AdapterResult<SwapOutcome>;

    /// One signed transaction carrying token transfers to `recipients`,
    /// creating associated accounts where missing. Returns the confirmed
    /// signature.
    async fn send_token_batch(
        &self,
        mint: &str,
        recipients: &[TokenRecipient],
    ) -> AdapterResult<String>;

    /// Base58 address of the treasury signer
    fn treasury_address(&self) -> String;
}
