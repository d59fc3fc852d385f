//! Scripted in-memory adapter for unit tests

use super::{
    AdapterError, AdapterResult, EnrichedTx, LedgerAdapter, SignatureInfo, SwapOutcome, SwapQuote,
    TokenRecipient, DRY_RUN_SIGNATURE,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
pub struct MockLedger {
    pub treasury: String,
    pub decimals: u8,
    pub blockhash: String,
    pub dry_run: bool,
    pub native_balance: Mutex<u64>,
    pub token_balances: Mutex<HashMap<String, u64>>,
    /// Per-wallet signature history, newest first
    pub wallet_signatures: Mutex<HashMap<String, Vec<SignatureInfo>>>,
    /// Enriched transactions, newest first
    pub enriched: Mutex<Vec<EnrichedTx>>,
    pub quote_out_amount: Mutex<u64>,
    pub fail_native_balance: Mutex<Option<String>>,
    pub fail_token_balance: Mutex<Option<String>>,
    pub fail_quote: Mutex<Option<String>>,
    pub swap_business_error: Mutex<Option<String>>,
    pub fail_token_batch: Mutex<Option<String>>,
    pub fail_signatures: Mutex<Option<String>>,
    pub sent_batches: Mutex<Vec<Vec<TokenRecipient>>>,
    pub executed_swaps: Mutex<Vec<SwapQuote>>,
}

impl MockLedger {
    pub fn new() -> Self {
        Self {
            treasury: "TreasuryWallet".to_string(),
            decimals: 6,
            blockhash: "MockBlockhash".to_string(),
            quote_out_amount: Mutex::new(1_000_000),
            ..Default::default()
        }
    }

    pub fn set_token_balance(&self, wallet: &str, raw: u64) {
        self.token_balances
            .lock()
            .unwrap()
            .insert(wallet.to_string(), raw);
    }

    fn take_error(slot: &Mutex<Option<String>>) -> Option<AdapterError> {
        slot.lock().unwrap().as_ref().map(|m| AdapterError::new(m.clone()))
    }
}

#[async_trait]
impl LedgerAdapter for MockLedger {
    async fn get_native_balance(&self, _address: &str) -> AdapterResult<u64> {
        if let Some(err) = Self::take_error(&self.fail_native_balance) {
            return Err(err);
        }
        Ok(*self.native_balance.lock().unwrap())
    }

    async fn get_token_balance(&self, owner: &str, _mint: &str) -> AdapterResult<u64> {
        if let Some(err) = Self::take_error(&self.fail_token_balance) {
            return Err(err);
        }
        Ok(self
            .token_balances
            .lock()
            .unwrap()
            .get(owner)
            .copied()
            .unwrap_or(0))
    }

    async fn get_token_decimals(&self, _mint: &str) -> AdapterResult<u8> {
        Ok(self.decimals)
    }

    async fn get_latest_blockhash(&self) -> AdapterResult<(String, u64)> {
        Ok((self.blockhash.clone(), 1000))
    }

    async fn get_signatures_for_address(
        &self,
        address: &str,
        before: Option<&str>,
        limit: usize,
    ) -> AdapterResult<Vec<SignatureInfo>> {
        if let Some(err) = Self::take_error(&self.fail_signatures) {
            return Err(err);
        }
        let map = self.wallet_signatures.lock().unwrap();
        let history = match map.get(address) {
            Some(history) => history,
            None => return Ok(Vec::new()),
        };
        let start = match before {
            Some(sig) => match history.iter().position(|s| s.signature == sig) {
                Some(idx) => idx + 1,
                None => return Ok(Vec::new()),
            },
            None => 0,
        };
        Ok(history
            .iter()
            .skip(start)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn fetch_enriched_transactions(
        &self,
        _address: &str,
        limit: usize,
        before: Option<&str>,
    ) -> AdapterResult<Vec<EnrichedTx>> {
        let list = self.enriched.lock().unwrap();
        let start = match before {
            Some(sig) => match list.iter().position(|tx| tx.signature == sig) {
                Some(idx) => idx + 1,
                None => return Ok(Vec::new()),
            },
            None => 0,
        };
        Ok(list.iter().skip(start).take(limit).cloned().collect())
    }

    async fn get_swap_quote(
        &self,
        input_mint: &str,
        output_mint: &str,
        amount: u64,
        slippage_bps: u16,
    ) -> AdapterResult<SwapQuote> {
        if let Some(err) = Self::take_error(&self.fail_quote) {
            return Err(err);
        }
        Ok(SwapQuote {
            input_mint: input_mint.to_string(),
            output_mint: output_mint.to_string(),
            in_amount: amount,
            out_amount: *self.quote_out_amount.lock().unwrap(),
            slippage_bps,
            raw: serde_json::json!({}),
        })
    }

    async fn execute_swap(&self, quote: &SwapQuote) -> AdapterResult<SwapOutcome> {
        self.executed_swaps.lock().unwrap().push(quote.clone());
        if let Some(msg) = self.swap_business_error.lock().unwrap().clone() {
            return Ok(SwapOutcome {
                success: false,
                signature: None,
                error: Some(msg),
                in_amount: quote.in_amount,
                out_amount: 0,
            });
        }
        Ok(SwapOutcome {
            success: true,
            signature: Some(if self.dry_run {
                DRY_RUN_SIGNATURE.to_string()
            } else {
                format!("swap_sig_{}", self.executed_swaps.lock().unwrap().len())
            }),
            error: None,
            in_amount: quote.in_amount,
            out_amount: quote.out_amount,
        })
    }

    async fn send_token_batch(
        &self,
        _mint: &str,
        recipients: &[TokenRecipient],
    ) -> AdapterResult<String> {
        if let Some(err) = Self::take_error(&self.fail_token_batch) {
            return Err(err);
        }
        let mut batches = self.sent_batches.lock().unwrap();
        batches.push(recipients.to_vec());
        Ok(format!("batch_sig_{}", batches.len()))
    }

    fn treasury_address(&self) -> String {
        self.treasury.clone()
    }
}
