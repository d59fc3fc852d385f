//! Production ledger adapter
//!
//! Chain reads go through the JSON-RPC client, enriched transactions come
//! from the indexer's enhanced-transaction API, swaps go through the router's
//! quote/swap endpoints with local signing.

use super::{
    AdapterError, AdapterResult, EnrichedTx, LedgerAdapter, SignatureInfo, SwapOutcome, SwapQuote,
    TokenRecipient, DRY_RUN_SIGNATURE,
};
use crate::config::Config;
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_client::GetConfirmedSignaturesForAddress2Config;
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signature, Signer};
use solana_sdk::transaction::{Transaction, VersionedTransaction};
use std::collections::HashMap;
use std::fs;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::sleep;

/// Retry pacing for indexer fetches; transient upstream hiccups are common
struct Backoff {
    delay_ms: u64,
    max_delay_ms: u64,
    attempts_left: u32,
}

impl Backoff {
    fn new(initial_ms: u64, max_ms: u64, attempts: u32) -> Self {
        Self {
            delay_ms: initial_ms,
            max_delay_ms: max_ms,
            attempts_left: attempts,
        }
    }

    async fn sleep(&mut self) -> bool {
        if self.attempts_left == 0 {
            return false;
        }
        self.attempts_left -= 1;
        sleep(Duration::from_millis(self.delay_ms)).await;
        self.delay_ms = (self.delay_ms * 2).min(self.max_delay_ms);
        true
    }
}

pub struct HttpLedger {
    rpc: RpcClient,
    http: reqwest::Client,
    indexer_url: String,
    indexer_api_key: String,
    swap_api_url: String,
    treasury: Keypair,
    dry_run: bool,
    decimals_cache: Mutex<HashMap<String, u8>>,
}

fn load_keypair(path: &str) -> Result<Keypair, AdapterError> {
    let raw = fs::read_to_string(path)
        .map_err(|e| AdapterError::new(format!("cannot read keypair {}: {}", path, e)))?;
    let bytes: Vec<u8> = serde_json::from_str(&raw)
        .map_err(|e| AdapterError::new(format!("keypair {} is not a JSON byte array: {}", path, e)))?;
    Keypair::from_bytes(&bytes)
        .map_err(|e| AdapterError::new(format!("keypair {} rejected: {}", path, e)))
}

fn parse_pubkey(address: &str) -> AdapterResult<Pubkey> {
    Pubkey::from_str(address).map_err(|e| AdapterError::new(format!("bad address {}: {}", address, e)))
}

impl HttpLedger {
    pub fn new(config: &Config) -> AdapterResult<Self> {
        // Dry-run without a keypair file still needs a pubkey to quote against
        let treasury = if config.treasury_keypair_path.is_empty() {
            Keypair::new()
        } else {
            load_keypair(&config.treasury_keypair_path)?
        };

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            rpc: RpcClient::new(config.rpc_url.clone()),
            http,
            indexer_url: config.indexer_url.trim_end_matches('/').to_string(),
            indexer_api_key: config.indexer_api_key.clone(),
            swap_api_url: config.swap_api_url.trim_end_matches('/').to_string(),
            treasury,
            dry_run: config.dry_run,
            decimals_cache: Mutex::new(HashMap::new()),
        })
    }

    fn associated_account(&self, owner: &Pubkey, mint: &Pubkey) -> Pubkey {
        spl_associated_token_account::get_associated_token_address(owner, mint)
    }
}

#[async_trait]
impl LedgerAdapter for HttpLedger {
    async fn get_native_balance(&self, address: &str) -> AdapterResult<u64> {
        let pubkey = parse_pubkey(address)?;
        self.rpc
            .get_balance(&pubkey)
            .await
            .map_err(|e| AdapterError::new(e.to_string()))
    }

    async fn get_token_balance(&self, owner: &str, mint: &str) -> AdapterResult<u64> {
        let owner = parse_pubkey(owner)?;
        let mint = parse_pubkey(mint)?;
        let ata = self.associated_account(&owner, &mint);
        match self.rpc.get_token_account_balance(&ata).await {
            Ok(balance) => Ok(balance.amount.parse().unwrap_or(0)),
            Err(e) => {
                let msg = e.to_string();
                // A wallet that never held the token has no associated account
                if msg.contains("could not find account") || msg.contains("AccountNotFound") {
                    Ok(0)
                } else {
                    Err(AdapterError::new(msg))
                }
            }
        }
    }

    async fn get_token_decimals(&self, mint: &str) -> AdapterResult<u8> {
        {
            let cache = self.decimals_cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(decimals) = cache.get(mint) {
                return Ok(*decimals);
            }
        }
        let pubkey = parse_pubkey(mint)?;
        let supply = self
            .rpc
            .get_token_supply(&pubkey)
            .await
            .map_err(|e| AdapterError::new(e.to_string()))?;
        let mut cache = self.decimals_cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert(mint.to_string(), supply.decimals);
        Ok(supply.decimals)
    }

    async fn get_latest_blockhash(&self) -> AdapterResult<(String, u64)> {
        let (hash, last_valid_height) = self
            .rpc
            .get_latest_blockhash_with_commitment(CommitmentConfig::confirmed())
            .await
            .map_err(|e| AdapterError::new(e.to_string()))?;
        Ok((hash.to_string(), last_valid_height))
    }

    async fn get_signatures_for_address(
        &self,
        address: &str,
        before: Option<&str>,
        limit: usize,
    ) -> AdapterResult<Vec<SignatureInfo>> {
        let pubkey = parse_pubkey(address)?;
        let before = match before {
            Some(sig) => Some(
                Signature::from_str(sig)
                    .map_err(|e| AdapterError::new(format!("bad signature {}: {}", sig, e)))?,
            ),
            None => None,
        };
        let statuses = self
            .rpc
            .get_signatures_for_address_with_config(
                &pubkey,
                GetConfirmedSignaturesForAddress2Config {
                    before,
                    until: None,
                    limit: Some(limit),
                    commitment: Some(CommitmentConfig::confirmed()),
                },
            )
            .await
            .map_err(|e| AdapterError::new(e.to_string()))?;
        Ok(statuses
            .into_iter()
            .map(|s| SignatureInfo {
                signature: s.signature,
                block_time: s.block_time,
            })
            .collect())
    }

    async fn fetch_enriched_transactions(
        &self,
        address: &str,
        limit: usize,
        before: Option<&str>,
    ) -> AdapterResult<Vec<EnrichedTx>> {
        let mut url = format!(
            "{}/addresses/{}/transactions?api-key={}&limit={}",
            self.indexer_url, address, self.indexer_api_key, limit
        );
        if let Some(before) = before {
            url.push_str(&format!("&before={}", before));
        }

        let mut backoff = Backoff::new(1_000, 8_000, 3);
        loop {
            let result = async {
                let response = self.http.get(&url).send().await?;
                if !response.status().is_success() {
                    return Err(AdapterError::new(format!(
                        "indexer error: {}",
                        response.status()
                    )));
                }
                let txs: Vec<EnrichedTx> = response.json().await?;
                Ok(txs)
            }
            .await;

            match result {
                Ok(txs) => return Ok(txs),
                Err(e) => {
                    log::warn!("⚠️  Indexer fetch failed, retrying: {}", e);
                    if !backoff.sleep().await {
                        return Err(e);
                    }
                }
            }
        }
    }

    async fn get_swap_quote(
        &self,
        input_mint: &str,
        output_mint: &str,
        amount: u64,
        slippage_bps: u16,
    ) -> AdapterResult<SwapQuote> {
        let url = format!(
            "{}/quote?inputMint={}&outputMint={}&amount={}&slippageBps={}",
            self.swap_api_url, input_mint, output_mint, amount, slippage_bps
        );
        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(AdapterError::new(format!(
                "quote error: {}",
                response.status()
            )));
        }
        let raw: serde_json::Value = response.json().await?;
        let in_amount = raw["inAmount"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .unwrap_or(amount);
        let out_amount = raw["outAmount"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| AdapterError::new("quote missing outAmount"))?;
        Ok(SwapQuote {
            input_mint: input_mint.to_string(),
            output_mint: output_mint.to_string(),
            in_amount,
            out_amount,
            slippage_bps,
            raw,
        })
    }

    async fn execute_swap(&self, quote: &SwapQuote) -> AdapterResult<SwapOutcome> {
        if self.dry_run {
            return Ok(SwapOutcome {
                success: true,
                signature: Some(DRY_RUN_SIGNATURE.to_string()),
                error: None,
                in_amount: quote.in_amount,
                out_amount: quote.out_amount,
            });
        }

        let body = serde_json::json!({
            "quoteResponse": quote.raw,
            "userPublicKey": self.treasury.pubkey().to_string(),
            "wrapAndUnwrapSol": true,
        });
        let response = self
            .http
            .post(format!("{}/swap", self.swap_api_url))
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(AdapterError::new(format!(
                "swap build error: {}",
                response.status()
            )));
        }
        let payload: serde_json::Value = response.json().await?;
        let tx_b64 = payload["swapTransaction"]
            .as_str()
            .ok_or_else(|| AdapterError::new("swap response missing transaction"))?;
        let tx_bytes = general_purpose::STANDARD
            .decode(tx_b64)
            .map_err(|e| AdapterError::new(format!("swap transaction not base64: {}", e)))?;
        let unsigned: VersionedTransaction = bincode::deserialize(&tx_bytes)
            .map_err(|e| AdapterError::new(format!("swap transaction malformed: {}", e)))?;
        let signed = VersionedTransaction::try_new(unsigned.message, &[&self.treasury])
            .map_err(|e| AdapterError::new(format!("signing failed: {}", e)))?;

        match self.rpc.send_and_confirm_transaction(&signed).await {
            Ok(signature) => Ok(SwapOutcome {
                success: true,
                signature: Some(signature.to_string()),
                error: None,
                in_amount: quote.in_amount,
                out_amount: quote.out_amount,
            }),
            // Submission failures are business outcomes, not transport errors:
            // the round still records the attempt
            Err(e) => Ok(SwapOutcome {
                success: false,
                signature: None,
                error: Some(e.to_string()),
                in_amount: quote.in_amount,
                out_amount: 0,
            }),
        }
    }

    async fn send_token_batch(
        &self,
        mint: &str,
        recipients: &[TokenRecipient],
    ) -> AdapterResult<String> {
        if self.dry_run {
            return Ok(DRY_RUN_SIGNATURE.to_string());
        }
        if recipients.is_empty() {
            return Err(AdapterError::new("empty transfer batch"));
        }

        let mint_pubkey = parse_pubkey(mint)?;
        let payer = self.treasury.pubkey();
        let source = self.associated_account(&payer, &mint_pubkey);

        let mut instructions = Vec::new();
        for recipient in recipients {
            let owner = parse_pubkey(&recipient.wallet)?;
            let destination = self.associated_account(&owner, &mint_pubkey);
            if self.rpc.get_account(&destination).await.is_err() {
                instructions.push(
                    spl_associated_token_account::instruction::create_associated_token_account(
                        &payer,
                        &owner,
                        &mint_pubkey,
                        &spl_token::id(),
                    ),
                );
            }
            instructions.push(
                spl_token::instruction::transfer(
                    &spl_token::id(),
                    &source,
                    &destination,
                    &payer,
                    &[],
                    recipient.amount_raw,
                )
                .map_err(|e| AdapterError::new(format!("transfer instruction: {}", e)))?,
            );
        }

        let blockhash = self
            .rpc
            .get_latest_blockhash()
            .await
            .map_err(|e| AdapterError::new(e.to_string()))?;
        let tx = Transaction::new_signed_with_payer(
            &instructions,
            Some(&payer),
            &[&self.treasury],
            blockhash,
        );
        let signature = self
            .rpc
            .send_and_confirm_transaction(&tx)
            .await
            .map_err(|e| AdapterError::new(e.to_string()))?;
        Ok(signature.to_string())
    }

    fn treasury_address(&self) -> String {
        self.treasury.pubkey().to_string()
    }
}
