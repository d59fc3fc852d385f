//! Buy job: treasury SOL into the configured token through the swap router
//!
//! Every invocation records a round, whether it skipped, failed or succeeded;
//! failed attempts consume the interval slot.

use super::record_attempt;
use crate::clock::{new_round_id, now_ts};
use crate::config::Config;
use crate::engine::{Job, JobError};
use crate::ledger::{
    lamports_to_sol, raw_to_ui, sol_to_lamports, LedgerAdapter, SOL_MINT,
};
use crate::store::{LockType, Round, RoundType, Store};
use async_trait::async_trait;
use std::sync::Arc;

pub struct BuyJob {
    store: Store,
    ledger: Arc<dyn LedgerAdapter>,
    config: Arc<Config>,
}

impl BuyJob {
    pub fn new(store: Store, ledger: Arc<dyn LedgerAdapter>, config: Arc<Config>) -> Self {
        Self {
            store,
            ledger,
            config,
        }
    }

    fn record(
        &self,
        ts: i64,
        txs: Vec<String>,
        sol_spent: f64,
        token_received: f64,
        spendable: Option<f64>,
        success: bool,
        error: Option<String>,
    ) {
        let round = Round {
            id: new_round_id(),
            round_type: RoundType::Buy,
            ts,
            txs,
            meta: serde_json::json!({
                "solSpent": sol_spent,
                "tokenReceived": token_received,
                "success": success,
                "error": error,
                "safetyCap": self.config.max_buy_per_interval_sol,
                "spendableBeforeCap": spendable,
            }),
        };
        record_attempt(&self.store, &self.config.public_dir, &round);
    }
}

#[async_trait]
impl Job for BuyJob {
    fn name(&self) -> &'static str {
        "buy job"
    }

    fn lock_type(&self) -> LockType {
        LockType::BuyJob
    }

    fn timeout_ms(&self) -> u64 {
        self.config.buy_job_timeout_ms
    }

    async fn run(&self) -> Result<String, JobError> {
        let started = now_ts();
        let treasury = self.ledger.treasury_address();

        let native = match self.ledger.get_native_balance(&treasury).await {
            Ok(lamports) => lamports,
            Err(e) => {
                self.record(started, vec![], 0.0, 0.0, None, false, Some(e.to_string()));
                return Err(Box::new(e));
            }
        };
        let balance_sol = lamports_to_sol(native);
        let spendable = (balance_sol - self.config.fee_reserve_sol).max(0.0);
        let actual_buy = spendable.min(self.config.max_buy_per_interval_sol);

        if actual_buy < self.config.min_buy_sol {
            let reason = format!(
                "buy amount {:.6} SOL below minimum {:.6}",
                actual_buy, self.config.min_buy_sol
            );
            self.record(
                started,
                vec![],
                actual_buy,
                0.0,
                Some(spendable),
                false,
                Some(reason.clone()),
            );
            return Ok(format!("skipped: {}", reason));
        }

        let decimals = match self.ledger.get_token_decimals(&self.config.token_mint).await {
            Ok(decimals) => decimals,
            Err(e) => {
                self.record(
                    started,
                    vec![],
                    actual_buy,
                    0.0,
                    Some(spendable),
                    false,
                    Some(e.to_string()),
                );
                return Err(Box::new(e));
            }
        };

        let in_lamports = sol_to_lamports(actual_buy);
        let quote = match self
            .ledger
            .get_swap_quote(
                SOL_MINT,
                &self.config.token_mint,
                in_lamports,
                self.config.slippage_bps,
            )
            .await
        {
            Ok(quote) => quote,
            Err(e) => {
                self.record(
                    started,
                    vec![],
                    actual_buy,
                    0.0,
                    Some(spendable),
                    false,
                    Some(e.to_string()),
                );
                return Err(Box::new(e));
            }
        };

        let outcome = match self.ledger.execute_swap(&quote).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.record(
                    started,
                    vec![],
                    actual_buy,
                    0.0,
                    Some(spendable),
                    false,
                    Some(e.to_string()),
                );
                return Err(Box::new(e));
            }
        };

        let token_received = raw_to_ui(outcome.out_amount, decimals);
        let txs: Vec<String> = outcome.signature.iter().cloned().collect();
        self.record(
            started,
            txs.clone(),
            actual_buy,
            token_received,
            Some(spendable),
            outcome.success,
            outcome.error.clone(),
        );

        if outcome.success {
            Ok(format!(
                "bought {:.4} tokens for {:.6} SOL ({})",
                token_received,
                actual_buy,
                txs.first().map(String::as_str).unwrap_or("no signature")
            ))
        } else {
            // Business failure: recorded in the round, not counted as an
            // RPC error
            Ok(format!(
                "swap rejected: {}",
                outcome.error.unwrap_or_else(|| "unknown".to_string())
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::mock::MockLedger;
    use crate::ledger::sol_to_lamports;

    fn config() -> Config {
        let mut config = Config::from_env();
        config.token_mint = "Mint11111111111111111111111111111111111111".to_string();
        config.fee_reserve_sol = 0.03;
        config.min_buy_sol = 0.01;
        config.max_buy_per_interval_sol = 0.2;
        config.public_dir = tempfile::tempdir()
            .unwrap()
            .into_path()
            .to_str()
            .unwrap()
            .to_string();
        config
    }

    fn job(ledger: Arc<MockLedger>, config: Config) -> (BuyJob, Store) {
        let store = Store::open_in_memory().unwrap();
        (
            BuyJob::new(store.clone(), ledger, Arc::new(config)),
            store,
        )
    }

    #[tokio::test]
    async fn test_skip_below_minimum_records_round() {
        // 0.035 SOL minus the 0.03 fee reserve leaves only 0.005 spendable
        let ledger = Arc::new(MockLedger::new());
        *ledger.native_balance.lock().unwrap() = sol_to_lamports(0.035);
        let (job, store) = job(ledger.clone(), config());

        let summary = job.run().await.unwrap();
        assert!(summary.starts_with("skipped"));
        assert!(ledger.executed_swaps.lock().unwrap().is_empty());

        let round = store.latest_round(RoundType::Buy).unwrap().unwrap();
        assert!(round.txs.is_empty());
        assert_eq!(round.meta["success"], false);
        let sol_spent = round.meta["solSpent"].as_f64().unwrap();
        assert!((sol_spent - 0.005).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_cap_applies_before_quote() {
        // A 10 SOL balance is capped to 0.2 per interval
        let ledger = Arc::new(MockLedger::new());
        *ledger.native_balance.lock().unwrap() = sol_to_lamports(10.0);
        *ledger.quote_out_amount.lock().unwrap() = 123_000_000;
        let (job, store) = job(ledger.clone(), config());

        job.run().await.unwrap();

        let swaps = ledger.executed_swaps.lock().unwrap();
        assert_eq!(swaps.len(), 1);
        assert_eq!(swaps[0].in_amount, 200_000_000);

        let round = store.latest_round(RoundType::Buy).unwrap().unwrap();
        assert_eq!(round.meta["success"], true);
        assert_eq!(round.meta["safetyCap"].as_f64().unwrap(), 0.2);
        let spendable = round.meta["spendableBeforeCap"].as_f64().unwrap();
        assert!((spendable - 9.97).abs() < 1e-9);
        // 123_000_000 raw at 6 decimals
        let received = round.meta["tokenReceived"].as_f64().unwrap();
        assert!((received - 123.0).abs() < 1e-9);
        assert_eq!(round.txs.len(), 1);
    }

    #[tokio::test]
    async fn test_swap_business_failure_records_round_without_error() {
        let ledger = Arc::new(MockLedger::new());
        *ledger.native_balance.lock().unwrap() = sol_to_lamports(1.0);
        *ledger.swap_business_error.lock().unwrap() =
            Some("slippage tolerance exceeded".to_string());
        let (job, store) = job(ledger, config());

        // Business failures complete the job; the round carries the error
        let summary = job.run().await.unwrap();
        assert!(summary.contains("swap rejected"));
        let round = store.latest_round(RoundType::Buy).unwrap().unwrap();
        assert_eq!(round.meta["success"], false);
        assert_eq!(round.meta["error"], "slippage tolerance exceeded");
        assert!(round.txs.is_empty());
    }

    #[tokio::test]
    async fn test_transport_failure_still_records_round() {
        let ledger = Arc::new(MockLedger::new());
        *ledger.fail_native_balance.lock().unwrap() = Some("503 upstream".to_string());
        let (job, store) = job(ledger, config());

        let err = job.run().await.unwrap_err();
        assert!(err.to_string().contains("503"));
        // Failed attempts still consume the slot
        let round = store.latest_round(RoundType::Buy).unwrap().unwrap();
        assert_eq!(round.meta["success"], false);
        assert!(round.meta["error"].as_str().unwrap().contains("503"));
    }
}
