//! Reward job: lottery-distribute a slice of the treasury token balance
//!
//! The draw is reproducible from the round meta alone: seed inputs, the
//! derived seed and the bps caps are all recorded.

use super::record_attempt;
use crate::clock::{new_round_id, now_ts};
use crate::config::Config;
use crate::engine::{Job, JobError};
use crate::ledger::{raw_to_ui, LedgerAdapter, TokenRecipient, DRY_RUN_SIGNATURE};
use crate::lottery;
use crate::refresher;
use crate::scanner::Scanner;
use crate::store::{LockType, Round, RoundType, Store};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

const BATCH_DELAY_MS: u64 = 500;

pub struct RewardJob {
    store: Store,
    ledger: Arc<dyn LedgerAdapter>,
    config: Arc<Config>,
}

impl RewardJob {
    pub fn new(store: Store, ledger: Arc<dyn LedgerAdapter>, config: Arc<Config>) -> Self {
        Self {
            store,
            ledger,
            config,
        }
    }

    fn min_age_seconds(&self) -> i64 {
        (self.config.min_wallet_age_days * 86_400.0) as i64
    }

    fn record_skip(&self, ts: i64, reason: &str) {
        let round = Round {
            id: new_round_id(),
            round_type: RoundType::Reward,
            ts,
            txs: vec![],
            meta: serde_json::json!({
                "winnersCount": 0,
                "perWinnerUi": 0.0,
                "totalDistributedUi": 0.0,
                "success": false,
                "error": reason,
                "rewardPercentBps": self.config.reward_percent_bps,
                "maxRewardPercentBps": self.config.max_reward_percent_bps,
            }),
        };
        record_attempt(&self.store, &self.config.public_dir, &round);
    }
}

#[async_trait]
impl Job for RewardJob {
    fn name(&self) -> &'static str {
        "reward job"
    }

    fn lock_type(&self) -> LockType {
        LockType::RewardJob
    }

    fn timeout_ms(&self) -> u64 {
        self.config.reward_job_timeout_ms
    }

    async fn run(&self) -> Result<String, JobError> {
        let started = now_ts();
        let mint = self.config.token_mint.clone();
        let treasury = self.ledger.treasury_address();

        // Fresh holder state first, so the lottery sees what the chain sees
        let scanner = Scanner::new(self.store.clone(), self.ledger.clone(), mint.clone());
        scanner.incremental(self.config.scan_signature_limit).await?;
        refresher::refresh_balances(&self.store, self.ledger.as_ref(), &mint, started).await?;

        let decimals = self.ledger.get_token_decimals(&mint).await?;
        let treasury_raw = self.ledger.get_token_balance(&treasury, &mint).await?;
        if treasury_raw == 0 {
            let reason = "treasury token balance is zero";
            self.record_skip(started, reason);
            return Ok(format!("skipped: {}", reason));
        }

        let pct_bps = self
            .config
            .reward_percent_bps
            .min(self.config.max_reward_percent_bps);
        let distribute_raw = (treasury_raw as u128 * pct_bps as u128 / 10_000) as u64;
        if distribute_raw == 0 {
            let reason = "distribution rounds to zero";
            self.record_skip(started, reason);
            return Ok(format!("skipped: {}", reason));
        }

        let eligible = self.store.eligible_holders(
            started,
            self.min_age_seconds(),
            self.config.min_continuity_seconds,
            self.config.min_cumulative_buy_sol,
        )?;
        if eligible.is_empty() {
            let reason = "no eligible holders";
            self.record_skip(started, reason);
            return Ok(format!("skipped: {}", reason));
        }

        // Lottery context: the blockhash pins the draw to chain state
        let (blockhash, _) = self.ledger.get_latest_blockhash().await?;
        let seed = lottery::derive_seed(started, &mint, &blockhash);
        let weighted: Vec<(String, f64)> = eligible
            .iter()
            .map(|holder| (holder.wallet.clone(), lottery::weigh_holder(holder, started)))
            .collect();
        let winners = lottery::select_winners(&weighted, self.config.winners_per_round, seed);
        if winners.is_empty() {
            let reason = "no winners drawn";
            self.record_skip(started, reason);
            return Ok(format!("skipped: {}", reason));
        }

        // Integer split; the residual stays in the treasury
        let per_winner = distribute_raw / winners.len() as u64;
        if per_winner == 0 {
            let reason = "per-winner amount rounds to zero";
            self.record_skip(started, reason);
            return Ok(format!("skipped: {}", reason));
        }

        let mut txs: Vec<String> = Vec::new();
        let mut failed_batches = 0usize;
        if self.config.dry_run {
            txs.push(format!("{}_1", DRY_RUN_SIGNATURE));
            txs.push(format!("{}_2", DRY_RUN_SIGNATURE));
        } else {
            let recipients: Vec<TokenRecipient> = winners
                .iter()
                .map(|wallet| TokenRecipient {
                    wallet: wallet.clone(),
                    amount_raw: per_winner,
                })
                .collect();
            for (batch_idx, batch) in recipients.chunks(self.config.max_sends_per_tx).enumerate() {
                if batch_idx > 0 {
                    sleep(Duration::from_millis(BATCH_DELAY_MS)).await;
                }
                match self.ledger.send_token_batch(&mint, batch).await {
                    Ok(signature) => txs.push(signature),
                    // One bad batch must not starve the rest of the winners
                    Err(e) => {
                        failed_batches += 1;
                        log::error!("❌ Transfer batch {} failed: {}", batch_idx, e);
                    }
                }
            }
        }

        // Every eligible holder earns streak and time-weighted credit
        let interval_hours = self.config.reward_interval_seconds as f64 / 3_600.0;
        for holder in &eligible {
            let balance_ui = raw_to_ui(holder.last_balance_raw, decimals);
            if let Err(e) = self
                .store
                .bump_streak_and_twb(&holder.wallet, balance_ui * interval_hours)
            {
                log::debug!("⚠️  Streak update failed for {}: {}", holder.wallet, e);
            }
        }

        let per_winner_ui = raw_to_ui(per_winner, decimals);
        let total_ui = raw_to_ui(per_winner * winners.len() as u64, decimals);
        let success = self.config.dry_run || !txs.is_empty();
        let round = Round {
            id: new_round_id(),
            round_type: RoundType::Reward,
            ts: started,
            txs: txs.clone(),
            meta: serde_json::json!({
                "winnersCount": winners.len(),
                "perWinnerUi": per_winner_ui,
                "totalDistributedUi": total_ui,
                "lotterySeed": seed,
                "lotteryTimestamp": started,
                "lotteryBlockhash": blockhash,
                "rewardPercentBps": self.config.reward_percent_bps,
                "maxRewardPercentBps": self.config.max_reward_percent_bps,
                "success": success,
                "failedBatches": failed_batches,
                "dryRun": self.config.dry_run,
            }),
        };
        record_attempt(&self.store, &self.config.public_dir, &round);

        Ok(format!(
            "distributed {:.4} tokens to {} winners ({:.4} each, {} txs{})",
            total_ui,
            winners.len(),
            per_winner_ui,
            txs.len(),
            if self.config.dry_run { ", dry run" } else { "" }
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::mock::MockLedger;
    use crate::store::HolderUpdate;

    const MINT: &str = "Mint11111111111111111111111111111111111111";

    fn config(dry_run: bool) -> Config {
        let mut config = Config::from_env();
        config.token_mint = MINT.to_string();
        config.dry_run = dry_run;
        config.winners_per_round = 3;
        config.max_sends_per_tx = 2;
        config.reward_percent_bps = 500;
        config.max_reward_percent_bps = 1000;
        config.min_wallet_age_days = 1.0;
        config.min_continuity_seconds = 3_600;
        config.min_cumulative_buy_sol = 0.05;
        config.scan_signature_limit = 100;
        config.public_dir = tempfile::tempdir()
            .unwrap()
            .into_path()
            .to_str()
            .unwrap()
            .to_string();
        config
    }

    fn seed_eligible(store: &Store, ledger: &MockLedger, count: usize, now: i64) {
        for i in 0..count {
            let wallet = format!("holder_{}", i);
            store
                .upsert_holder(
                    &wallet,
                    &HolderUpdate {
                        first_seen_ts: Some(now - 30 * 86_400),
                        continuity_start_ts: Some(now - 10 * 86_400),
                        last_balance_raw: Some(1_000_000),
                        add_buy_sol: Some(1.0),
                        streak_rounds: Some(i as u32),
                        twb_score: Some(i as f64 * 10.0),
                        ..Default::default()
                    },
                )
                .unwrap();
            ledger.set_token_balance(&wallet, 1_000_000);
        }
    }

    fn setup(dry_run: bool, holders: usize) -> (RewardJob, Store, Arc<MockLedger>) {
        let store = Store::open_in_memory().unwrap();
        let ledger = Arc::new(MockLedger::new());
        let now = now_ts();
        seed_eligible(&store, &ledger, holders, now);
        ledger.set_token_balance("TreasuryWallet", 10_000_000);
        let job = RewardJob::new(store.clone(), ledger.clone(), Arc::new(config(dry_run)));
        (job, store, ledger)
    }

    #[tokio::test]
    async fn test_dry_run_round_with_sentinels() {
        let (job, store, ledger) = setup(true, 5);
        let summary = job.run().await.unwrap();
        assert!(summary.contains("dry run"));
        // No transfers left the building
        assert!(ledger.sent_batches.lock().unwrap().is_empty());

        let round = store.latest_round(RoundType::Reward).unwrap().unwrap();
        assert_eq!(round.txs.len(), 2);
        assert!(round.txs[0].starts_with(DRY_RUN_SIGNATURE));
        assert_eq!(round.meta["success"], true);
        assert_eq!(round.meta["winnersCount"], 3);
        // 5% of 10_000_000 = 500_000 raw, split three ways
        let per_winner_ui = round.meta["perWinnerUi"].as_f64().unwrap();
        assert!((per_winner_ui - 0.166_666).abs() < 1e-4);
    }

    #[tokio::test]
    async fn test_live_run_batches_transfers() {
        let (job, store, ledger) = setup(false, 5);
        job.run().await.unwrap();

        // 3 winners at 2 sends per tx -> 2 batches
        let batches = ledger.sent_batches.lock().unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[1].len(), 1);
        // Conservation: every transfer carries the same integer amount
        let per_winner = batches[0][0].amount_raw;
        let total: u64 = batches
            .iter()
            .flat_map(|b| b.iter())
            .map(|r| r.amount_raw)
            .sum();
        assert_eq!(per_winner, 500_000 / 3);
        assert!(total <= 500_000);
        assert!(500_000 - per_winner * 3 < 3);

        let round = store.latest_round(RoundType::Reward).unwrap().unwrap();
        assert_eq!(round.txs.len(), 2);
        assert_eq!(round.meta["failedBatches"], 0);
    }

    #[tokio::test]
    async fn test_draw_is_reproducible_from_round_meta() {
        let (job, store, _ledger) = setup(true, 8);
        job.run().await.unwrap();

        let round = store.latest_round(RoundType::Reward).unwrap().unwrap();
        let ts = round.meta["lotteryTimestamp"].as_i64().unwrap();
        let blockhash = round.meta["lotteryBlockhash"].as_str().unwrap();
        let recorded_seed = round.meta["lotterySeed"].as_u64().unwrap() as u32;
        assert_eq!(lottery::derive_seed(ts, MINT, blockhash), recorded_seed);
    }

    #[tokio::test]
    async fn test_streaks_bump_for_every_eligible() {
        let (job, store, _ledger) = setup(true, 5);
        job.run().await.unwrap();
        // All five eligible holders advance, not only the three winners
        for i in 0..5 {
            let holder = store.get_holder(&format!("holder_{}", i)).unwrap().unwrap();
            assert_eq!(holder.streak_rounds, i as u32 + 1);
            assert!(holder.twb_score > i as f64 * 10.0);
        }
    }

    #[tokio::test]
    async fn test_empty_treasury_skips_with_round() {
        let (job, store, ledger) = setup(true, 5);
        ledger.set_token_balance("TreasuryWallet", 0);
        let summary = job.run().await.unwrap();
        assert!(summary.contains("skipped"));
        let round = store.latest_round(RoundType::Reward).unwrap().unwrap();
        assert_eq!(round.meta["success"], false);
        assert_eq!(round.meta["winnersCount"], 0);
    }

    #[tokio::test]
    async fn test_no_eligible_holders_skips() {
        let (job, store, _ledger) = setup(true, 0);
        let summary = job.run().await.unwrap();
        assert!(summary.contains("no eligible holders"));
        let round = store.latest_round(RoundType::Reward).unwrap().unwrap();
        assert_eq!(round.meta["error"], "no eligible holders");
    }

    #[tokio::test]
    async fn test_batch_failure_does_not_abort_remaining() {
        let (job, store, ledger) = setup(false, 5);
        // Every batch call fails; the job still completes and records
        *ledger.fail_token_batch.lock().unwrap() = Some("blockhash not found".to_string());
        job.run().await.unwrap();
        let round = store.latest_round(RoundType::Reward).unwrap().unwrap();
        assert!(round.txs.is_empty());
        assert_eq!(round.meta["failedBatches"], 2);
        assert_eq!(round.meta["success"], false);
    }
}
