//! Wall-clock scheduler: calendar-aligned buy/reward ticks, a periodic scan,
//! a liveness heartbeat and graceful shutdown

use crate::clock::now_ts;
use crate::config::Config;
use crate::engine::ExecutionEngine;
use crate::jobs::buy::BuyJob;
use crate::jobs::reward::RewardJob;
use crate::ledger::{lamports_to_sol, LedgerAdapter};
use crate::scanner::Scanner;
use crate::status;
use crate::store::{RoundType, Store};
use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::sleep;

const SCAN_INTERVAL_SECONDS: i64 = 600;
const HEARTBEAT_INTERVAL_SECONDS: u64 = 30;
const SHUTDOWN_DRAIN_SECONDS: i64 = 30;

/// Next trigger instant strictly after `after`, aligned to the human
/// calendar: sub-minute intervals fire every minute, sub-hour intervals on
/// matching minutes, sub-day intervals on matching hours, anything larger
/// once a day at midnight.
pub fn next_aligned_fire(interval_seconds: i64, after: DateTime<Utc>) -> DateTime<Utc> {
    let base = after
        .with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(after);

    if interval_seconds < 60 {
        return base + ChronoDuration::minutes(1);
    }
    if interval_seconds < 3_600 {
        let every = (interval_seconds / 60).max(1);
        let mut t = base + ChronoDuration::minutes(1);
        while (t.minute() as i64) % every != 0 {
            t += ChronoDuration::minutes(1);
        }
        return t;
    }
    if interval_seconds < 86_400 {
        let every = (interval_seconds / 3_600).max(1);
        let mut t = base.with_minute(0).unwrap_or(base) + ChronoDuration::hours(1);
        while (t.hour() as i64) % every != 0 {
            t += ChronoDuration::hours(1);
        }
        return t;
    }
    let midnight = base
        .with_minute(0)
        .and_then(|t| t.with_hour(0))
        .unwrap_or(base);
    midnight + ChronoDuration::days(1)
}

pub struct Scheduler {
    store: Store,
    ledger: Arc<dyn LedgerAdapter>,
    config: Arc<Config>,
}

impl Scheduler {
    pub fn new(store: Store, ledger: Arc<dyn LedgerAdapter>, config: Arc<Config>) -> Self {
        Self {
            store,
            ledger,
            config,
        }
    }

    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        fs::create_dir_all(&self.config.public_dir)?;

        let stale_cutoff = 2 * self
            .config
            .buy_interval_seconds
            .max(self.config.reward_interval_seconds);
        let removed = self.store.clear_stale_locks(stale_cutoff, now_ts())?;
        if removed > 0 {
            log::warn!("🧹 Cleared {} stale execution lock(s)", removed);
        }

        // One reachability probe before committing to the loop
        let (blockhash, _) = self.ledger.get_latest_blockhash().await?;
        log::info!("✅ RPC reachable (blockhash {})", blockhash);

        let heartbeat_store = self.store.clone();
        let heartbeat = tokio::spawn(async move {
            let mut timer =
                tokio::time::interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECONDS));
            loop {
                timer.tick().await;
                if let Err(e) = heartbeat_store.set_heartbeat(now_ts()) {
                    log::warn!("⚠️  Heartbeat write failed: {}", e);
                }
            }
        });

        let status_store = self.store.clone();
        let status_config = self.config.clone();
        let status_server = tokio::spawn(async move {
            if let Err(e) = status::serve(status_store, status_config).await {
                log::error!("❌ Status server failed: {}", e);
            }
        });

        // Initial scan so the first reward tick is not flying blind
        let scanner = Scanner::new(
            self.store.clone(),
            self.ledger.clone(),
            self.config.token_mint.clone(),
        );
        if let Err(e) = scanner.incremental(self.config.scan_signature_limit).await {
            log::warn!("⚠️  Initial scan failed: {}", e);
        }
        if let Ok(count) = self.store.holder_count() {
            log::info!("👥 Tracking {} holder(s)", count);
        }

        let engine = ExecutionEngine::new(
            self.store.clone(),
            self.config.max_rpc_errors_before_pause,
        );
        let buy_job = BuyJob::new(
            self.store.clone(),
            self.ledger.clone(),
            self.config.clone(),
        );
        let reward_job = RewardJob::new(
            self.store.clone(),
            self.ledger.clone(),
            self.config.clone(),
        );
        let scan_running = Arc::new(AtomicBool::new(false));

        let mut next_buy =
            next_aligned_fire(self.config.buy_interval_seconds, Utc::now()).timestamp();
        let mut next_reward =
            next_aligned_fire(self.config.reward_interval_seconds, Utc::now()).timestamp();
        let mut next_scan = now_ts() + SCAN_INTERVAL_SECONDS;

        log::info!("⏰ Scheduler running");
        log::info!("   ├─ Next buy tick:    {}", next_buy);
        log::info!("   ├─ Next reward tick: {}", next_reward);
        log::info!("   └─ Next scan:        {}", next_scan);

        let mut sigterm = signal(SignalKind::terminate())?;
        loop {
            let now = now_ts();
            let wake = next_buy.min(next_reward).min(next_scan);
            let sleep_for = Duration::from_secs((wake - now).max(1) as u64);

            tokio::select! {
                _ = sleep(sleep_for) => {}
                _ = tokio::signal::ctrl_c() => {
                    log::info!("⚠️  SIGINT received");
                    break;
                }
                _ = sigterm.recv() => {
                    log::info!("⚠️  SIGTERM received");
                    break;
                }
            }

            let now = now_ts();
            if now >= next_scan {
                next_scan = now + SCAN_INTERVAL_SECONDS;
                self.spawn_scan(&scan_running);
            }
            if now >= next_buy {
                next_buy =
                    next_aligned_fire(self.config.buy_interval_seconds, Utc::now()).timestamp();
                self.tick_buy(&engine, &buy_job, now).await;
            }
            if now >= next_reward {
                next_reward =
                    next_aligned_fire(self.config.reward_interval_seconds, Utc::now()).timestamp();
                self.tick_reward(&engine, &reward_job, now).await;
            }
        }

        // Graceful shutdown: stop the side tasks, drain the in-flight scan
        log::info!("🛑 Shutting down...");
        heartbeat.abort();
        status_server.abort();
        let drain_start = now_ts();
        while scan_running.load(Ordering::SeqCst)
            && now_ts() - drain_start < SHUTDOWN_DRAIN_SECONDS
        {
            sleep(Duration::from_millis(500)).await;
        }
        log::info!("✅ Shutdown complete");
        Ok(())
    }

    fn spawn_scan(&self, scan_running: &Arc<AtomicBool>) {
        if scan_running.swap(true, Ordering::SeqCst) {
            log::debug!("⏭️  Scan still running, skipping trigger");
            return;
        }
        let store = self.store.clone();
        let ledger = self.ledger.clone();
        let mint = self.config.token_mint.clone();
        let limit = self.config.scan_signature_limit;
        let flag = scan_running.clone();
        tokio::spawn(async move {
            let scanner = Scanner::new(store, ledger, mint);
            if let Err(e) = scanner.incremental(limit).await {
                log::warn!("⚠️  Periodic scan failed: {}", e);
            }
            flag.store(false, Ordering::SeqCst);
        });
    }

    /// Timing guard + balance pre-check, then the execution engine
    async fn tick_buy(&self, engine: &ExecutionEngine, job: &BuyJob, now: i64) {
        match self.store.latest_round(RoundType::Buy) {
            Ok(Some(round)) if now - round.ts < self.config.buy_interval_seconds => {
                log::debug!("⏭️  Buy tick inside interval window, skipping");
                return;
            }
            Err(e) => {
                log::warn!("⚠️  Buy guard lookup failed: {}", e);
                return;
            }
            _ => {}
        }
        let treasury = self.ledger.treasury_address();
        match self.ledger.get_native_balance(&treasury).await {
            Ok(lamports) if lamports_to_sol(lamports) < self.config.min_sol_reserve => {
                log::info!(
                    "⏭️  Buy skipped: treasury {:.4} SOL below reserve {:.4}",
                    lamports_to_sol(lamports),
                    self.config.min_sol_reserve
                );
                return;
            }
            Err(e) => {
                log::warn!("⚠️  Buy pre-check failed: {}", e);
                return;
            }
            _ => {}
        }
        engine.execute(job).await;
    }

    async fn tick_reward(&self, engine: &ExecutionEngine, job: &RewardJob, now: i64) {
        match self.store.latest_round(RoundType::Reward) {
            Ok(Some(round)) if now - round.ts < self.config.reward_interval_seconds => {
                log::debug!("⏭️  Reward tick inside interval window, skipping");
                return;
            }
            Err(e) => {
                log::warn!("⚠️  Reward guard lookup failed: {}", e);
                return;
            }
            _ => {}
        }
        let treasury = self.ledger.treasury_address();
        match self
            .ledger
            .get_token_balance(&treasury, &self.config.token_mint)
            .await
        {
            Ok(raw) if raw < self.config.min_reward_token_balance => {
                log::info!(
                    "⏭️  Reward skipped: treasury balance {} below minimum {}",
                    raw,
                    self.config.min_reward_token_balance
                );
                return;
            }
            Err(e) => {
                log::warn!("⚠️  Reward pre-check failed: {}", e);
                return;
            }
            _ => {}
        }
        engine.execute(job).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::new_round_id;
    use crate::ledger::mock::MockLedger;
    use crate::ledger::sol_to_lamports;
    use crate::store::Round;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 15, h, m, s).unwrap()
    }

    #[test]
    fn test_sub_minute_interval_fires_every_minute() {
        assert_eq!(next_aligned_fire(30, at(12, 34, 56)), at(12, 35, 0));
        assert_eq!(next_aligned_fire(30, at(12, 34, 0)), at(12, 35, 0));
    }

    #[test]
    fn test_sub_hour_interval_aligns_to_minutes() {
        // 300s -> every 5 minutes on the 5-minute marks
        assert_eq!(next_aligned_fire(300, at(12, 34, 56)), at(12, 35, 0));
        assert_eq!(next_aligned_fire(300, at(12, 35, 10)), at(12, 40, 0));
        // 90s floors to every 1 minute
        assert_eq!(next_aligned_fire(90, at(12, 34, 56)), at(12, 35, 0));
    }

    #[test]
    fn test_sub_day_interval_aligns_to_hours() {
        // 7200s -> every 2 hours on even hours
        assert_eq!(next_aligned_fire(7_200, at(12, 34, 56)), at(14, 0, 0));
        assert_eq!(next_aligned_fire(7_200, at(13, 0, 0)), at(14, 0, 0));
        // 3600s -> next top of hour
        assert_eq!(next_aligned_fire(3_600, at(12, 0, 1)), at(13, 0, 0));
    }

    #[test]
    fn test_large_interval_fires_at_midnight() {
        let next = next_aligned_fire(172_800, at(12, 34, 56));
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 16, 0, 0, 0).unwrap());
    }

    fn scheduler_fixture(native_sol: f64) -> (Scheduler, Store, Arc<MockLedger>) {
        let store = Store::open_in_memory().unwrap();
        let ledger = Arc::new(MockLedger::new());
        *ledger.native_balance.lock().unwrap() = sol_to_lamports(native_sol);
        let mut config = Config::from_env();
        config.token_mint = "Mint11111111111111111111111111111111111111".to_string();
        config.min_sol_reserve = 0.05;
        config.public_dir = tempfile::tempdir()
            .unwrap()
            .into_path()
            .to_str()
            .unwrap()
            .to_string();
        let scheduler = Scheduler::new(store.clone(), ledger.clone(), Arc::new(config));
        (scheduler, store, ledger)
    }

    #[tokio::test]
    async fn test_timing_guard_blocks_recent_round() {
        let (scheduler, store, ledger) = scheduler_fixture(10.0);
        let now = now_ts();
        store
            .insert_round(&Round {
                id: new_round_id(),
                round_type: RoundType::Buy,
                ts: now - 10,
                txs: vec![],
                meta: serde_json::json!({}),
            })
            .unwrap();

        let engine = ExecutionEngine::new(store.clone(), 5);
        let job = BuyJob::new(
            store.clone(),
            ledger.clone(),
            scheduler.config.clone(),
        );
        scheduler.tick_buy(&engine, &job, now).await;
        // Guard fired before any quote was requested
        assert!(ledger.executed_swaps.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_balance_pre_check_blocks_poor_treasury() {
        let (scheduler, store, ledger) = scheduler_fixture(0.01);
        let engine = ExecutionEngine::new(store.clone(), 5);
        let job = BuyJob::new(store.clone(), ledger.clone(), scheduler.config.clone());
        scheduler.tick_buy(&engine, &job, now_ts()).await;
        assert!(ledger.executed_swaps.lock().unwrap().is_empty());
        // Pre-check skip does not consume the slot with a round
        assert!(store.latest_round(RoundType::Buy).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_buy_tick_executes_when_clear() {
        let (scheduler, store, ledger) = scheduler_fixture(10.0);
        let engine = ExecutionEngine::new(store.clone(), 5);
        let job = BuyJob::new(store.clone(), ledger.clone(), scheduler.config.clone());
        scheduler.tick_buy(&engine, &job, now_ts()).await;
        assert_eq!(ledger.executed_swaps.lock().unwrap().len(), 1);
        assert!(store.latest_round(RoundType::Buy).unwrap().is_some());
    }
}
