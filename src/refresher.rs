//! Batched token-balance refresh with decrease detection
//!
//! A strict balance decrease is the anti-sybil trigger: it restarts the
//! continuity window and zeroes the streak and time-weighted accumulators.
//! Individual wallet failures are skipped so one bad lookup never poisons the
//! rest of the batch.

use crate::ledger::LedgerAdapter;
use crate::store::{HolderUpdate, Store, StoreError};
use std::time::Duration;
use tokio::time::sleep;

const BATCH_SIZE: usize = 50;
const BATCH_DELAY_MS: u64 = 100;

#[derive(Debug, Default)]
pub struct RefreshReport {
    pub total: usize,
    pub refreshed: usize,
    pub decreases: usize,
}

pub async fn refresh_balances(
    store: &Store,
    ledger: &dyn LedgerAdapter,
    mint: &str,
    now: i64,
) -> Result<RefreshReport, StoreError> {
    let wallets = store.all_wallets()?;
    let mut report = RefreshReport {
        total: wallets.len(),
        ..Default::default()
    };

    for (batch_idx, batch) in wallets.chunks(BATCH_SIZE).enumerate() {
        if batch_idx > 0 {
            sleep(Duration::from_millis(BATCH_DELAY_MS)).await;
        }
        for wallet in batch {
            let balance = match ledger.get_token_balance(wallet, mint).await {
                Ok(balance) => balance,
                Err(e) => {
                    log::debug!("⚠️  Balance refresh skipped for {}: {}", wallet, e);
                    continue;
                }
            };
            let holder = match store.get_holder(wallet) {
                Ok(Some(holder)) => holder,
                _ => continue,
            };

            let mut update = HolderUpdate {
                last_balance_raw: Some(balance),
                last_balance_check_ts: Some(now),
                last_seen_ts: Some(now),
                ..Default::default()
            };
            if balance < holder.last_balance_raw {
                update.continuity_start_ts = Some(now);
                update.streak_rounds = Some(0);
                update.twb_score = Some(0.0);
                update.last_decrease_ts = Some(now);
                report.decreases += 1;
                log::debug!(
                    "📉 Decrease: {} {} -> {}",
                    wallet,
                    holder.last_balance_raw,
                    balance
                );
            } else if holder.continuity_start_ts.is_none() {
                // First observation opens the holding window
                update.continuity_start_ts = Some(now);
            }

            if let Err(e) = store.upsert_holder(wallet, &update) {
                log::debug!("⚠️  Refresh write failed for {}: {}", wallet, e);
                continue;
            }
            report.refreshed += 1;
        }
    }

    Ok(report)
}
