//! Wallet-age discovery
//!
//! The oldest known activity of a wallet anchors its eligibility age. The
//! lookup pages backwards through signature history and memoizes the result
//! on the holder row; a transport failure fails open and the scanner retries
//! on the next sighting.

use crate::ledger::LedgerAdapter;
use crate::store::{HolderUpdate, Store};
use std::time::Duration;
use tokio::time::sleep;

const MAX_PAGES: usize = 20;
const PAGE_LIMIT: usize = 1000;
const PAGE_DELAY_MS: u64 = 100;

/// Return the wallet's oldest block time, fetching and persisting it if the
/// holder row does not carry one yet
pub async fn ensure_first_seen(
    store: &Store,
    ledger: &dyn LedgerAdapter,
    wallet: &str,
) -> Option<i64> {
    if let Ok(Some(holder)) = store.get_holder(wallet) {
        if let Some(first_seen) = holder.first_seen_ts {
            return Some(first_seen);
        }
    }

    let mut before: Option<String> = None;
    let mut oldest: Option<i64> = None;

    for page in 0..MAX_PAGES {
        if page > 0 {
            sleep(Duration::from_millis(PAGE_DELAY_MS)).await;
        }
        let signatures = match ledger
            .get_signatures_for_address(wallet, before.as_deref(), PAGE_LIMIT)
            .await
        {
            Ok(signatures) => signatures,
            Err(e) => {
                log::debug!("⚠️  Age lookup failed for {}: {}", wallet, e);
                return None;
            }
        };
        if signatures.is_empty() {
            break;
        }
        for info in &signatures {
            if let Some(block_time) = info.block_time {
                oldest = Some(oldest.map_or(block_time, |t| t.min(block_time)));
            }
        }
        before = signatures.last().map(|s| s.signature.clone());
        if signatures.len() < PAGE_LIMIT {
            break;
        }
    }

    let oldest = oldest?;
    if let Err(e) = store.upsert_holder(
        wallet,
        &HolderUpdate {
            first_seen_ts: Some(oldest),
            ..Default::default()
        },
    ) {
        log::debug!("⚠️  Could not persist first_seen for {}: {}", wallet, e);
    }
    Some(oldest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::mock::MockLedger;
    use crate::ledger::SignatureInfo;

    fn sig(signature: &str, block_time: Option<i64>) -> SignatureInfo {
        SignatureInfo {
            signature: signature.to_string(),
            block_time,
        }
    }

    #[tokio::test]
    async fn test_memoized_value_short_circuits() {
        let store = Store::open_in_memory().unwrap();
        let ledger = MockLedger::new();
        store
            .upsert_holder(
                "wallet",
                &HolderUpdate {
                    first_seen_ts: Some(1234),
                    ..Default::default()
                },
            )
            .unwrap();
        // No signature history needed; the stored value wins
        assert_eq!(ensure_first_seen(&store, &ledger, "wallet").await, Some(1234));
    }

    #[tokio::test]
    async fn test_minimum_block_time_is_persisted() {
        let store = Store::open_in_memory().unwrap();
        let ledger = MockLedger::new();
        ledger.wallet_signatures.lock().unwrap().insert(
            "wallet".to_string(),
            vec![
                sig("s3", Some(900)),
                sig("s2", None),
                sig("s1", Some(400)),
            ],
        );
        assert_eq!(ensure_first_seen(&store, &ledger, "wallet").await, Some(400));
        let holder = store.get_holder("wallet").unwrap().unwrap();
        assert_eq!(holder.first_seen_ts, Some(400));
    }

    #[tokio::test]
    async fn test_transport_error_fails_open() {
        let store = Store::open_in_memory().unwrap();
        let ledger = MockLedger::new();
        *ledger.fail_signatures.lock().unwrap() = Some("503 service unavailable".to_string());
        assert_eq!(ensure_first_seen(&store, &ledger, "wallet").await, None);
        // Nothing persisted; next sighting retries
        assert!(store.get_holder("wallet").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_history_returns_none() {
        let store = Store::open_in_memory().unwrap();
        let ledger = MockLedger::new();
        assert_eq!(ensure_first_seen(&store, &ledger, "fresh").await, None);
    }
}
