//! Buy and reward job bodies plus their transparency artifacts

pub mod buy;
pub mod reward;

use crate::store::{Round, RoundType, Store};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

/// Persist a finished (or failed) attempt: the durable round row, the
/// per-type snapshot file and the append-only history line. Artifact write
/// failures are logged and swallowed; the round row is the authoritative
/// record.
pub fn record_attempt(store: &Store, public_dir: &str, round: &Round) {
    if let Err(e) = store.insert_round(round) {
        log::error!("❌ Could not record {} round: {}", round.round_type, e);
    }

    let record = serde_json::json!({
        "id": round.id,
        "type": round.round_type.as_str(),
        "ts": round.ts,
        "txs": round.txs,
        "meta": round.meta,
    });
    write_snapshot(public_dir, round.round_type, &record);
    append_history(public_dir, &record);
}

fn write_snapshot(public_dir: &str, round_type: RoundType, record: &serde_json::Value) {
    if let Err(e) = fs::create_dir_all(public_dir) {
        log::warn!("⚠️  Could not create {}: {}", public_dir, e);
        return;
    }
    let path = Path::new(public_dir).join(format!("last_{}.json", round_type.as_str()));
    match serde_json::to_string_pretty(record) {
        Ok(json) => {
            if let Err(e) = fs::write(&path, json) {
                log::warn!("⚠️  Could not write {}: {}", path.display(), e);
            }
        }
        Err(e) => log::warn!("⚠️  Could not serialize attempt snapshot: {}", e),
    }
}

fn append_history(public_dir: &str, record: &serde_json::Value) {
    let path = Path::new(public_dir).join("history.jsonl");
    let line = match serde_json::to_string(record) {
        Ok(line) => line,
        Err(e) => {
            log::warn!("⚠️  Could not serialize history line: {}", e);
            return;
        }
    };
    let result = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .and_then(|mut file| writeln!(file, "{}", line));
    if let Err(e) = result {
        log::warn!("⚠️  Could not append {}: {}", path.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::new_round_id;
    use crate::store::Store;

    #[test]
    fn test_record_attempt_writes_row_and_artifacts() {
        let store = Store::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let public_dir = dir.path().to_str().unwrap();

        let round = Round {
            id: new_round_id(),
            round_type: RoundType::Buy,
            ts: 1000,
            txs: vec!["sig1".to_string()],
            meta: serde_json::json!({ "solSpent": 0.2, "success": true }),
        };
        record_attempt(&store, public_dir, &round);
        let round2 = Round {
            id: new_round_id(),
            round_type: RoundType::Buy,
            ts: 2000,
            txs: vec![],
            meta: serde_json::json!({ "success": false }),
        };
        record_attempt(&store, public_dir, &round2);

        // Durable row
        let latest = store.latest_round(RoundType::Buy).unwrap().unwrap();
        assert_eq!(latest.ts, 2000);

        // Snapshot holds the latest attempt only
        let snapshot: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("last_buy.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(snapshot["ts"], 2000);

        // History accumulates one line per attempt
        let history = std::fs::read_to_string(dir.path().join("history.jsonl")).unwrap();
        assert_eq!(history.lines().count(), 2);
    }
}
