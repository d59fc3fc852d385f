use flywheel::clock::now_ts;
use flywheel::config::Config;
use flywheel::engine::ExecutionEngine;
use flywheel::jobs::buy::BuyJob;
use flywheel::jobs::reward::RewardJob;
use flywheel::ledger::http::HttpLedger;
use flywheel::ledger::LedgerAdapter;
use flywheel::scanner::Scanner;
use flywheel::scheduler::Scheduler;
use flywheel::store::Store;
use std::path::Path;
use std::process;
use std::sync::Arc;

enum Mode {
    Scheduler,
    Bootstrap,
    OnceBuy,
    OnceReward,
    ExitSafeMode,
}

fn parse_mode() -> Option<Mode> {
    match std::env::args().nth(1).as_deref() {
        None => Some(Mode::Scheduler),
        Some("--bootstrap") => Some(Mode::Bootstrap),
        Some("--once-buy") => Some(Mode::OnceBuy),
        Some("--once-reward") => Some(Mode::OnceReward),
        Some("--exit-safe-mode") => Some(Mode::ExitSafeMode),
        Some(_) => None,
    }
}

fn open_store(config: &Config) -> Store {
    if let Some(parent) = Path::new(&config.db_path).parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                log::error!("❌ Cannot create data directory: {}", e);
                process::exit(1);
            }
        }
    }
    match Store::open(&config.db_path) {
        Ok(store) => store,
        Err(e) => {
            log::error!("❌ Cannot open store at {}: {}", config.db_path, e);
            process::exit(1);
        }
    }
}

fn build_ledger(config: &Config) -> Arc<dyn LedgerAdapter> {
    match HttpLedger::new(config) {
        Ok(ledger) => Arc::new(ledger),
        Err(e) => {
            log::error!("❌ Cannot initialize ledger adapter: {}", e);
            process::exit(1);
        }
    }
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mode = match parse_mode() {
        Some(mode) => mode,
        None => {
            eprintln!(
                "usage: flywheel [--bootstrap | --once-buy | --once-reward | --exit-safe-mode]"
            );
            process::exit(1);
        }
    };

    let config = Config::from_env();
    if let Err(e) = config.validate() {
        log::error!("❌ {}", e);
        process::exit(1);
    }
    let config = Arc::new(config);

    log::info!("🚀 Starting flywheel");
    log::info!("   ├─ Mint:            {}", config.token_mint);
    log::info!("   ├─ Dry run:         {}", config.dry_run);
    log::info!(
        "   ├─ Buy interval:    {}s (cap {:.4} SOL)",
        config.buy_interval_seconds,
        config.max_buy_per_interval_sol
    );
    log::info!(
        "   ├─ Reward interval: {}s ({} bps, {} winners)",
        config.reward_interval_seconds,
        config.reward_percent_bps,
        config.winners_per_round
    );
    log::info!("   └─ Database:        {}", config.db_path);

    let store = open_store(&config);

    match mode {
        Mode::ExitSafeMode => {
            if let Err(e) = store.exit_safe_mode() {
                log::error!("❌ Could not clear safe mode: {}", e);
                process::exit(1);
            }
            log::info!("✅ Safe mode cleared");
        }
        Mode::Bootstrap => {
            let ledger = build_ledger(&config);
            let scanner = Scanner::new(store.clone(), ledger, config.token_mint.clone());
            match scanner.bootstrap(config.bootstrap_signature_limit).await {
                Ok(report) => log::info!(
                    "✅ Bootstrap scan done: {} txs, {} buys",
                    report.transactions,
                    report.buys
                ),
                Err(e) => {
                    log::error!("❌ Bootstrap scan failed: {}", e);
                    process::exit(1);
                }
            }
        }
        Mode::OnceBuy => {
            let ledger = build_ledger(&config);
            let cutoff = 2 * config.buy_interval_seconds.max(config.reward_interval_seconds);
            let _ = store.clear_stale_locks(cutoff, now_ts());
            let engine = ExecutionEngine::new(store.clone(), config.max_rpc_errors_before_pause);
            let job = BuyJob::new(store.clone(), ledger, config.clone());
            let outcome = engine.execute(&job).await;
            log::info!("Buy outcome: {:?}", outcome);
        }
        Mode::OnceReward => {
            let ledger = build_ledger(&config);
            let cutoff = 2 * config.buy_interval_seconds.max(config.reward_interval_seconds);
            let _ = store.clear_stale_locks(cutoff, now_ts());
            let engine = ExecutionEngine::new(store.clone(), config.max_rpc_errors_before_pause);
            let job = RewardJob::new(store.clone(), ledger, config.clone());
            let outcome = engine.execute(&job).await;
            log::info!("Reward outcome: {:?}", outcome);
        }
        Mode::Scheduler => {
            let ledger = build_ledger(&config);
            let scheduler = Scheduler::new(store, ledger, config);
            if let Err(e) = scheduler.run().await {
                log::error!("❌ Fatal scheduler error: {}", e);
                process::exit(1);
            }
        }
    }
}
