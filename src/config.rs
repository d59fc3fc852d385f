//! Process-wide configuration from environment variables

use std::env;
use std::fmt;

/// Raised when the environment describes an unusable configuration
#[derive(Debug)]
pub struct ConfigInvalid(pub String);

impl fmt::Display for ConfigInvalid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid configuration: {}", self.0)
    }
}

impl std::error::Error for ConfigInvalid {}

/// Configuration loaded once at startup
///
/// Every knob has a default except the token mint and, outside dry-run,
/// the treasury keypair and indexer API key.
#[derive(Debug, Clone)]
pub struct Config {
    /// Chain RPC endpoint
    pub rpc_url: String,
    /// Enhanced-transaction indexer base URL
    pub indexer_url: String,
    /// Indexer API key
    pub indexer_api_key: String,
    /// Swap router base URL (quote + swap endpoints)
    pub swap_api_url: String,
    /// Mint of the token being accumulated and distributed
    pub token_mint: String,
    /// Path to the treasury keypair file (JSON byte array)
    pub treasury_keypair_path: String,
    /// When set, swaps and transfers are simulated with sentinel signatures
    pub dry_run: bool,

    pub buy_interval_seconds: i64,
    pub reward_interval_seconds: i64,

    /// Minimum wallet age for reward eligibility, in days
    pub min_wallet_age_days: f64,
    /// Minimum uninterrupted-holding window, in seconds
    pub min_continuity_seconds: i64,
    /// Minimum high-confidence cumulative buy volume, in SOL
    pub min_cumulative_buy_sol: f64,
    /// Winners drawn per reward round
    pub winners_per_round: usize,

    /// SOL left untouched for transaction fees
    pub fee_reserve_sol: f64,
    /// Smallest buy worth executing, in SOL
    pub min_buy_sol: f64,
    /// Hard cap on SOL spent per buy interval
    pub max_buy_per_interval_sol: f64,
    pub slippage_bps: u16,

    /// Fraction of the treasury token balance distributed per round
    pub reward_percent_bps: u64,
    /// Safety cap on the distributed fraction
    pub max_reward_percent_bps: u64,
    /// Transfers packed into one transaction
    pub max_sends_per_tx: usize,

    pub bootstrap_signature_limit: usize,
    pub scan_signature_limit: usize,

    pub status_port: u16,
    /// CORS origin echoed by the status server ("*" for wildcard)
    pub allowed_origin: String,

    pub buy_job_timeout_ms: u64,
    pub reward_job_timeout_ms: u64,

    /// Scheduler pre-check: treasury SOL below this skips the buy tick
    pub min_sol_reserve: f64,
    /// Scheduler pre-check: treasury token balance below this skips the reward tick
    pub min_reward_token_balance: u64,
    /// Consecutive transient RPC failures before safe-mode latches
    pub max_rpc_errors_before_pause: u32,

    pub db_path: String,
    pub public_dir: String,
}

fn var_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn var_or_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

impl Config {
    /// Load configuration from environment variables; unknown keys are ignored
    pub fn from_env() -> Self {
        Self {
            rpc_url: var_or_string("RPC_URL", "https://api.mainnet-beta.solana.com"),
            indexer_url: var_or_string("INDEXER_URL", "https://api.helius.xyz/v0"),
            indexer_api_key: var_or_string("INDEXER_API_KEY", ""),
            swap_api_url: var_or_string("SWAP_API_URL", "https://quote-api.jup.ag/v6"),
            token_mint: var_or_string("TOKEN_MINT", ""),
            treasury_keypair_path: var_or_string("TREASURY_KEYPAIR_PATH", ""),
            dry_run: var_or("DRY_RUN", true),

            buy_interval_seconds: var_or("BUY_INTERVAL_SECONDS", 3600),
            reward_interval_seconds: var_or("REWARD_INTERVAL_SECONDS", 7200),

            min_wallet_age_days: var_or("MIN_WALLET_AGE_DAYS", 3.0),
            min_continuity_seconds: var_or("MIN_CONTINUITY_SECONDS", 86_400),
            min_cumulative_buy_sol: var_or("MIN_CUMULATIVE_BUY_SOL", 0.05),
            winners_per_round: var_or("WINNERS_PER_ROUND", 10),

            fee_reserve_sol: var_or("FEE_RESERVE_SOL", 0.03),
            min_buy_sol: var_or("MIN_BUY_SOL", 0.01),
            max_buy_per_interval_sol: var_or("MAX_BUY_PER_INTERVAL_SOL", 0.2),
            slippage_bps: var_or("SLIPPAGE_BPS", 300),

            reward_percent_bps: var_or("REWARD_PERCENT_BPS", 500),
            max_reward_percent_bps: var_or("MAX_REWARD_PERCENT_BPS", 1000),
            max_sends_per_tx: var_or("MAX_SENDS_PER_TX", 8),

            bootstrap_signature_limit: var_or("BOOTSTRAP_SIGNATURE_LIMIT", 5000),
            scan_signature_limit: var_or("SCAN_SIGNATURE_LIMIT", 500),

            status_port: var_or("STATUS_PORT", 8787),
            allowed_origin: var_or_string("ALLOWED_ORIGIN", "*"),

            buy_job_timeout_ms: var_or("BUY_JOB_TIMEOUT_MS", 120_000),
            reward_job_timeout_ms: var_or("REWARD_JOB_TIMEOUT_MS", 300_000),

            min_sol_reserve: var_or("MIN_SOL_RESERVE", 0.05),
            min_reward_token_balance: var_or("MIN_REWARD_TOKEN_BALANCE", 1),
            max_rpc_errors_before_pause: var_or("MAX_RPC_ERRORS_BEFORE_PAUSE", 5),

            db_path: var_or_string("DB_PATH", "data/flywheel.db"),
            public_dir: var_or_string("PUBLIC_DIR", "public"),
        }
    }

    /// Reject configurations the jobs cannot run against
    pub fn validate(&self) -> Result<(), ConfigInvalid> {
        if self.token_mint.is_empty() {
            return Err(ConfigInvalid("TOKEN_MINT must be set".into()));
        }
        if self.buy_interval_seconds <= 0 || self.reward_interval_seconds <= 0 {
            return Err(ConfigInvalid("intervals must be positive".into()));
        }
        if self.slippage_bps == 0 || self.slippage_bps > 10_000 {
            return Err(ConfigInvalid(format!(
                "SLIPPAGE_BPS out of range: {}",
                self.slippage_bps
            )));
        }
        if self.reward_percent_bps > 10_000 || self.max_reward_percent_bps > 10_000 {
            return Err(ConfigInvalid("reward bps cannot exceed 10000".into()));
        }
        if self.winners_per_round == 0 {
            return Err(ConfigInvalid("WINNERS_PER_ROUND must be at least 1".into()));
        }
        if self.max_sends_per_tx == 0 {
            return Err(ConfigInvalid("MAX_SENDS_PER_TX must be at least 1".into()));
        }
        if self.fee_reserve_sol < 0.0 || self.min_buy_sol < 0.0 || self.max_buy_per_interval_sol <= 0.0 {
            return Err(ConfigInvalid("buy amounts must be non-negative".into()));
        }
        if !self.dry_run {
            if self.treasury_keypair_path.is_empty() {
                return Err(ConfigInvalid(
                    "TREASURY_KEYPAIR_PATH must be set when DRY_RUN=false".into(),
                ));
            }
            if self.indexer_api_key.is_empty() {
                return Err(ConfigInvalid(
                    "INDEXER_API_KEY must be set when DRY_RUN=false".into(),
                ));
            }
        }
        Ok(())
    }
}
