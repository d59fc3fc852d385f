//! Read-only status view for the web front-end
//!
//! The snapshot is derived from the store on every request; a truncated
//! SHA-256 over the timing fields lets the front-end detect tampering
//! between it and the bot.

use crate::clock::now_ts;
use crate::config::Config;
use crate::store::{LockType, RoundType, Store, StoreError};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const RATE_LIMIT_MAX: usize = 30;
const RATE_LIMIT_WINDOW_SECONDS: i64 = 60;
const REQUEST_HEAD_LIMIT: usize = 8 * 1024;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub now: i64,
    pub source_of_truth: &'static str,
    pub checksum: String,
    pub bot_online: bool,
    pub heartbeat_age_seconds: i64,
    pub safe_mode: bool,
    pub safe_mode_reason: Option<String>,
    pub dry_run: bool,
    pub last_buy_ts: Option<i64>,
    pub last_reward_ts: Option<i64>,
    pub next_buy_ts: Option<i64>,
    pub next_reward_ts: Option<i64>,
    pub buy_interval_seconds: i64,
    pub reward_interval_seconds: i64,
    pub buy_in_progress: bool,
    pub reward_in_progress: bool,
    pub last_buy_tx: Option<String>,
    pub last_reward_txs: Vec<String>,
}

/// The seven fields covered by the checksum, in wire order
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChecksumFields {
    now: i64,
    bot_online: bool,
    safe_mode: bool,
    last_buy_ts: Option<i64>,
    last_reward_ts: Option<i64>,
    next_buy_ts: Option<i64>,
    next_reward_ts: Option<i64>,
}

fn checksum16(fields: &ChecksumFields) -> String {
    let json = serde_json::to_string(fields).unwrap_or_default();
    let digest = Sha256::digest(json.as_bytes());
    digest
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect::<String>()[..16]
        .to_string()
}

/// Assemble the externally visible state from durable rows only
pub fn project_status(
    store: &Store,
    config: &Config,
    now: i64,
) -> Result<StatusSnapshot, StoreError> {
    let heartbeat = store.heartbeat()?;
    let bot_online = heartbeat.map_or(false, |ts| now - ts < 60);
    let heartbeat_age_seconds = heartbeat.map_or(-1, |ts| now - ts);

    let safe_mode = store.is_safe_mode()?;
    let safe_mode_reason = if safe_mode {
        store.safe_mode_reason()?
    } else {
        None
    };

    let last_buy = store.latest_round(RoundType::Buy)?;
    let last_reward = store.latest_round(RoundType::Reward)?;
    let last_buy_ts = last_buy.as_ref().map(|round| round.ts);
    let last_reward_ts = last_reward.as_ref().map(|round| round.ts);
    let next_buy_ts = last_buy_ts.map(|ts| ts + config.buy_interval_seconds);
    let next_reward_ts = last_reward_ts.map(|ts| ts + config.reward_interval_seconds);

    let checksum = checksum16(&ChecksumFields {
        now,
        bot_online,
        safe_mode,
        last_buy_ts,
        last_reward_ts,
        next_buy_ts,
        next_reward_ts,
    });

    Ok(StatusSnapshot {
        now,
        source_of_truth: "server",
        checksum,
        bot_online,
        heartbeat_age_seconds,
        safe_mode,
        safe_mode_reason,
        dry_run: config.dry_run,
        last_buy_ts,
        last_reward_ts,
        next_buy_ts,
        next_reward_ts,
        buy_interval_seconds: config.buy_interval_seconds,
        reward_interval_seconds: config.reward_interval_seconds,
        buy_in_progress: store.lock_held(LockType::BuyJob)?,
        reward_in_progress: store.lock_held(LockType::RewardJob)?,
        last_buy_tx: last_buy.and_then(|round| round.txs.first().cloned()),
        last_reward_txs: last_reward.map(|round| round.txs).unwrap_or_default(),
    })
}

/// Per-IP sliding-window limiter
struct RateLimiter {
    max_hits: usize,
    window_seconds: i64,
    hits: Mutex<HashMap<IpAddr, Vec<i64>>>,
}

impl RateLimiter {
    fn new(max_hits: usize, window_seconds: i64) -> Self {
        Self {
            max_hits,
            window_seconds,
            hits: Mutex::new(HashMap::new()),
        }
    }

    fn check(&self, ip: IpAddr, now: i64) -> bool {
        let mut hits = self.hits.lock().unwrap_or_else(|e| e.into_inner());
        let entry = hits.entry(ip).or_default();
        entry.retain(|ts| now - ts < self.window_seconds);
        if entry.len() >= self.max_hits {
            return false;
        }
        entry.push(now);
        true
    }

    /// Drop IPs whose newest hit is older than twice the window
    fn evict(&self, now: i64) {
        let mut hits = self.hits.lock().unwrap_or_else(|e| e.into_inner());
        hits.retain(|_, entry| {
            entry
                .last()
                .map_or(false, |ts| now - ts < 2 * self.window_seconds)
        });
    }
}

fn cors_headers(allowed_origin: &str, request_origin: Option<&str>) -> Vec<String> {
    if allowed_origin == "*" {
        return vec!["Access-Control-Allow-Origin: *".to_string()];
    }
    let mut headers = vec!["Vary: Origin".to_string()];
    if request_origin == Some(allowed_origin) {
        headers.push(format!("Access-Control-Allow-Origin: {}", allowed_origin));
    }
    headers
}

fn build_response(status_line: &str, extra_headers: &[String], body: &str) -> String {
    let mut response = format!("HTTP/1.1 {}\r\n", status_line);
    response.push_str("Content-Type: application/json\r\n");
    response.push_str("Cache-Control: no-store, no-cache, must-revalidate\r\n");
    for header in extra_headers {
        response.push_str(header);
        response.push_str("\r\n");
    }
    response.push_str(&format!("Content-Length: {}\r\n", body.len()));
    response.push_str("Connection: close\r\n\r\n");
    response.push_str(body);
    response
}

/// Route one parsed request head to a full HTTP response
fn respond(
    store: &Store,
    config: &Config,
    limiter: &RateLimiter,
    ip: IpAddr,
    method: &str,
    path: &str,
    origin: Option<&str>,
) -> String {
    let cors = cors_headers(&config.allowed_origin, origin);

    if method == "OPTIONS" {
        let mut headers = cors;
        headers.push("Access-Control-Allow-Methods: GET, OPTIONS".to_string());
        headers.push("Access-Control-Allow-Headers: Content-Type".to_string());
        let mut response = "HTTP/1.1 204 No Content\r\n".to_string();
        response.push_str("Cache-Control: no-store, no-cache, must-revalidate\r\n");
        for header in &headers {
            response.push_str(header);
            response.push_str("\r\n");
        }
        response.push_str("Connection: close\r\n\r\n");
        return response;
    }
    if method != "GET" {
        return build_response(
            "405 Method Not Allowed",
            &cors,
            r#"{"error":"method not allowed"}"#,
        );
    }
    let bare_path = path.split('?').next().unwrap_or(path);
    if bare_path != "/status" {
        return build_response("404 Not Found", &cors, r#"{"error":"not found"}"#);
    }

    let now = now_ts();
    if !limiter.check(ip, now) {
        return build_response(
            "429 Too Many Requests",
            &cors,
            r#"{"error":"rate limit exceeded","retryAfterSeconds":60}"#,
        );
    }

    match project_status(store, config, now) {
        Ok(snapshot) => match serde_json::to_string(&snapshot) {
            Ok(body) => build_response("200 OK", &cors, &body),
            Err(e) => build_response(
                "500 Internal Server Error",
                &cors,
                &format!(r#"{{"error":"{}"}}"#, e),
            ),
        },
        Err(e) => build_response(
            "500 Internal Server Error",
            &cors,
            &format!(r#"{{"error":"{}"}}"#, e),
        ),
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    ip: IpAddr,
    store: Store,
    config: Arc<Config>,
    limiter: Arc<RateLimiter>,
) {
    // Read the head only; the status API never carries a request body
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    let read_result = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match stream.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    head.extend_from_slice(&buf[..n]);
                    if head.windows(4).any(|w| w == b"\r\n\r\n")
                        || head.len() > REQUEST_HEAD_LIMIT
                    {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    })
    .await;
    if read_result.is_err() {
        return;
    }

    let head = String::from_utf8_lossy(&head);
    let mut lines = head.lines();
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();
    let origin = lines
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.eq_ignore_ascii_case("origin") {
                Some(value.trim().to_string())
            } else {
                None
            }
        })
        .next();

    let response = respond(
        &store,
        &config,
        &limiter,
        ip,
        &method,
        &path,
        origin.as_deref(),
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

/// Bind and serve `GET /status` until the task is aborted
pub async fn serve(store: Store, config: Arc<Config>) -> std::io::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", config.status_port)).await?;
    log::info!("🌐 Status server listening on port {}", config.status_port);
    run_listener(listener, store, config).await
}

async fn run_listener(
    listener: TcpListener,
    store: Store,
    config: Arc<Config>,
) -> std::io::Result<()> {
    let limiter = Arc::new(RateLimiter::new(RATE_LIMIT_MAX, RATE_LIMIT_WINDOW_SECONDS));

    let evict_limiter = limiter.clone();
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(Duration::from_secs(60));
        loop {
            timer.tick().await;
            evict_limiter.evict(now_ts());
        }
    });

    loop {
        let (stream, peer) = listener.accept().await?;
        tokio::spawn(handle_connection(
            stream,
            peer.ip(),
            store.clone(),
            config.clone(),
            limiter.clone(),
        ));
    }
}
