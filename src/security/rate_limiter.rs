// ARCHITECTURE: Rate Limiter - Per-Client Sliding Window Log
//
// DESIGN:
// Each client owns a log of admission instants covering the last `window`.
// A request is admitted iff fewer than `max_requests` entries remain after
// evicting everything older than the window. Admission appends one entry.
//
// CONCURRENCY:
// - The client map sits behind an RwLock that is write-locked only to insert
//   a new client or during the periodic sweep
// - Every client log has its own Mutex, so different clients never contend
// - A log is locked while a map guard is still held, so the sweep can never
//   drop a log between lookup and admission
// - Unknown clients start with an empty log
//
// State is process-local; a restart resets every window.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::{
    sync::{Mutex, RwLock},
    time::Instant,
};
use tracing::{debug, info, warn};

// CONFIGURATION: RateLimiterConfig - Sliding window parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    pub window_seconds: u64,            // Rolling window length (default: 60s)
    pub max_requests: u32,              // Admissions allowed per window (default: 60)
    pub cleanup_interval_seconds: u64,  // Sweep of idle clients (default: 300s)
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            window_seconds: 60,
            max_requests: 60,
            cleanup_interval_seconds: 300,
        }
    }
}

impl RateLimiterConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }
}

// RESULT: RateLimitResult - Admission decision
#[derive(Debug, Clone, PartialEq)]
pub enum RateLimitResult {
    Allowed {
        remaining: u32,             // Admissions left in the current window
    },
    RateLimited {
        retry_after_seconds: u64,   // Seconds until the oldest entry expires
        current_usage: u32,
        limit: u32,
    },
}

impl RateLimitResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitResult::Allowed { .. })
    }
}

// TRACKING: SlidingWindow - One client's admission log
#[derive(Debug)]
struct SlidingWindow {
    admitted: VecDeque<Instant>,
}

impl SlidingWindow {
    fn new() -> Self {
        Self {
            admitted: VecDeque::new(),
        }
    }

    fn evict_expired(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.admitted.front() {
            if now.duration_since(oldest) >= window {
                self.admitted.pop_front();
            } else {
                break;
            }
        }
    }

    fn try_admit(&mut self, now: Instant, window: Duration, limit: u32) -> RateLimitResult {
        self.evict_expired(now, window);

        let used = self.admitted.len() as u32;
        if used < limit {
            self.admitted.push_back(now);
            return RateLimitResult::Allowed {
                remaining: limit - used - 1,
            };
        }

        let retry_after = self
            .admitted
            .front()
            .map(|&oldest| window.saturating_sub(now.duration_since(oldest)))
            .unwrap_or(window);
        let retry_after_seconds = (retry_after.as_millis() as u64).div_ceil(1000).max(1);

        RateLimitResult::RateLimited {
            retry_after_seconds,
            current_usage: used,
            limit,
        }
    }
}

// METRICS: RateLimiterMetrics
#[derive(Debug, Clone, Default, Serialize)]
pub struct RateLimiterMetrics {
    pub allowed_requests: u64,
    pub rate_limited_requests: u64,
    pub active_clients: usize,
}

// CORE SYSTEM: RateLimiter
pub struct RateLimiter {
    config: RateLimiterConfig,
    clients: Arc<RwLock<HashMap<String, Arc<Mutex<SlidingWindow>>>>>,
    allowed: AtomicU64,
    limited: AtomicU64,
    cleanup_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::with_config(RateLimiterConfig::default())
    }

    pub fn with_config(config: RateLimiterConfig) -> Self {
        Self {
            config,
            clients: Arc::new(RwLock::new(HashMap::new())),
            allowed: AtomicU64::new(0),
            limited: AtomicU64::new(0),
            cleanup_handle: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    // LIFECYCLE: Start the idle-client sweep
    pub async fn start(&self) {
        let clients = self.clients.clone();
        let window = self.config.window();
        let interval = Duration::from_secs(self.config.cleanup_interval_seconds.max(1));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let removed = sweep(&clients, window).await;
                if removed > 0 {
                    debug!(removed_clients = removed, "Swept idle rate limit windows");
                }
            }
        });

        if let Some(previous) = self.cleanup_handle.lock().await.replace(handle) {
            previous.abort();
        }

        info!(
            window_seconds = self.config.window_seconds,
            max_requests = self.config.max_requests,
            "Rate Limiter started"
        );
    }

    pub async fn stop(&self) {
        if let Some(handle) = self.cleanup_handle.lock().await.take() {
            handle.abort();
        }
        info!("Rate Limiter stopped");
    }

    // CORE FUNCTION: Admit or reject one request for `client_id`
    pub async fn admit(&self, client_id: &str) -> RateLimitResult {
        let (window, limit) = (self.config.window(), self.config.max_requests);

        let known = {
            let clients = self.clients.read().await;
            let known = match clients.get(client_id) {
                Some(log) => Some(log.lock().await.try_admit(Instant::now(), window, limit)),
                None => None,
            };
            known
        };

        let result = match known {
            Some(result) => result,
            None => {
                let mut clients = self.clients.write().await;
                let log = clients
                    .entry(client_id.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(SlidingWindow::new())));
                let result = log.lock().await.try_admit(Instant::now(), window, limit);
                result
            }
        };

        match &result {
            RateLimitResult::Allowed { .. } => {
                self.allowed.fetch_add(1, Ordering::Relaxed);
            }
            RateLimitResult::RateLimited { retry_after_seconds, current_usage, .. } => {
                self.limited.fetch_add(1, Ordering::Relaxed);
                warn!(
                    client_id = %client_id,
                    current_usage,
                    retry_after_seconds,
                    "Client exceeded rate limit window"
                );
            }
        }
        result
    }

    /// Drops clients whose windows have fully expired. Returns how many were removed.
    pub async fn sweep_idle(&self) -> usize {
        sweep(&self.clients, self.config.window()).await
    }

    // ADMIN: Forget one client's window
    pub async fn reset_client(&self, client_id: &str) -> bool {
        let removed = self.clients.write().await.remove(client_id).is_some();
        if removed {
            info!(client_id = %client_id, "Rate limit window reset for client");
        }
        removed
    }

    pub async fn get_metrics(&self) -> RateLimiterMetrics {
        RateLimiterMetrics {
            allowed_requests: self.allowed.load(Ordering::Relaxed),
            rate_limited_requests: self.limited.load(Ordering::Relaxed),
            active_clients: self.clients.read().await.len(),
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

async fn sweep(clients: &RwLock<HashMap<String, Arc<Mutex<SlidingWindow>>>>, window: Duration) -> usize {
    let now = Instant::now();
    let mut clients = clients.write().await;
    let before = clients.len();
    clients.retain(|_, log| match log.try_lock() {
        Ok(mut log) => {
            log.evict_expired(now, window);
            !log.admitted.is_empty()
        }
        // in use right now, keep it
        Err(_) => true,
    });
    before - clients.len()
}
