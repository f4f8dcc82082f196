use broker_store::{PgQueue, PgRepository};
use std::{sync::Arc, time::Duration};

/// The slice of the broker's configuration the HTTP surface needs.
#[derive(Clone, Debug)]
pub struct HttpConfig {
    /// Bearer token required on `/internal/*`. `None` disables the check
    /// (development only).
    pub internal_token: Option<String>,
    /// `QUEUE_BLOCK_SECONDS` — how long `Claim` and tail reads block.
    pub queue_block: Duration,
    pub max_tail_count: i64,
    pub max_index_tail_count: i64,
    pub session_cookie_name: String,
    /// `LEASE_MS` — default heartbeat extension when a request omits `ttlMs`.
    pub lease_ms: i64,
}

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<PgRepository>,
    pub queue: Arc<PgQueue>,
    pub cfg: HttpConfig,
}
