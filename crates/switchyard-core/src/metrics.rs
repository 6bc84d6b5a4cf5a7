//! Metric name constants to avoid typos across crates.
//!
//! Recording goes through the `metrics` facade; the binary decides whether a
//! recorder (Prometheus) is installed.

/// Workers in the pool (gauge, labels: state = idle | bound | spawning).
pub const POOL_WORKERS: &str = "pool_workers";
/// Worker spawns (counter, labels: outcome = ok | error).
pub const POOL_SPAWNS_TOTAL: &str = "pool_spawns_total";
/// Workers stopped by the pool (counter, labels: reason).
pub const POOL_EVICTIONS_TOTAL: &str = "pool_evictions_total";
/// Acquire calls rejected because every worker was bound (counter).
pub const POOL_EXHAUSTED_TOTAL: &str = "pool_exhausted_total";
/// Entries waiting for a worker (gauge).
pub const POOL_WAITING: &str = "pool_waiting";
/// Waiting-list entries that expired (counter).
pub const POOL_WAIT_EXPIRED_TOTAL: &str = "pool_wait_expired_total";
/// Pending queue entries across all sessions (gauge).
pub const QUEUE_PENDING: &str = "queue_pending";
/// Queue entries dropped by caps (counter, labels: reason = session_cap | global_cap).
pub const QUEUE_DROPS_TOTAL: &str = "queue_drops_total";
/// Collect-mode merges (counter).
pub const QUEUE_COLLECT_MERGES_TOTAL: &str = "queue_collect_merges_total";
/// Duplicate inbound messages dropped (counter).
pub const DEDUP_HITS_TOTAL: &str = "dedup_hits_total";
/// Inbound messages accepted by dispatch (counter, labels: outcome).
pub const DISPATCH_TOTAL: &str = "dispatch_total";
/// Worker turn duration seconds (histogram).
pub const TURN_DURATION_SECONDS: &str = "turn_duration_seconds";
/// Failed worker turns (counter, labels: category).
pub const TURN_ERRORS_TOTAL: &str = "turn_errors_total";
/// Model cooldown state (gauge, labels: model). 1 = cooling down.
pub const MODEL_COOLDOWN: &str = "model_cooldown";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_constants_are_snake_case() {
        let names = [
            POOL_WORKERS,
            POOL_SPAWNS_TOTAL,
            POOL_EVICTIONS_TOTAL,
            POOL_EXHAUSTED_TOTAL,
            POOL_WAITING,
            POOL_WAIT_EXPIRED_TOTAL,
            QUEUE_PENDING,
            QUEUE_DROPS_TOTAL,
            QUEUE_COLLECT_MERGES_TOTAL,
            DEDUP_HITS_TOTAL,
            DISPATCH_TOTAL,
            TURN_DURATION_SECONDS,
            TURN_ERRORS_TOTAL,
            MODEL_COOLDOWN,
        ];
        for name in names {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "{name} is not snake_case"
            );
        }
    }
}
