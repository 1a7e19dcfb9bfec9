//! Expiry sweeps
//!
//! Two independent housekeeping passes keep the row store bounded:
//!
//! * The **global sweep** deletes every row older than the global TTL,
//!   across all identities. It only runs when the current wall-clock
//!   minute is in the configured allow-set, which throttles sweep
//!   frequency independent of request volume, and it probes for
//!   qualifying rows before issuing the delete so the common case is a
//!   cheap no-op.
//! * The **per-key sweep** deletes rows for one request identity older
//!   than the per-key TTL. It runs on every invocation, before the
//!   freshness check, so stale rows for the identity being served are
//!   never mistaken for fresh ones.
//!
//! Both are destructive and irreversible; there is no soft delete.

use std::sync::Arc;

use chrono::{Duration, Timelike};
use tracing::debug;

use crate::clock::Clock;
use crate::config::GatewayConfig;
use crate::identity::RequestIdentity;
use crate::store::{RowStore, StoreError};

/// Runs the two expiry passes against the row store
pub struct Sweeper {
    store: RowStore,
    clock: Arc<dyn Clock>,
    global_ttl: Duration,
    per_key_ttl: Duration,
    sweep_minutes: Vec<u32>,
}

impl Sweeper {
    /// Creates a sweeper from the gateway configuration
    pub fn new(store: RowStore, config: &GatewayConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            global_ttl: Duration::minutes(config.global_ttl_minutes),
            per_key_ttl: Duration::minutes(config.per_key_ttl_minutes),
            sweep_minutes: config.sweep_minutes.clone(),
        }
    }

    /// Runs the global sweep if the current minute allows it
    ///
    /// # Returns
    /// * `Ok(count)` — rows deleted; 0 when gated off or nothing qualified
    pub fn global_sweep(&self) -> Result<usize, StoreError> {
        let now = self.clock.now();
        if !self.sweep_minutes.contains(&now.minute()) {
            return Ok(0);
        }

        let threshold = now - self.global_ttl;
        if !self.store.has_rows_older_than(threshold)? {
            return Ok(0);
        }

        let deleted = self.store.delete_older_than(threshold, None)?;
        debug!(deleted, "global sweep removed expired rows");
        Ok(deleted)
    }

    /// Deletes stale rows for one identity; runs on every invocation
    ///
    /// # Returns
    /// * `Ok(count)` — rows deleted for the identity
    pub fn per_key_sweep(&self, identity: &RequestIdentity) -> Result<usize, StoreError> {
        let threshold = self.clock.now() - self.per_key_ttl;
        let deleted = self.store.delete_older_than(threshold, Some(identity))?;
        if deleted > 0 {
            debug!(identity = %identity, deleted, "per-key sweep removed stale rows");
        }
        Ok(deleted)
    }
}
