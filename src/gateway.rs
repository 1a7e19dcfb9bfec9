//! Gateway orchestrator
//!
//! Composes verification, identity derivation, the expiry sweeps, the
//! upstream fetch, flattening, and persistence into the single
//! `handle(token) -> rows` operation.
//!
//! Failure semantics split in two: malformed client input (a bad token)
//! fails quiet with an empty result and no upstream or store access, while
//! upstream, flatten, and store faults fail loud with the stage and
//! request identity attached.
//!
//! There is no mutual exclusion between the freshness check and the
//! subsequent insert: two concurrent misses for one identity can both
//! fetch and both insert. The duplicate rows age out with the normal
//! sweeps.

use std::sync::Arc;

use chrono::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::GatewayConfig;
use crate::fetch::{FetchError, UpstreamFetch};
use crate::flatten::{FlattenError, Flattener};
use crate::identity::RequestIdentity;
use crate::store::{RowStore, StoreError, StoredRow};
use crate::sweep::Sweeper;
use crate::token::{RequestDescriptor, TokenVerifier};

/// Loud failures from the miss path, tagged with stage and identity
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The upstream fetch failed
    #[error("Fetch failed for request '{identity}': {source}")]
    Fetch {
        identity: String,
        #[source]
        source: FetchError,
    },

    /// The upstream payload violated the expected shape
    #[error("Flatten failed for request '{identity}': {source}")]
    Flatten {
        identity: String,
        #[source]
        source: FlattenError,
    },

    /// The row store failed
    #[error("Store operation failed for request '{identity}': {source}")]
    Store {
        identity: String,
        #[source]
        source: StoreError,
    },
}

/// Token-authenticated, deduplicating ingestion gateway
pub struct Gateway {
    verifier: TokenVerifier,
    store: RowStore,
    sweeper: Sweeper,
    fetcher: Arc<dyn UpstreamFetch>,
    flattener: Flattener,
    per_key_ttl: Duration,
}

impl Gateway {
    /// Wires a gateway from its collaborators
    pub fn new(
        config: &GatewayConfig,
        store: RowStore,
        fetcher: Arc<dyn UpstreamFetch>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            verifier: TokenVerifier::new(&config.jwt_secret),
            sweeper: Sweeper::new(store.clone(), config, clock),
            store,
            fetcher,
            flattener: Flattener::new(config.row_width()),
            per_key_ttl: Duration::minutes(config.per_key_ttl_minutes),
        }
    }

    /// Serves one request token
    ///
    /// Returns the current row set for the token's request identity,
    /// fetching from upstream only when no fresh rows exist. A token that
    /// fails verification yields an empty row set, not an error.
    pub async fn handle(&self, token: &str) -> Result<Vec<StoredRow>, GatewayError> {
        let descriptor = match self.verifier.verify(token.trim()) {
            Ok(d) => d,
            Err(e) => {
                debug!(error = %e, "rejected request token");
                return Ok(Vec::new());
            }
        };
        let identity = RequestIdentity::derive(&descriptor);

        self.sweeper
            .global_sweep()
            .map_err(|e| self.store_err(&identity, e))?;
        self.sweeper
            .per_key_sweep(&identity)
            .map_err(|e| self.store_err(&identity, e))?;

        let fresh = self
            .store
            .exists(&identity, self.per_key_ttl)
            .map_err(|e| self.store_err(&identity, e))?;

        if fresh {
            debug!(identity = %identity, "serving cached rows");
        } else {
            self.fetch_and_store(&descriptor, &identity).await?;
        }

        self.store
            .query(&identity)
            .map_err(|e| self.store_err(&identity, e))
    }

    /// Miss path: one upstream fetch, streamed into the store
    async fn fetch_and_store(
        &self,
        descriptor: &RequestDescriptor,
        identity: &RequestIdentity,
    ) -> Result<(), GatewayError> {
        let raw = self.fetcher.fetch(descriptor).await.map_err(|e| {
            warn!(identity = %identity, error = %e, "upstream fetch failed");
            GatewayError::Fetch {
                identity: identity.to_string(),
                source: e,
            }
        })?;

        let rows = self
            .flattener
            .rows(&raw)
            .map_err(|e| self.flatten_err(identity, e))?;

        // Rows stream straight into the insert; a malformed row aborts the
        // batch and surfaces as the flatten failure that caused it.
        let mut flatten_failure = None;
        let inserted = self.store.insert_all(
            identity,
            rows.map_while(|row| match row {
                Ok(tuple) => Some(tuple),
                Err(e) => {
                    flatten_failure = Some(e);
                    None
                }
            }),
        );
        if let Some(e) = flatten_failure {
            return Err(self.flatten_err(identity, e));
        }
        let inserted = inserted.map_err(|e| self.store_err(identity, e))?;

        info!(identity = %identity, inserted, "fetched and stored upstream rows");
        Ok(())
    }

    fn store_err(&self, identity: &RequestIdentity, source: StoreError) -> GatewayError {
        GatewayError::Store {
            identity: identity.to_string(),
            source,
        }
    }

    fn flatten_err(&self, identity: &RequestIdentity, source: FlattenError) -> GatewayError {
        GatewayError::Flatten {
            identity: identity.to_string(),
            source,
        }
    }
}
