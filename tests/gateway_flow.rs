//! End-to-end gateway scenarios over an on-disk store
//!
//! Drives the public `handle(token)` surface with a counting stub fetcher
//! and a pinned clock, covering the cache hit/miss lifecycle, both expiry
//! sweeps, and the quiet/loud failure split.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Timelike, Utc};
use serde_json::json;

use seriesgate::clock::{Clock, FixedClock};
use seriesgate::config::{ColumnType, GatewayConfig};
use seriesgate::fetch::{FetchError, RawResponse, UpstreamFetch};
use seriesgate::gateway::{Gateway, GatewayError};
use seriesgate::store::RowStore;
use seriesgate::token::{mint_token, Claims, RequestDescriptor};

const SECRET: &str = "flow-test-secret";

/// Counting fetcher serving one canned payload (or a canned rejection)
struct StubFetcher {
    calls: AtomicUsize,
    response: Result<serde_json::Value, u16>,
}

impl StubFetcher {
    fn ok(body: serde_json::Value) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            response: Ok(body),
        })
    }

    fn rejecting(status: u16) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            response: Err(status),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpstreamFetch for StubFetcher {
    async fn fetch(&self, _descriptor: &RequestDescriptor) -> Result<RawResponse, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.response {
            Ok(body) => Ok(RawResponse { body: body.clone() }),
            Err(status) => Err(FetchError::UpstreamRejected { status: *status }),
        }
    }
}

fn config() -> GatewayConfig {
    GatewayConfig {
        jwt_secret: SECRET.to_string(),
        schema: vec![ColumnType::Date, ColumnType::Real, ColumnType::Real],
        ..GatewayConfig::default()
    }
}

/// Gateway + shared store over a temp file, clock pinned off sweep minutes
fn setup(
    fetcher: Arc<StubFetcher>,
) -> (Gateway, RowStore, Arc<FixedClock>, tempfile::TempDir) {
    let dir = tempfile::TempDir::new().expect("Failed to create temp directory");
    let clock = Arc::new(FixedClock::new(
        Utc.with_ymd_and_hms(2024, 3, 4, 10, 7, 0).unwrap(),
    ));
    let config = config();
    let store = RowStore::open(dir.path().join("rows.db"), &config, clock.clone())
        .expect("Store should open");
    let gateway = Gateway::new(&config, store.clone(), fetcher, clock.clone());
    (gateway, store, clock, dir)
}

fn token_for(series: &str, start: &str, end: &str) -> String {
    mint_token(
        &Claims {
            series_name: Some(series.to_string()),
            start_date: Some(start.to_string()),
            end_date: Some(end.to_string()),
            sub: Some("alice".to_string()),
            iat: None,
            exp: jsonwebtoken::get_current_timestamp() as usize + 86_400,
        },
        SECRET,
    )
    .expect("Minting should succeed")
}

fn futures_payload() -> serde_json::Value {
    json!({
        "dataset_data": {
            "limit": null,
            "column_names": ["Date", "Open", "Settle"],
            "data": [
                ["2024-01-02", 4742.25, 4768.5],
                ["2024-01-03", 4768.5, 4722.0],
                ["2024-01-04", 4722.0, 4701.75]
            ]
        }
    })
}

#[tokio::test]
async fn test_fresh_token_fetches_once_and_persists_rows() {
    let fetcher = StubFetcher::ok(futures_payload());
    let (gateway, store, _clock, _dir) = setup(fetcher.clone());

    let token = token_for("X", "2024-01-01", "2024-01-31");
    let rows = gateway.handle(&token).await.expect("Handle should succeed");

    assert_eq!(fetcher.calls(), 1);
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|r| r.identity == "X|2024-01-01|2024-01-31"));

    // The same rows are durably visible through the store itself
    let descriptor = RequestDescriptor {
        series_name: "X".to_string(),
        start: chrono::NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        end: chrono::NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
        principal: "alice".to_string(),
    };
    let identity = seriesgate::identity::RequestIdentity::derive(&descriptor);
    assert_eq!(store.query(&identity).unwrap().len(), 3);
}

#[tokio::test]
async fn test_repeat_within_ttl_serves_cache_without_fetching() {
    let fetcher = StubFetcher::ok(futures_payload());
    let (gateway, _store, clock, _dir) = setup(fetcher.clone());
    let token = token_for("X", "2024-01-01", "2024-01-31");

    let first = gateway.handle(&token).await.expect("Handle should succeed");
    clock.advance(Duration::minutes(29));
    let second = gateway.handle(&token).await.expect("Handle should succeed");

    assert_eq!(fetcher.calls(), 1, "Second call within 30 minutes must not fetch");
    assert_eq!(first.len(), second.len());
    assert_eq!(first, second, "Cached rows are identical, timestamps included");
}

#[tokio::test]
async fn test_stale_rows_are_swept_and_refetched_after_ttl() {
    let fetcher = StubFetcher::ok(futures_payload());
    let (gateway, _store, clock, _dir) = setup(fetcher.clone());
    let token = token_for("X", "2024-01-01", "2024-01-31");

    gateway.handle(&token).await.expect("Handle should succeed");
    clock.advance(Duration::minutes(31));
    let rows = gateway.handle(&token).await.expect("Handle should succeed");

    assert_eq!(fetcher.calls(), 2);
    assert_eq!(
        rows.len(),
        3,
        "Per-key sweep removed the stale rows before the refetch"
    );
}

#[tokio::test]
async fn test_global_sweep_runs_only_on_allowed_minutes() {
    let fetcher = StubFetcher::ok(futures_payload());
    let (gateway, store, clock, _dir) = setup(fetcher.clone());

    let old_token = token_for("OLD", "2023-01-01", "2023-01-31");
    gateway.handle(&old_token).await.expect("Handle should succeed");

    let old_descriptor = RequestDescriptor {
        series_name: "OLD".to_string(),
        start: chrono::NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
        end: chrono::NaiveDate::from_ymd_opt(2023, 1, 31).unwrap(),
        principal: "alice".to_string(),
    };
    let old_identity = seriesgate::identity::RequestIdentity::derive(&old_descriptor);

    // 25 hours later, on a gated-off minute, a request for another series
    // leaves the expired rows in place
    clock.advance(Duration::hours(25));
    clock.set(clock.now().with_minute(7).unwrap());
    let other = token_for("NEW", "2024-01-01", "2024-01-31");
    gateway.handle(&other).await.expect("Handle should succeed");
    assert_eq!(
        store.query(&old_identity).unwrap().len(),
        3,
        "Minute 7 is outside the sweep allow-set"
    );

    // The same request on an allowed minute sweeps them
    clock.set(clock.now().with_minute(15).unwrap());
    gateway.handle(&other).await.expect("Handle should succeed");
    assert!(
        store.query(&old_identity).unwrap().is_empty(),
        "Global sweep removed rows older than 24 hours"
    );
}

#[tokio::test]
async fn test_malformed_token_returns_empty_and_touches_nothing() {
    let fetcher = StubFetcher::ok(futures_payload());
    let (gateway, _store, _clock, _dir) = setup(fetcher.clone());

    for bad in ["", "   ", "garbage", "a.b.c"] {
        let rows = gateway.handle(bad).await.expect("Handle should fail quiet");
        assert!(rows.is_empty(), "Token {:?} should yield no rows", bad);
    }
    assert_eq!(fetcher.calls(), 0);
}

#[tokio::test]
async fn test_tampered_signature_fails_quiet() {
    let fetcher = StubFetcher::ok(futures_payload());
    let (gateway, _store, _clock, _dir) = setup(fetcher.clone());

    let other_secret_token = mint_token(
        &Claims {
            series_name: Some("X".to_string()),
            start_date: Some("2024-01-01".to_string()),
            end_date: Some("2024-01-31".to_string()),
            sub: Some("mallory".to_string()),
            iat: None,
            exp: jsonwebtoken::get_current_timestamp() as usize + 3600,
        },
        "not-the-configured-secret",
    )
    .expect("Minting should succeed");

    let rows = gateway
        .handle(&other_secret_token)
        .await
        .expect("Handle should fail quiet");
    assert!(rows.is_empty());
    assert_eq!(fetcher.calls(), 0);
}

#[tokio::test]
async fn test_upstream_503_surfaces_error_and_leaves_store_unchanged() {
    let fetcher = StubFetcher::rejecting(503);
    let (gateway, store, _clock, _dir) = setup(fetcher.clone());
    let token = token_for("X", "2024-01-01", "2024-01-31");

    let err = gateway.handle(&token).await.unwrap_err();
    assert!(matches!(
        err,
        GatewayError::Fetch {
            source: FetchError::UpstreamRejected { status: 503 },
            ..
        }
    ));

    let descriptor = RequestDescriptor {
        series_name: "X".to_string(),
        start: chrono::NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        end: chrono::NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
        principal: "alice".to_string(),
    };
    let identity = seriesgate::identity::RequestIdentity::derive(&descriptor);
    assert!(store.query(&identity).unwrap().is_empty(), "Nothing was inserted");
}

#[tokio::test]
async fn test_distinct_date_ranges_are_separate_cache_partitions() {
    let fetcher = StubFetcher::ok(futures_payload());
    let (gateway, _store, _clock, _dir) = setup(fetcher.clone());

    let january = token_for("X", "2024-01-01", "2024-01-31");
    let february = token_for("X", "2024-02-01", "2024-02-29");

    let jan_rows = gateway.handle(&january).await.expect("Handle should succeed");
    let feb_rows = gateway.handle(&february).await.expect("Handle should succeed");

    assert_eq!(fetcher.calls(), 2, "Different ranges cannot share a fetch");
    assert_ne!(jan_rows[0].identity, feb_rows[0].identity);
}

#[tokio::test]
async fn test_principals_share_the_cache_for_identical_requests() {
    let fetcher = StubFetcher::ok(futures_payload());
    let (gateway, _store, _clock, _dir) = setup(fetcher.clone());

    let alice = token_for("X", "2024-01-01", "2024-01-31");
    let bob = mint_token(
        &Claims {
            series_name: Some("X".to_string()),
            start_date: Some("2024-01-01".to_string()),
            end_date: Some("2024-01-31".to_string()),
            sub: Some("bob".to_string()),
            iat: None,
            exp: jsonwebtoken::get_current_timestamp() as usize + 3600,
        },
        SECRET,
    )
    .expect("Minting should succeed");

    gateway.handle(&alice).await.expect("Handle should succeed");
    let rows = gateway.handle(&bob).await.expect("Handle should succeed");

    assert_eq!(fetcher.calls(), 1, "Bob is served from Alice's fetch");
    assert_eq!(rows.len(), 3);
}

#[tokio::test]
async fn test_rows_survive_process_restart_within_ttl() {
    let fetcher = StubFetcher::ok(futures_payload());
    let dir = tempfile::TempDir::new().expect("Failed to create temp directory");
    let clock = Arc::new(FixedClock::new(
        Utc.with_ymd_and_hms(2024, 3, 4, 10, 7, 0).unwrap(),
    ));
    let config = config();
    let path = dir.path().join("rows.db");
    let token = token_for("X", "2024-01-01", "2024-01-31");

    {
        let store = RowStore::open(&path, &config, clock.clone()).expect("Store should open");
        let gateway = Gateway::new(&config, store, fetcher.clone(), clock.clone());
        gateway.handle(&token).await.expect("Handle should succeed");
    }

    // A new gateway over the same database file still counts as fresh
    let store = RowStore::open(&path, &config, clock.clone()).expect("Store should reopen");
    let gateway = Gateway::new(&config, store, fetcher.clone(), clock);
    let rows = gateway.handle(&token).await.expect("Handle should succeed");

    assert_eq!(fetcher.calls(), 1, "Durable rows served the second process");
    assert_eq!(rows.len(), 3);
}
