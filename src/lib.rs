//! # relay-router
//!
//! A multi-tenant email relay consumer and deliverability router. It sits
//! between an application's outbound mail path and the ESPs that actually
//! put mail on the wire, and does three things no single ESP does for you:
//!
//! - picks which ESP handles a given send, weighted by that tenant's recent
//!   delivery/bounce/spam history instead of a fixed priority order;
//! - paces large sends out as batches, releasing waves on an interval and
//!   reweighting each wave against fresher stats;
//! - normalizes every ESP's webhook payload into one `StandardizedEvent`
//!   schema and upserts it idempotently, so retried or out-of-order webhook
//!   deliveries never double-count.
//!
//! ## Quick Start
//!
//! Set environment variables:
//! ```bash
//! KAFKA_BROKERS=localhost:9092
//! POSTGRES_HOST=localhost
//! POSTGRES_USER=relay
//! POSTGRES_PASSWORD=relay
//! POSTGRES_DB=relay
//! ```
//!
//! Run the orchestrator:
//! ```rust,ignore
//! use relay_router::run_from_env;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     run_from_env().await?;
//!     Ok(())
//! }
//! ```
//!
//! That spins up a Postgres-backed event/credentials/batch store, a
//! `KafkaBus`, the `/health` listener, and all six topic coordinators, and
//! runs until the process receives a shutdown signal.
//!
//! ## Manual Wiring
//!
//! Tests and embedders that want their own store/bus implementations build
//! `consumer::OrchestratorCtx` directly instead of going through
//! `run_from_env`:
//!
//! ```rust,ignore
//! use relay_router::consumer::{self, OrchestratorCtx};
//!
//! let ctx = OrchestratorCtx {
//!     event_store: my_event_store,
//!     credentials_store: my_credentials_store,
//!     batch_store: my_batch_store,
//!     bus: my_bus,
//!     batch_topic: "batch-emails".into(),
//!     stats_window_seconds: 30 * 24 * 3600,
//! };
//! consumer::run(&config, ctx, shutdown).await?;
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Description |
//! |----------|-------------|
//! | `KAFKA_BROKERS` | Bootstrap servers (required) |
//! | `KAFKA_OFFSET_RESET` | `earliest` (default) or `latest` |
//! | `SEND_TOPIC` | Send-request topic (default: `send-requests`) |
//! | `BATCH_TOPIC` | Internal batch-wave topic (default: `batch-emails`) |
//! | `WEBHOOK_SENDGRID_TOPIC` / `_POSTMARK_` / `_SOCKETLABS_` / `_SPARKPOST_` | Per-ESP webhook topics |
//! | `POSTGRES_HOST` / `_PORT` / `_USER` / `_PASSWORD` / `_DB` | Postgres connection (host/user/password/db required) |
//! | `HEALTH_PORT` | `/health` listener port (default: `8080`) |
//! | `RUST_LOG` | `tracing-subscriber` filter directives |
//!
//! ## Feature Flags
//!
//! - `sendgrid`, `postmark`, `socketlabs`, `sparkpost` -- per-ESP HTTP
//!   adapters, each pulling in `reqwest`. All four are on by default.
//! - `local` -- in-memory store implementations for tests and local dev.
//! - `dev` -- enables `local`.
//! - `metrics` -- Prometheus-style counters via the `metrics` facade.
//! - `full` -- everything above.
//!
//! ## Metrics
//!
//! Enable `features = ["metrics"]` to emit:
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `relay_dispatch_total` | Counter | provider, outcome | Sends attempted per provider |
//! | `relay_webhook_events_total` | Counter | provider, event | Normalized webhook events processed |
//! | `relay_batch_waves_total` | Counter | outcome | Batch waves released |
//!
//! Install a recorder (e.g., `metrics-exporter-prometheus`) in your app to collect them.

/// The version of the relay-router crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod address;
pub mod attachment;
pub mod batch;
pub mod bus;
pub mod config;
pub mod consumer;
pub mod credentials;
pub mod email;
pub mod error;
pub mod event;
pub mod health;
pub mod providers;
pub mod selection;
pub mod store;
pub mod substitution;

// Re-exports mirroring the teacher crate's flat top-level surface for the
// types embedders reach for most often.
pub use address::{Address, ToAddress};
pub use attachment::{Attachment, AttachmentType};
pub use config::Config;
pub use email::{CustomArgs, EmailMessage, Personalization};
pub use error::RelayError;

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;

use batch::PostgresBatchStore;
use consumer::OrchestratorCtx;
use credentials::PostgresCredentialsStore;
use store::PostgresEventStore;

/// A year of history, in seconds -- the default window `provider_stats`
/// scores a provider over when no narrower window is configured.
const DEFAULT_STATS_WINDOW_SECONDS: i64 = 30 * 24 * 3600;

/// Install the `tracing-subscriber` `fmt` + `EnvFilter` layers from
/// `RUST_LOG`, matching the common pattern across the retrieval pack's
/// service binaries. Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}

/// Bootstrap the full consumer from the environment: a Postgres connection
/// pool, the `KafkaBus`, the `/health` listener, and all six topic
/// coordinators. Runs until `shutdown` fires.
///
/// This is the convenience entrypoint for a standalone process; embedders
/// that need different store or bus implementations should build an
/// [`OrchestratorCtx`] directly and call [`consumer::run`].
pub async fn run_from_env_until(shutdown: CancellationToken) -> Result<(), RelayError> {
    init_tracing();

    let config = Config::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url())
        .await
        .map_err(|e| RelayError::Fatal(format!("failed to connect to postgres: {e}")))?;

    let bus = bus::KafkaBus::new(&config.kafka_brokers)?;

    health::spawn(config.health_port);

    let ctx = OrchestratorCtx {
        event_store: Arc::new(PostgresEventStore::new(pool.clone())),
        credentials_store: Arc::new(PostgresCredentialsStore::new(pool.clone())),
        batch_store: Arc::new(PostgresBatchStore::new(pool)),
        bus: Arc::new(bus),
        batch_topic: config.topics.batch.clone(),
        stats_window_seconds: DEFAULT_STATS_WINDOW_SECONDS,
    };

    consumer::run(&config, ctx, shutdown).await
}

/// Like [`run_from_env_until`], but installs a `ctrl_c` handler as the
/// shutdown signal -- the shape most standalone binaries want.
pub async fn run_from_env() -> Result<(), RelayError> {
    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();

    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        shutdown_signal.cancel();
    });

    run_from_env_until(shutdown).await
}
