//! Consumer Orchestrator (SPEC_FULL.md §4.E, §5, §6): binds each topic to a
//! consumer group and a processor, committing offsets only after the
//! processor returns `Ok`, and giving poison-pill-tolerant errors a
//! log-and-commit path instead of blocking the partition.
//!
//! Grounded on the retrieval pack's Redpanda consumer loop (spawn a task per
//! topic, stream records, commit after the handler succeeds) generalized to
//! six independent topic/group/processor triples instead of one.

use std::sync::Arc;
use std::time::Duration;

use rand::thread_rng;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Instrument};

use crate::batch::{Batch, BatchEmailRecord, BatchStatus, BatchStore};
use crate::bus::MessageBus;
use crate::config::Config;
use crate::credentials::CredentialsStore;
use crate::email::EmailMessage;
use crate::error::RelayError;
use crate::event::StandardizedEvent;
use crate::providers::{EspAdapter, RawWebhookEvent};
use crate::selection;
use crate::store::{EventStore, FailedSendRecord, MessageUserAssociation, StatsWindow};

/// Wire format published onto the send topic: a tenant-scoped message ready
/// for routing. `message.custom_args.is_batch()` distinguishes an immediate
/// send from one that should be scheduled through the batch pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendRequest {
    pub tenant: i64,
    pub message: EmailMessage,
}

/// Shared dependencies every processor closes over. Cheap to clone --
/// everything inside is an `Arc`.
#[derive(Clone)]
pub struct OrchestratorCtx {
    pub event_store: Arc<dyn EventStore>,
    pub credentials_store: Arc<dyn CredentialsStore>,
    pub batch_store: Arc<dyn BatchStore>,
    pub bus: Arc<dyn MessageBus>,
    pub batch_topic: String,
    pub stats_window_seconds: i64,
}

/// The set of adapter constructors available in this build, gated by the
/// same cargo features as `crate::providers`. Adapters carry per-tenant
/// secrets, so they are built fresh from an `EspCredential` per dispatch
/// rather than held as long-lived singletons.
pub fn build_adapter(credential: &crate::credentials::EspCredential) -> Option<Box<dyn EspAdapter>> {
    use crate::credentials::Provider;
    match credential.provider {
        #[cfg(feature = "sendgrid")]
        Provider::SendGrid => Some(Box::new(crate::providers::SendGridAdapter::new(credential))),
        #[cfg(feature = "postmark")]
        Provider::Postmark => Some(Box::new(crate::providers::PostmarkAdapter::new(credential))),
        #[cfg(feature = "socketlabs")]
        Provider::SocketLabs => Some(Box::new(crate::providers::SocketLabsAdapter::new(credential))),
        #[cfg(feature = "sparkpost")]
        Provider::SparkPost => Some(Box::new(crate::providers::SparkPostAdapter::new(credential))),
        #[allow(unreachable_patterns)]
        _ => None,
    }
}

/// Run all six topic coordinators until `shutdown` fires, then wait for each
/// to drain its in-flight record before returning.
pub async fn run(config: &Config, ctx: OrchestratorCtx, shutdown: CancellationToken) -> Result<(), RelayError> {
    let send_bus = ctx.bus.clone();
    let (_tx, _rx) = watch::channel(());

    let coordinators = vec![
        tokio::spawn(run_topic_coordinator(
            send_bus.clone(),
            config.topics.send.clone(),
            "relay-send".to_string(),
            config.kafka_offset_reset.clone(),
            shutdown.clone(),
            {
                let ctx = ctx.clone();
                move |payload: Vec<u8>| {
                    let ctx = ctx.clone();
                    async move { process_send(&ctx, &payload).await }
                }
            },
        )),
        tokio::spawn(run_topic_coordinator(
            send_bus.clone(),
            config.topics.batch.clone(),
            "relay-batch".to_string(),
            config.kafka_offset_reset.clone(),
            shutdown.clone(),
            {
                let ctx = ctx.clone();
                move |payload: Vec<u8>| {
                    let ctx = ctx.clone();
                    async move { process_batch_wave(&ctx, &payload).await }
                }
            },
        )),
        spawn_webhook_coordinator(&ctx, config, "relay-webhook-sendgrid", config.topics.webhook_sendgrid.clone(), webhook_sendgrid_adapter(), shutdown.clone()),
        spawn_webhook_coordinator(&ctx, config, "relay-webhook-postmark", config.topics.webhook_postmark.clone(), webhook_postmark_adapter(), shutdown.clone()),
        spawn_webhook_coordinator(&ctx, config, "relay-webhook-socketlabs", config.topics.webhook_socketlabs.clone(), webhook_socketlabs_adapter(), shutdown.clone()),
        spawn_webhook_coordinator(&ctx, config, "relay-webhook-sparkpost", config.topics.webhook_sparkpost.clone(), webhook_sparkpost_adapter(), shutdown.clone()),
    ];

    for coordinator in coordinators {
        let _ = coordinator.await;
    }
    Ok(())
}

fn webhook_sendgrid_adapter() -> Option<Box<dyn EspAdapter>> {
    #[cfg(feature = "sendgrid")]
    {
        Some(Box::new(crate::providers::SendGridAdapter::new(&Default::default())))
    }
    #[cfg(not(feature = "sendgrid"))]
    {
        None
    }
}

fn webhook_postmark_adapter() -> Option<Box<dyn EspAdapter>> {
    #[cfg(feature = "postmark")]
    {
        Some(Box::new(crate::providers::PostmarkAdapter::new(&Default::default())))
    }
    #[cfg(not(feature = "postmark"))]
    {
        None
    }
}

fn webhook_socketlabs_adapter() -> Option<Box<dyn EspAdapter>> {
    #[cfg(feature = "socketlabs")]
    {
        Some(Box::new(crate::providers::SocketLabsAdapter::new(&Default::default())))
    }
    #[cfg(not(feature = "socketlabs"))]
    {
        None
    }
}

fn webhook_sparkpost_adapter() -> Option<Box<dyn EspAdapter>> {
    #[cfg(feature = "sparkpost")]
    {
        Some(Box::new(crate::providers::SparkPostAdapter::new(&Default::default())))
    }
    #[cfg(not(feature = "sparkpost"))]
    {
        None
    }
}

fn spawn_webhook_coordinator(
    ctx: &OrchestratorCtx,
    config: &Config,
    group_id: &'static str,
    topic: String,
    adapter: Option<Box<dyn EspAdapter>>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let bus = ctx.bus.clone();
    let ctx = ctx.clone();
    let offset_reset = config.kafka_offset_reset.clone();
    tokio::spawn(async move {
        let Some(adapter) = adapter else {
            info!(%topic, "no adapter compiled in for this topic's provider, coordinator idle");
            return;
        };
        let adapter: Arc<dyn EspAdapter> = Arc::from(adapter);
        run_topic_coordinator(bus, topic, group_id.to_string(), offset_reset, shutdown, move |payload: Vec<u8>| {
            let ctx = ctx.clone();
            let adapter = adapter.clone();
            async move { process_webhook(&ctx, adapter.as_ref(), &payload).await }
        })
        .await
    })
}

/// One topic's poll/process/commit loop. Reconnects with exponential
/// backoff (base 5s, capped at 60s) on repeated `TransientBus` failures
/// rather than exiting the process. `RelayError::Fatal` is the one
/// processor error that is not poison-pill tolerated: it terminates the
/// process per §7's recovery policy.
async fn run_topic_coordinator<F, Fut>(
    bus: Arc<dyn MessageBus>,
    topic: String,
    group_id: String,
    offset_reset: String,
    shutdown: CancellationToken,
    processor: F,
) where
    F: Fn(Vec<u8>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<(), RelayError>> + Send,
{
    let mut backoff = Duration::from_secs(5);
    const MAX_BACKOFF: Duration = Duration::from_secs(60);

    loop {
        if shutdown.is_cancelled() {
            return;
        }

        let mut consumer = match bus.consumer(&topic, &group_id, &offset_reset).await {
            Ok(c) => c,
            Err(e) => {
                warn!(%topic, error = %e, backoff_secs = backoff.as_secs(), "failed to create consumer, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = shutdown.cancelled() => return,
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }
        };
        backoff = Duration::from_secs(5);

        loop {
            if shutdown.is_cancelled() {
                return;
            }

            let record = tokio::select! {
                polled = consumer.poll() => polled,
                _ = shutdown.cancelled() => return,
            };

            let record = match record {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    warn!(%topic, error = %e, "poll failed, reconnecting");
                    break;
                }
            };

            let span = tracing::info_span!("relay.consume", topic = %topic, group = %group_id);
            let outcome = processor(record.payload.clone()).instrument(span).await;

            match outcome {
                Ok(()) => {
                    if let Err(e) = consumer.commit(&record).await {
                        error!(%topic, error = %e, "commit failed after successful processing");
                    }
                }
                Err(e) if e.blocks_commit() => {
                    warn!(%topic, error = %e, "transient failure, leaving offset uncommitted for redelivery");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Err(RelayError::Fatal(reason)) => {
                    error!(%topic, %reason, "fatal error mid-processing, terminating process");
                    std::process::exit(1);
                }
                Err(e) => {
                    warn!(%topic, error = %e, "poison-pill tolerated, committing and moving on");
                    if let Err(commit_err) = consumer.commit(&record).await {
                        error!(%topic, error = %commit_err, "commit failed while tolerating poison pill");
                    }
                }
            }
        }
    }
}

/// Process one send-topic record: either dispatch immediately or schedule
/// it through the batch pipeline (§4.D).
async fn process_send(ctx: &OrchestratorCtx, payload: &[u8]) -> Result<(), RelayError> {
    let request: SendRequest = serde_json::from_slice(payload)?;

    if request.message.custom_args.is_batch() {
        schedule_batch(ctx, request).await
    } else {
        dispatch_now(ctx, request.tenant, &request.message, None).await
    }
}

/// Create a batch row, freeze its initial weights, and fan every
/// personalization out onto the batch topic keyed by batch id (§4.D).
async fn schedule_batch(ctx: &OrchestratorCtx, request: SendRequest) -> Result<(), RelayError> {
    let now = chrono::Utc::now();
    let credentials = ctx.credentials_store.get(request.tenant).await?;
    let window = StatsWindow { start: now.timestamp() - ctx.stats_window_seconds, end: now.timestamp() };
    let stats = ctx.event_store.provider_stats(request.tenant, window).await?;
    let initial_weights = selection::compute_weights(&credentials, &stats);

    let custom_args = request.message.custom_args.clone();
    let batch = Batch {
        id: 0,
        tenant: request.tenant,
        total_messages: request.message.personalizations.len() as u32,
        batch_size: custom_args.batch_size.max(1),
        interval_seconds: custom_args.batch_interval_seconds.max(1),
        created_at: now,
        updated_at: now,
        current_batch: 0,
        processed_messages: 0,
        status: BatchStatus::Pending,
        initial_weights,
    };
    let batch = ctx.batch_store.create(batch).await?;

    for personalization in &request.message.personalizations {
        let record = BatchEmailRecord {
            batch_id: batch.id,
            personalization: personalization.clone(),
            from: request.message.from.clone().ok_or_else(|| RelayError::MalformedPayload("batch message missing from address".into()))?,
            text_body: request.message.text_body.clone(),
            html_body: request.message.html_body.clone(),
            attachments: request.message.attachments.clone(),
            headers: request.message.headers.clone(),
            sections: request.message.sections.clone(),
            categories: request.message.categories.clone(),
            subject: request.message.subject.clone(),
        };
        let payload = serde_json::to_vec(&record)?;
        ctx.bus.publish(&ctx.batch_topic, Some(batch.id.to_string().as_bytes()), &payload).await?;
    }

    info!(batch_id = batch.id, tenant = request.tenant, total = batch.total_messages, "batch scheduled");
    Ok(())
}

/// Process one batch-topic record. If the batch isn't due for its next
/// wave, the record is skip-acked (not dispatched, not requeued into a
/// delay structure) rather than held back: `processed_messages` is the
/// authoritative measure of batch completion, and a message skipped here
/// does not reduce `total_messages`, so a batch can complete with fewer
/// waves than recipients if pacing outruns the dispatch rate (§9, decided).
async fn process_batch_wave(ctx: &OrchestratorCtx, payload: &[u8]) -> Result<(), RelayError> {
    let record: BatchEmailRecord = serde_json::from_slice(payload)?;
    let now = chrono::Utc::now();

    let batch = ctx
        .batch_store
        .get(record.batch_id)
        .await?
        .ok_or_else(|| RelayError::MalformedPayload(format!("unknown batch {}", record.batch_id)))?;

    if batch.is_complete() {
        return Ok(());
    }

    if !batch.is_due(now) {
        ctx.batch_store.touch(batch.id, batch.updated_at).await?;
        return Ok(());
    }

    let weights = crate::batch::wave_weights(ctx.event_store.as_ref(), &batch, now).await?;
    let message = record.to_message();
    dispatch_with_weights(ctx, batch.tenant, &message, &record.personalization, &weights, Some(batch.id)).await?;
    ctx.batch_store.record_wave_dispatch(batch.id, now).await?;
    Ok(())
}

/// Immediate (non-batch) dispatch: compute weights from live credentials
/// and recent stats, then send every personalization.
async fn dispatch_now(
    ctx: &OrchestratorCtx,
    tenant: i64,
    message: &EmailMessage,
    batch_id: Option<i64>,
) -> Result<(), RelayError> {
    let now = chrono::Utc::now();
    let credentials = ctx.credentials_store.get(tenant).await?;
    let window = StatsWindow { start: now.timestamp() - ctx.stats_window_seconds, end: now.timestamp() };
    let stats = ctx.event_store.provider_stats(tenant, window).await?;
    let weights = selection::compute_weights(&credentials, &stats);

    for personalization in &message.personalizations {
        dispatch_with_weights(ctx, tenant, message, personalization, &weights, batch_id).await?;
    }
    Ok(())
}

async fn dispatch_with_weights(
    ctx: &OrchestratorCtx,
    tenant: i64,
    message: &EmailMessage,
    personalization: &crate::email::Personalization,
    weights: &std::collections::BTreeMap<crate::credentials::Provider, u32>,
    batch_id: Option<i64>,
) -> Result<(), RelayError> {
    let provider = selection::select(weights, tenant, &mut thread_rng())?;
    let credentials = ctx.credentials_store.get(tenant).await?;
    let credential = credentials
        .by_provider
        .get(&provider)
        .ok_or_else(|| RelayError::InvalidCredential { tenant })?;
    let adapter = build_adapter(credential).ok_or_else(|| {
        RelayError::Fatal(format!("no adapter compiled in for provider {provider}"))
    })?;

    let span = tracing::info_span!("relay.dispatch", provider = %provider, tenant, message_id = tracing::field::Empty);
    async move {
        match adapter.send(message, personalization).await {
            Ok(result) => {
                tracing::Span::current().record("message_id", result.message_id.as_str());
                ctx.event_store
                    .record_association(&MessageUserAssociation {
                        message_id: result.message_id,
                        tenant,
                        esp_id: credential.esp_id,
                        provider,
                        created_at: chrono::Utc::now(),
                        batch_id,
                    })
                    .await?;
                Ok(())
            }
            Err(RelayError::ProviderRejection { provider: p, message: msg, status }) => {
                ctx.event_store
                    .record_failed_send(&FailedSendRecord {
                        message_id: String::new(),
                        tenant,
                        provider,
                        occurred_at: chrono::Utc::now(),
                        status_code: status,
                        detail: msg.clone(),
                    })
                    .await?;
                Err(RelayError::ProviderRejection { provider: p, message: msg, status })
            }
            Err(e) => Err(e),
        }
    }
    .instrument(span)
    .await
}

/// Process one webhook record: an array or single object of raw provider
/// events, normalized and upserted idempotently (§4.A, §4.C).
async fn process_webhook(ctx: &OrchestratorCtx, adapter: &dyn EspAdapter, payload: &[u8]) -> Result<(), RelayError> {
    let body: serde_json::Value = serde_json::from_slice(payload)?;
    let events: Vec<serde_json::Value> = match body {
        serde_json::Value::Array(items) => items,
        other => vec![other],
    };

    for event_body in events {
        let raw = RawWebhookEvent { headers: Default::default(), body: event_body };
        let normalized: StandardizedEvent = adapter.normalize(&raw)?;
        ctx.event_store.upsert_event(&normalized).await?;
    }
    Ok(())
}
