//! Batched Send Scheduler (SPEC_FULL.md §4.D): persists a batch, fans
//! recipients out onto the internal batch topic, and paces per-wave
//! dispatch, recomputing weights between waves.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock as PLRwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::credentials::{EspCredential, Provider, TenantCredentials};
use crate::email::{EmailMessage, Personalization};
use crate::error::RelayError;
use crate::selection;
use crate::store::{EventStore, StatsWindow};

pub type BatchId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Processing,
    Completed,
}

/// A persisted batch row (§3). `initial_weights` is frozen at creation and
/// never mutated; `processed_messages`/`status`/`updated_at` advance as
/// waves dispatch (§4.D).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub tenant: i64,
    pub total_messages: u32,
    pub batch_size: u32,
    pub interval_seconds: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub current_batch: u32,
    pub processed_messages: u32,
    pub status: BatchStatus,
    pub initial_weights: BTreeMap<Provider, u32>,
}

impl Batch {
    /// A batch is "due" for its next wave when the pacing interval has
    /// elapsed since the last wave update (§4.D release pacing).
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        (now - self.updated_at).num_seconds() >= self.interval_seconds as i64
    }

    pub fn is_complete(&self) -> bool {
        self.status == BatchStatus::Completed
    }
}

/// One fanned-out "batch-email" message published to the internal batch
/// topic, keyed by batch-id (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchEmailRecord {
    pub batch_id: BatchId,
    pub personalization: Personalization,
    pub from: crate::address::Address,
    pub text_body: Option<String>,
    pub html_body: Option<String>,
    pub attachments: Vec<crate::attachment::Attachment>,
    pub headers: HashMap<String, String>,
    pub sections: HashMap<String, String>,
    pub categories: Vec<String>,
    pub subject: String,
}

impl BatchEmailRecord {
    /// Reassemble a single-recipient [`EmailMessage`] for dispatch.
    pub fn to_message(&self) -> EmailMessage {
        EmailMessage {
            from: Some(self.from.clone()),
            reply_to: Vec::new(),
            personalizations: vec![self.personalization.clone()],
            subject: self.subject.clone(),
            text_body: self.text_body.clone(),
            html_body: self.html_body.clone(),
            attachments: self.attachments.clone(),
            headers: self.headers.clone(),
            categories: self.categories.clone(),
            sections: self.sections.clone(),
            custom_args: Default::default(),
        }
    }
}

/// Persistence for [`Batch`] rows. `record_wave_dispatch` is the one
/// mutating operation on the hot path: it atomically increments
/// `processed_messages` and transitions `status`, taking a row-level write
/// lock to prevent lost updates under concurrent consumers (§4.D
/// completion).
#[async_trait]
pub trait BatchStore: Send + Sync {
    async fn create(&self, batch: Batch) -> Result<Batch, RelayError>;
    async fn get(&self, id: BatchId) -> Result<Option<Batch>, RelayError>;

    /// Increment `processed_messages` by one and transition status
    /// (pending->processing on the first dispatch, processing->completed
    /// once the counter reaches `total_messages`). A no-op (returns the
    /// batch unchanged) if the batch is already completed -- idempotent
    /// against a stray extra wave message (§8 scenario 6).
    async fn record_wave_dispatch(&self, id: BatchId, now: DateTime<Utc>) -> Result<Batch, RelayError>;

    /// Stamp `updated_at` forward without incrementing the counter, used
    /// when a wave message is skipped because the batch isn't due yet.
    async fn touch(&self, id: BatchId, now: DateTime<Utc>) -> Result<(), RelayError>;
}

/// `sqlx`-backed Postgres implementation. The row lock is a
/// `SELECT ... FOR UPDATE` inside a `sqlx::Transaction`, with up to 3
/// retries on serialization failure per §7's `TransientStore` policy.
pub struct PostgresBatchStore {
    pool: sqlx::PgPool,
}

impl PostgresBatchStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    async fn record_wave_dispatch_once(&self, id: BatchId, now: DateTime<Utc>) -> Result<Batch, RelayError> {
        let mut tx = self.pool.begin().await?;

        let row: (i64, i64, i32, i32, i32, DateTime<Utc>, DateTime<Utc>, i32, i32, String, Value) = sqlx::query_as(
            "SELECT id, user_id, total_messages, batch_size, interval_seconds, created_at, updated_at, current_batch, processed_messages, status, initial_weights FROM email_batches WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;

        let mut batch = row_to_batch(row)?;
        if !batch.is_complete() {
            batch.processed_messages += 1;
            batch.current_batch += 1;
            batch.updated_at = now;
            batch.status = if batch.processed_messages >= batch.total_messages {
                BatchStatus::Completed
            } else {
                BatchStatus::Processing
            };

            sqlx::query(
                "UPDATE email_batches SET processed_messages = $1, current_batch = $2, updated_at = $3, status = $4 WHERE id = $5",
            )
            .bind(batch.processed_messages as i32)
            .bind(batch.current_batch as i32)
            .bind(batch.updated_at)
            .bind(status_str(batch.status))
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(batch)
    }
}

fn status_str(status: BatchStatus) -> &'static str {
    match status {
        BatchStatus::Pending => "pending",
        BatchStatus::Processing => "processing",
        BatchStatus::Completed => "completed",
    }
}

fn row_to_batch(
    row: (i64, i64, i32, i32, i32, DateTime<Utc>, DateTime<Utc>, i32, i32, String, Value),
) -> Result<Batch, RelayError> {
    let (id, tenant, total_messages, batch_size, interval_seconds, created_at, updated_at, current_batch, processed_messages, status, weights_json) = row;
    let status = match status.as_str() {
        "pending" => BatchStatus::Pending,
        "processing" => BatchStatus::Processing,
        "completed" => BatchStatus::Completed,
        other => return Err(RelayError::MalformedPayload(format!("unknown batch status: {other}"))),
    };
    let initial_weights: BTreeMap<Provider, u32> = serde_json::from_value(weights_json)?;
    Ok(Batch {
        id,
        tenant,
        total_messages: total_messages as u32,
        batch_size: batch_size as u32,
        interval_seconds: interval_seconds as u32,
        created_at,
        updated_at,
        current_batch: current_batch as u32,
        processed_messages: processed_messages as u32,
        status,
        initial_weights,
    })
}

#[async_trait]
impl BatchStore for PostgresBatchStore {
    async fn create(&self, batch: Batch) -> Result<Batch, RelayError> {
        let weights_json = serde_json::to_value(&batch.initial_weights)?;
        let id: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO email_batches (user_id, total_messages, batch_size, interval_seconds, created_at, updated_at, current_batch, processed_messages, status, initial_weights)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING id
            "#,
        )
        .bind(batch.tenant)
        .bind(batch.total_messages as i32)
        .bind(batch.batch_size as i32)
        .bind(batch.interval_seconds as i32)
        .bind(batch.created_at)
        .bind(batch.updated_at)
        .bind(batch.current_batch as i32)
        .bind(batch.processed_messages as i32)
        .bind(status_str(batch.status))
        .bind(weights_json)
        .fetch_one(&self.pool)
        .await?;

        Ok(Batch { id: id.0, ..batch })
    }

    async fn get(&self, id: BatchId) -> Result<Option<Batch>, RelayError> {
        let row: Option<(i64, i64, i32, i32, i32, DateTime<Utc>, DateTime<Utc>, i32, i32, String, Value)> = sqlx::query_as(
            "SELECT id, user_id, total_messages, batch_size, interval_seconds, created_at, updated_at, current_batch, processed_messages, status, initial_weights FROM email_batches WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_batch).transpose()
    }

    async fn record_wave_dispatch(&self, id: BatchId, now: DateTime<Utc>) -> Result<Batch, RelayError> {
        const MAX_RETRIES: u32 = 3;
        let mut last_err = None;
        for _ in 0..MAX_RETRIES {
            match self.record_wave_dispatch_once(id, now).await {
                Ok(batch) => return Ok(batch),
                Err(RelayError::TransientStore(msg)) => last_err = Some(RelayError::TransientStore(msg)),
                Err(other) => return Err(other),
            }
        }
        Err(last_err.unwrap_or_else(|| RelayError::TransientStore("batch update retries exhausted".into())))
    }

    async fn touch(&self, id: BatchId, now: DateTime<Utc>) -> Result<(), RelayError> {
        sqlx::query("UPDATE email_batches SET updated_at = $1 WHERE id = $2")
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// In-memory implementation used by tests. Grounded on the active-batch
/// view described in §5: a `parking_lot::RwLock<HashMap<BatchId, Batch>>`,
/// matching the teacher's `parking_lot::RwLock` usage for the global
/// mailer slot in `src/lib.rs`.
#[derive(Default)]
pub struct MemoryBatchStore {
    batches: PLRwLock<HashMap<BatchId, Batch>>,
    next_id: std::sync::atomic::AtomicI64,
}

impl MemoryBatchStore {
    pub fn new() -> Self {
        Self { batches: PLRwLock::new(HashMap::new()), next_id: std::sync::atomic::AtomicI64::new(1) }
    }
}

#[async_trait]
impl BatchStore for MemoryBatchStore {
    async fn create(&self, mut batch: Batch) -> Result<Batch, RelayError> {
        let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        batch.id = id;
        self.batches.write().insert(id, batch.clone());
        Ok(batch)
    }

    async fn get(&self, id: BatchId) -> Result<Option<Batch>, RelayError> {
        Ok(self.batches.read().get(&id).cloned())
    }

    async fn record_wave_dispatch(&self, id: BatchId, now: DateTime<Utc>) -> Result<Batch, RelayError> {
        let mut batches = self.batches.write();
        let batch = batches
            .get_mut(&id)
            .ok_or_else(|| RelayError::MalformedPayload(format!("unknown batch {id}")))?;

        if !batch.is_complete() {
            batch.processed_messages += 1;
            batch.current_batch += 1;
            batch.updated_at = now;
            batch.status = if batch.processed_messages >= batch.total_messages {
                BatchStatus::Completed
            } else {
                BatchStatus::Processing
            };
        }
        Ok(batch.clone())
    }

    async fn touch(&self, id: BatchId, now: DateTime<Utc>) -> Result<(), RelayError> {
        if let Some(batch) = self.batches.write().get_mut(&id) {
            batch.updated_at = now;
        }
        Ok(())
    }
}

/// Recompute a batch's provider weights for the current wave: blend the
/// frozen `initial_weights` with weights freshly recomputed from events in
/// `[batch.updated_at, now]`, per §4.B's batch re-weighting rule.
pub async fn wave_weights(
    store: &dyn EventStore,
    batch: &Batch,
    now: DateTime<Utc>,
) -> Result<BTreeMap<Provider, u32>, RelayError> {
    let window = StatsWindow { start: batch.updated_at.timestamp(), end: now.timestamp() };
    let stats = store.provider_stats(batch.tenant, window).await?;

    // Treat every provider carried in `initial_weights` as having a valid
    // credential for this recomputation -- the batch was only created
    // because those providers were valid at creation time, and credentials
    // are not re-validated per wave (only stats are).
    let by_provider = batch
        .initial_weights
        .iter()
        .filter(|(_, w)| **w > 0)
        .map(|(p, _)| {
            let credential = EspCredential {
                provider: *p,
                api_key: Some("wave-recompute".into()),
                server_id: Some("wave-recompute".into()),
                ..Default::default()
            };
            (*p, credential)
        })
        .collect();
    let fake_credentials = TenantCredentials { tenant: batch.tenant, by_provider };

    let recent = selection::compute_weights(&fake_credentials, &stats);
    Ok(selection::adjust_weights(&batch.initial_weights, &recent))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryEventStore;

    fn sample_weights() -> BTreeMap<Provider, u32> {
        let mut w = BTreeMap::new();
        w.insert(Provider::SendGrid, 700);
        w.insert(Provider::Postmark, 300);
        w
    }

    fn sample_batch() -> Batch {
        let now = chrono::Utc::now();
        Batch {
            id: 0,
            tenant: 1,
            total_messages: 3,
            batch_size: 3,
            interval_seconds: 60,
            created_at: now,
            updated_at: now,
            current_batch: 0,
            processed_messages: 0,
            status: BatchStatus::Pending,
            initial_weights: sample_weights(),
        }
    }

    #[test]
    fn due_when_interval_elapsed() {
        let mut batch = sample_batch();
        batch.updated_at = chrono::Utc::now() - chrono::Duration::seconds(120);
        assert!(batch.is_due(chrono::Utc::now()));
    }

    #[test]
    fn not_due_before_interval_elapses() {
        let batch = sample_batch();
        assert!(!batch.is_due(chrono::Utc::now()));
    }

    #[tokio::test]
    async fn three_dispatches_complete_a_batch_of_three() {
        let store = MemoryBatchStore::new();
        let created = store.create(sample_batch()).await.unwrap();

        for _ in 0..3 {
            store.record_wave_dispatch(created.id, chrono::Utc::now()).await.unwrap();
        }

        let batch = store.get(created.id).await.unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Completed);
        assert_eq!(batch.processed_messages, 3);
    }

    #[tokio::test]
    async fn fourth_dispatch_on_completed_batch_is_a_no_op() {
        let store = MemoryBatchStore::new();
        let created = store.create(sample_batch()).await.unwrap();
        for _ in 0..4 {
            store.record_wave_dispatch(created.id, chrono::Utc::now()).await.unwrap();
        }
        let batch = store.get(created.id).await.unwrap().unwrap();
        assert_eq!(batch.processed_messages, 3);
        assert_eq!(batch.status, BatchStatus::Completed);
    }

    #[tokio::test]
    async fn partial_dispatch_leaves_batch_pending_or_processing() {
        let store = MemoryBatchStore::new();
        let created = store.create(sample_batch()).await.unwrap();
        store.record_wave_dispatch(created.id, chrono::Utc::now()).await.unwrap();
        let batch = store.get(created.id).await.unwrap().unwrap();
        assert!(matches!(batch.status, BatchStatus::Processing));
        assert_ne!(batch.status, BatchStatus::Completed);
    }

    #[tokio::test]
    async fn wave_weights_fall_back_to_initial_when_no_recent_events() {
        let event_store = MemoryEventStore::new();
        let batch = sample_batch();
        let adjusted = wave_weights(&event_store, &batch, chrono::Utc::now()).await.unwrap();
        // No events observed this wave -> recent score is 0 for every
        // provider -> adjust_weights falls back to equal split among
        // providers carrying a nonzero initial weight, then blends 0.7/0.3.
        assert_eq!(adjusted.values().sum::<u32>(), 1000);
    }
}
