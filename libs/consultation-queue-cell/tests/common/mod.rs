#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use consultation_queue_cell::{
    CacheStore, ConsultationQueueState, ConsultationRequest, ConsultationStatus, ConsultationStore, DailyCounters,
    FinishedTiming, InMemoryCacheStore, InMemoryConsultationStore, PresenceStatus, Priority, QueueError, Specialty,
};
use shared_config::AppConfig;
use shared_models::user::{User, UserRole};
use shared_utils::test_utils::TestUser;

pub struct Harness {
    pub state: Arc<ConsultationQueueState>,
    pub store: Arc<InMemoryConsultationStore>,
    pub cache: Arc<InMemoryCacheStore>,
}

pub async fn harness() -> Harness {
    harness_with(AppConfig::default()).await
}

pub async fn harness_with(config: AppConfig) -> Harness {
    harness_with_store(config, Arc::new(InMemoryConsultationStore::new())).await
}

pub async fn harness_with_store(config: AppConfig, store: Arc<InMemoryConsultationStore>) -> Harness {
    let cache = Arc::new(InMemoryCacheStore::new());
    let state = ConsultationQueueState::new(Arc::new(config), store.clone(), cache.clone())
        .await
        .unwrap();

    Harness { state, store, cache }
}

pub async fn state_with_backends(
    config: AppConfig,
    store: Arc<dyn ConsultationStore>,
    cache: Arc<dyn CacheStore>,
) -> Arc<ConsultationQueueState> {
    ConsultationQueueState::new(Arc::new(config), store, cache)
        .await
        .unwrap()
}

pub fn patient() -> User {
    TestUser::patient().to_user()
}

pub fn admin() -> User {
    TestUser::admin().to_user()
}

/// A professional known to the tracker and online as available.
pub async fn online_professional(state: &ConsultationQueueState, role: UserRole) -> User {
    let user = TestUser::professional(role).to_user();
    state.presence.register(user.id, role, true).await.unwrap();
    state
        .presence
        .set_presence(user.id, true, PresenceStatus::Available)
        .await
        .unwrap();
    user
}

pub fn request_at(
    patient_id: Uuid,
    specialty: Specialty,
    priority: Priority,
    created_at: DateTime<Utc>,
) -> ConsultationRequest {
    let mut request = ConsultationRequest::new(patient_id, specialty, priority, "Dor persistente".to_string());
    request.created_at = created_at;
    request
}

pub fn at(date: NaiveDate, hour: u32, minute: u32) -> DateTime<Utc> {
    date.and_hms_opt(hour, minute, 0).unwrap().and_utc()
}

pub fn today_at(hour: u32, minute: u32) -> DateTime<Utc> {
    at(Utc::now().date_naive(), hour, minute)
}

/// Store a finished request with the given wait and duration in minutes.
pub async fn seed_finished(
    store: &InMemoryConsultationStore,
    specialty: Specialty,
    created_at: DateTime<Utc>,
    wait_minutes: i64,
    duration_minutes: i64,
) {
    let mut request = request_at(Uuid::new_v4(), specialty, Priority::Media, created_at);
    let started_at = created_at + chrono::Duration::minutes(wait_minutes);
    request.status = ConsultationStatus::Finished;
    request.started_at = Some(started_at);
    request.finished_at = Some(started_at + chrono::Duration::minutes(duration_minutes));
    request.assigned_professional_id = Some(Uuid::new_v4());
    store.save(&request).await.unwrap();
}

/// Wait for the next message carrying `event`, skipping others.
pub async fn next_event(receiver: &mut broadcast::Receiver<String>, event: &str) -> Value {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let raw = receiver.recv().await.unwrap();
            let message: Value = serde_json::from_str(&raw).unwrap();
            if message["event"] == event {
                return message;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {} event received", event))
}

pub async fn next_outbound(receiver: &mut mpsc::Receiver<String>, event: &str) -> Value {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let raw = receiver.recv().await.unwrap();
            let message: Value = serde_json::from_str(&raw).unwrap();
            if message["event"] == event {
                return message;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {} message received", event))
}

/// Drain whatever is buffered right now.
pub fn drain(receiver: &mut broadcast::Receiver<String>) -> Vec<Value> {
    let mut messages = Vec::new();
    while let Ok(raw) = receiver.try_recv() {
        messages.push(serde_json::from_str(&raw).unwrap());
    }
    messages
}

/// In-memory store whose writes can be switched off.
pub struct FlakyStore {
    pub inner: InMemoryConsultationStore,
    fail_writes: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self {
            inner: InMemoryConsultationStore::new(),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), QueueError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(QueueError::StoreUnavailable("connection refused".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ConsultationStore for FlakyStore {
    async fn find_queued(&self, specialty: Specialty) -> Result<Vec<ConsultationRequest>, QueueError> {
        self.inner.find_queued(specialty).await
    }

    async fn find_assigned(&self, specialty: Specialty) -> Result<Vec<ConsultationRequest>, QueueError> {
        self.inner.find_assigned(specialty).await
    }

    async fn find_by_id(&self, request_id: Uuid) -> Result<Option<ConsultationRequest>, QueueError> {
        self.inner.find_by_id(request_id).await
    }

    async fn count_by_status(&self, specialty: Specialty, status: ConsultationStatus) -> Result<u64, QueueError> {
        self.inner.count_by_status(specialty, status).await
    }

    async fn find_finished_since(
        &self,
        specialty: Specialty,
        since: DateTime<Utc>,
    ) -> Result<Vec<FinishedTiming>, QueueError> {
        self.inner.find_finished_since(specialty, since).await
    }

    async fn save(&self, request: &ConsultationRequest) -> Result<(), QueueError> {
        self.check()?;
        self.inner.save(request).await
    }

    async fn upsert_daily_statistics(
        &self,
        specialty: Specialty,
        date: NaiveDate,
        counters: &DailyCounters,
    ) -> Result<(), QueueError> {
        self.check()?;
        self.inner.upsert_daily_statistics(specialty, date, counters).await
    }
}

/// Cache backend that is always down.
pub struct BrokenCache;

#[async_trait]
impl CacheStore for BrokenCache {
    async fn get(&self, _key: &str) -> Result<Option<String>, QueueError> {
        Err(QueueError::StoreUnavailable("cache offline".to_string()))
    }

    async fn set(&self, _key: &str, _value: &str, _ttl_seconds: u64) -> Result<(), QueueError> {
        Err(QueueError::StoreUnavailable("cache offline".to_string()))
    }

    async fn delete(&self, _key: &str) -> Result<(), QueueError> {
        Err(QueueError::StoreUnavailable("cache offline".to_string()))
    }
}
