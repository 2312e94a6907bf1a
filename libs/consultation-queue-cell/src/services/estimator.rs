use std::sync::Arc;

use chrono::{DateTime, Duration, FixedOffset, Offset, Timelike, Utc};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::error::QueueError;
use crate::models::{
    Confidence, ConsultationStatus, EstimatorConfig, FinishedTiming, HistoricalStats, QueueSnapshot,
    QueueStatistics, RequestWaitEstimate, Specialty, WaitTimeSnapshot,
};
use crate::services::cache::CacheStore;
use crate::services::dispatch::ConsultationDispatcher;
use crate::services::presence::PresenceTracker;
use crate::services::store::ConsultationStore;

const HOURS_PER_DAY: usize = 24;
const PEAK_FACTOR: f64 = 1.5;
const OFF_PEAK_FACTOR: f64 = 0.5;
const MAX_HISTORY_DAYS: i64 = 90;

pub fn wait_time_cache_key(specialty: Specialty) -> String {
    format!("wait_time:{}", specialty)
}

/// Aggregates over finished requests in a trailing window.
#[derive(Debug, Clone, PartialEq)]
pub struct History {
    pub sample_count: usize,
    pub average_wait_time: Option<u32>,
    pub average_duration: Option<u32>,
    pub hourly_distribution: [u32; HOURS_PER_DAY],
}

impl History {
    pub fn empty() -> Self {
        Self {
            sample_count: 0,
            average_wait_time: None,
            average_duration: None,
            hourly_distribution: [0; HOURS_PER_DAY],
        }
    }

    /// Requests are bucketed by the local hour of their creation.
    pub fn from_timings(timings: &[FinishedTiming], utc_offset_hours: i32) -> Self {
        if timings.is_empty() {
            return Self::empty();
        }

        let offset = local_offset(utc_offset_hours);
        let mut hourly_distribution = [0u32; HOURS_PER_DAY];
        let mut wait_seconds = 0i64;
        let mut duration_seconds = 0i64;

        for timing in timings {
            wait_seconds += (timing.started_at - timing.created_at).num_seconds().max(0);
            duration_seconds += (timing.finished_at - timing.started_at).num_seconds().max(0);
            let hour = timing.created_at.with_timezone(&offset).hour() as usize;
            hourly_distribution[hour] += 1;
        }

        let count = timings.len() as f64;
        Self {
            sample_count: timings.len(),
            average_wait_time: Some(round_minutes(wait_seconds as f64 / count / 60.0)),
            average_duration: Some(round_minutes(duration_seconds as f64 / count / 60.0)),
            hourly_distribution,
        }
    }

    fn mean_bucket(&self) -> f64 {
        self.hourly_distribution.iter().map(|&c| c as f64).sum::<f64>() / HOURS_PER_DAY as f64
    }

    pub fn peak_hours(&self) -> Vec<u32> {
        let threshold = self.mean_bucket() * PEAK_FACTOR;
        self.hours_where(|count| count > threshold)
    }

    pub fn off_peak_hours(&self) -> Vec<u32> {
        let threshold = self.mean_bucket() * OFF_PEAK_FACTOR;
        self.hours_where(|count| count < threshold)
    }

    fn hours_where(&self, predicate: impl Fn(f64) -> bool) -> Vec<u32> {
        self.hourly_distribution
            .iter()
            .enumerate()
            .filter(|&(_, &count)| predicate(count as f64))
            .map(|(hour, _)| hour as u32)
            .collect()
    }
}

fn local_offset(utc_offset_hours: i32) -> FixedOffset {
    FixedOffset::east_opt(utc_offset_hours.clamp(-23, 23) * 3600).unwrap_or_else(|| Utc.fix())
}

fn round_minutes(value: f64) -> u32 {
    if value.is_finite() && value > 0.0 {
        value.round() as u32
    } else {
        0
    }
}

/// Pure estimate for one specialty given its queue, capacity and history.
pub fn estimate_wait(
    queue_length: usize,
    online_professionals: usize,
    history: &History,
    hour: u32,
    config: &EstimatorConfig,
) -> (u32, Confidence) {
    if online_professionals == 0 {
        return (0, Confidence::Low);
    }

    let duration = history.average_duration.unwrap_or(config.default_duration_minutes) as f64;
    let base = round_minutes(queue_length as f64 * duration / online_professionals as f64);

    let blended = match history.average_wait_time {
        Some(average_wait) => round_minutes((average_wait as f64 + base as f64) / 2.0),
        None => base,
    };

    if history.peak_hours().contains(&hour) {
        (round_minutes(blended as f64 * config.peak_multiplier), Confidence::Medium)
    } else if history.off_peak_hours().contains(&hour) {
        (round_minutes(blended as f64 * config.off_peak_multiplier), Confidence::High)
    } else if history.sample_count > config.confident_sample_threshold {
        (blended, Confidence::High)
    } else {
        (blended, Confidence::Medium)
    }
}

pub struct WaitTimeEstimator {
    cache: Arc<dyn CacheStore>,
    store: Arc<dyn ConsultationStore>,
    presence: Arc<PresenceTracker>,
    dispatcher: Arc<ConsultationDispatcher>,
    config: EstimatorConfig,
}

impl WaitTimeEstimator {
    pub fn new(
        cache: Arc<dyn CacheStore>,
        store: Arc<dyn ConsultationStore>,
        presence: Arc<PresenceTracker>,
        dispatcher: Arc<ConsultationDispatcher>,
        config: EstimatorConfig,
    ) -> Self {
        Self {
            cache,
            store,
            presence,
            dispatcher,
            config,
        }
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    pub async fn calculate_wait_time(&self, specialty: Specialty) -> Result<WaitTimeSnapshot, QueueError> {
        self.calculate_wait_time_at(specialty, Utc::now()).await
    }

    /// Cached estimate for `specialty`, recomputed on a miss. Cache failures
    /// only cost a recomputation.
    #[instrument(skip(self), fields(specialty = %specialty))]
    pub async fn calculate_wait_time_at(
        &self,
        specialty: Specialty,
        now: DateTime<Utc>,
    ) -> Result<WaitTimeSnapshot, QueueError> {
        let key = wait_time_cache_key(specialty);
        let queue = self.dispatcher.snapshot(specialty)?;

        match self.cache.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str::<WaitTimeSnapshot>(&raw) {
                Ok(cached) if cached.queue_version == queue.version => {
                    debug!("Wait-time cache hit for {}", specialty);
                    return Ok(cached);
                }
                Ok(_) => debug!("Cached wait time for {} predates the current queue", specialty),
                Err(e) => warn!("Discarding unreadable cached wait time for {}: {}", specialty, e),
            },
            Ok(None) => {}
            Err(e) => warn!("Wait-time cache read failed for {}: {}", specialty, e),
        }

        let (estimate, complete) = self.compute(specialty, &queue, now).await;

        if complete {
            self.store_in_cache(&key, &estimate).await;
        }

        Ok(estimate)
    }

    async fn compute(&self, specialty: Specialty, queue: &QueueSnapshot, now: DateTime<Utc>) -> (WaitTimeSnapshot, bool) {
        let online_professionals = self.presence.count(specialty).await;

        let (history, complete) = match self.load_history(specialty, self.config.history_days, now).await {
            Ok(history) => (history, true),
            Err(e) => {
                warn!("Estimating {} without history: {}", specialty, e);
                (History::empty(), false)
            }
        };

        let hour = now.with_timezone(&local_offset(self.config.utc_offset_hours)).hour();
        let (estimated_wait_time, confidence) =
            estimate_wait(queue.queue_length(), online_professionals, &history, hour, &self.config);

        debug!(
            "Computed {} min ({:?}) for {}: {} queued, {} online, {} samples",
            estimated_wait_time,
            confidence,
            specialty,
            queue.queue_length(),
            online_professionals,
            history.sample_count
        );

        let snapshot = WaitTimeSnapshot {
            specialty,
            estimated_wait_time,
            queue_length: queue.queue_length(),
            online_professionals,
            confidence,
            computed_at: now,
            ttl_seconds: self.config.cache_ttl_seconds,
            queue_version: queue.version,
        };

        (snapshot, complete)
    }

    async fn store_in_cache(&self, key: &str, estimate: &WaitTimeSnapshot) {
        let raw = match serde_json::to_string(estimate) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Failed to serialize wait time for {}: {}", estimate.specialty, e);
                return;
            }
        };

        if let Err(e) = self.cache.set(key, &raw, self.config.cache_ttl_seconds).await {
            warn!("Wait-time cache write failed for {}: {}", estimate.specialty, e);
        }
    }

    async fn load_history(&self, specialty: Specialty, days: i64, now: DateTime<Utc>) -> Result<History, QueueError> {
        let since = now - Duration::days(days);
        let timings = self.store.find_finished_since(specialty, since).await?;
        Ok(History::from_timings(&timings, self.config.utc_offset_hours))
    }

    pub async fn historical_wait_time(&self, specialty: Specialty, days: i64) -> Result<HistoricalStats, QueueError> {
        self.historical_wait_time_at(specialty, days, Utc::now()).await
    }

    #[instrument(skip(self), fields(specialty = %specialty))]
    pub async fn historical_wait_time_at(
        &self,
        specialty: Specialty,
        days: i64,
        now: DateTime<Utc>,
    ) -> Result<HistoricalStats, QueueError> {
        if !(1..=MAX_HISTORY_DAYS).contains(&days) {
            return Err(QueueError::ValidationError(format!(
                "days must be between 1 and {}",
                MAX_HISTORY_DAYS
            )));
        }

        let history = self.load_history(specialty, days, now).await?;

        Ok(HistoricalStats {
            specialty,
            days,
            sample_count: history.sample_count,
            average_wait_time: history.average_wait_time,
            average_duration: history.average_duration,
            peak_hours: history.peak_hours(),
            off_peak_hours: history.off_peak_hours(),
            hourly_distribution: history.hourly_distribution.to_vec(),
        })
    }

    #[instrument(skip(self), fields(specialty = %specialty))]
    pub async fn queue_statistics(&self, specialty: Specialty) -> Result<QueueStatistics, QueueError> {
        let now = Utc::now();
        let queue = self.dispatcher.snapshot(specialty)?;
        let finished_total = self.store.count_by_status(specialty, ConsultationStatus::Finished).await?;
        let cancelled_total = self.store.count_by_status(specialty, ConsultationStatus::Cancelled).await?;
        let history = self.load_history(specialty, self.config.history_days, now).await?;
        let estimate = self.calculate_wait_time_at(specialty, now).await?;

        Ok(QueueStatistics {
            specialty,
            queued: queue.queue_length(),
            in_progress: queue.in_progress.len(),
            finished_total,
            cancelled_total,
            online_professionals: estimate.online_professionals,
            average_wait_time: history.average_wait_time,
            average_duration: history.average_duration,
            estimated_wait_time: estimate.estimated_wait_time,
            confidence: estimate.confidence,
        })
    }

    /// Estimate for one waiting request from the requests ahead of it.
    #[instrument(skip(self))]
    pub async fn calculate_request_wait_time(&self, request_id: Uuid) -> Result<RequestWaitEstimate, QueueError> {
        let position = self.dispatcher.position_of(request_id).await?;
        let online_professionals = self.presence.count(position.specialty).await;

        let history = match self
            .load_history(position.specialty, self.config.history_days, Utc::now())
            .await
        {
            Ok(history) => history,
            Err(e) => {
                warn!("Estimating request {} without history: {}", request_id, e);
                History::empty()
            }
        };

        let estimated_wait_time = if online_professionals == 0 {
            0
        } else {
            let duration = history.average_duration.unwrap_or(self.config.default_duration_minutes) as f64;
            round_minutes(position.ahead as f64 * duration / online_professionals as f64)
        };

        Ok(RequestWaitEstimate {
            position,
            estimated_wait_time,
            online_professionals,
        })
    }

    /// Drop the cached estimate, e.g. after an external status change.
    pub async fn invalidate(&self, specialty: Specialty) {
        if let Err(e) = self.cache.delete(&wait_time_cache_key(specialty)).await {
            warn!("Failed to invalidate wait-time cache for {}: {}", specialty, e);
        }
    }
}
