//! In-process storage backend.
//!
//! All state sits behind one mutex, which makes every operation a single
//! atomic read-modify-write. Each queue keeps an ordered index of its PENDING
//! jobs so `claim_next` does not scan unrelated jobs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, HashSet};

use super::{JobFilter, JobStorage, StatusCounts};
use crate::error::{JobsError, Result};
use crate::jobs::job::{Job, JobId, JobStatus, StatusUpdate};
use crate::jobs::schedule::{ScheduleDefinition, ScheduleFiring, ScheduleId};

/// Claim order: priority descending, then creation time, then insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct PendingKey {
    priority: Reverse<i16>,
    created_at: DateTime<Utc>,
    seq: u64,
    id: JobId,
}

#[derive(Debug)]
struct StoredJob {
    job: Job,
    seq: u64,
}

impl StoredJob {
    fn key(&self) -> PendingKey {
        PendingKey {
            priority: Reverse(self.job.priority.rank()),
            created_at: self.job.created_at,
            seq: self.seq,
            id: self.job.id,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<JobId, StoredJob>,
    pending: HashMap<String, BTreeSet<PendingKey>>,
    next_seq: u64,
    paused: HashSet<String>,
    schedules: HashMap<ScheduleId, ScheduleDefinition>,
}

impl Inner {
    fn index(&mut self, stored_id: JobId) {
        if let Some(stored) = self.jobs.get(&stored_id) {
            let key = stored.key();
            self.pending
                .entry(stored.job.queue_name.clone())
                .or_default()
                .insert(key);
        }
    }

    fn unindex(&mut self, stored_id: JobId) {
        if let Some(stored) = self.jobs.get(&stored_id) {
            let key = stored.key();
            if let Some(index) = self.pending.get_mut(&stored.job.queue_name) {
                index.remove(&key);
            }
        }
    }
}

/// Storage that lives and dies with the process.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    inner: Mutex<Inner>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored jobs in any status.
    pub fn len(&self) -> usize {
        self.inner.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl JobStorage for InMemoryStorage {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn persist(&self, job: &Job) -> Result<JobId> {
        let mut inner = self.inner.lock();
        if inner.jobs.contains_key(&job.id) {
            return Err(JobsError::duplicate_id("Job", job.id));
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.jobs.insert(
            job.id,
            StoredJob {
                job: job.clone(),
                seq,
            },
        );
        if job.status == JobStatus::Pending {
            inner.index(job.id);
        }
        Ok(job.id)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.inner.lock().jobs.get(&id).map(|s| s.job.clone()))
    }

    async fn update_status(&self, id: JobId, update: StatusUpdate) -> Result<Job> {
        let now = Utc::now();
        let mut inner = self.inner.lock();

        let mut job = inner
            .jobs
            .get(&id)
            .map(|s| s.job.clone())
            .ok_or_else(|| JobsError::not_found("Job", id.to_string()))?;
        let was_pending = job.status == JobStatus::Pending;
        job.apply(&update, now)?;

        if was_pending {
            inner.unindex(id);
        }
        if let Some(stored) = inner.jobs.get_mut(&id) {
            stored.job = job.clone();
        }
        if job.status == JobStatus::Pending {
            inner.index(id);
        }
        Ok(job)
    }

    async fn get_jobs_by_status(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let now = Utc::now();
        let inner = self.inner.lock();
        let mut matched: Vec<&StoredJob> = inner
            .jobs
            .values()
            .filter(|s| filter.matches(&s.job, now))
            .collect();
        matched.sort_by_key(|s| (s.job.created_at, s.seq));
        Ok(matched
            .into_iter()
            .skip(filter.offset)
            .take(filter.effective_limit())
            .map(|s| s.job.clone())
            .collect())
    }

    async fn claim_next(&self, queue_name: &str, worker_id: &str) -> Result<Option<Job>> {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        let Inner { jobs, pending, .. } = &mut *inner;

        let Some(index) = pending.get_mut(queue_name) else {
            return Ok(None);
        };
        let key = index
            .iter()
            .find(|key| jobs.get(&key.id).is_some_and(|s| s.job.is_eligible(now)))
            .copied();
        let Some(key) = key else {
            return Ok(None);
        };
        index.remove(&key);

        match jobs.get_mut(&key.id) {
            Some(stored) => {
                stored.job.claim(worker_id, now);
                Ok(Some(stored.job.clone()))
            }
            None => Ok(None),
        }
    }

    async fn clear_queue(&self, queue_name: &str) -> Result<u64> {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        let Inner { jobs, pending, .. } = &mut *inner;

        let Some(index) = pending.remove(queue_name) else {
            return Ok(0);
        };
        let mut cleared = 0;
        for key in index {
            if let Some(stored) = jobs.get_mut(&key.id) {
                if stored.job.apply(&StatusUpdate::cancelled(), now).is_ok() {
                    cleared += 1;
                }
            }
        }
        Ok(cleared)
    }

    async fn count_by_status(&self, queue_name: Option<&str>) -> Result<StatusCounts> {
        let now = Utc::now();
        let inner = self.inner.lock();
        let mut counts = StatusCounts::default();
        for stored in inner.jobs.values() {
            if queue_name.map_or(true, |q| stored.job.queue_name == q) {
                counts.add(stored.job.effective_status(now), 1);
            }
        }
        Ok(counts)
    }

    async fn queue_names(&self) -> Result<Vec<String>> {
        let inner = self.inner.lock();
        let names: BTreeSet<String> = inner
            .jobs
            .values()
            .map(|s| s.job.queue_name.clone())
            .chain(inner.paused.iter().cloned())
            .collect();
        Ok(names.into_iter().collect())
    }

    async fn set_queue_paused(&self, queue_name: &str, paused: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        if paused {
            inner.paused.insert(queue_name.to_string());
        } else {
            inner.paused.remove(queue_name);
        }
        Ok(())
    }

    async fn paused_queues(&self) -> Result<HashSet<String>> {
        Ok(self.inner.lock().paused.clone())
    }

    async fn insert_schedule(&self, schedule: &ScheduleDefinition) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.schedules.contains_key(&schedule.id) {
            return Err(JobsError::duplicate_id("Schedule", schedule.id));
        }
        inner.schedules.insert(schedule.id, schedule.clone());
        Ok(())
    }

    async fn get_schedule(&self, id: ScheduleId) -> Result<Option<ScheduleDefinition>> {
        Ok(self.inner.lock().schedules.get(&id).cloned())
    }

    async fn list_schedules(&self) -> Result<Vec<ScheduleDefinition>> {
        let mut schedules: Vec<_> = self.inner.lock().schedules.values().cloned().collect();
        schedules.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        Ok(schedules)
    }

    async fn save_schedule(&self, schedule: &ScheduleDefinition) -> Result<bool> {
        let mut inner = self.inner.lock();
        let stored = inner
            .schedules
            .get_mut(&schedule.id)
            .ok_or_else(|| JobsError::not_found("Schedule", schedule.id.to_string()))?;
        if stored.run_count != schedule.run_count {
            return Ok(false);
        }
        let last_run_at = stored.last_run_at;
        *stored = schedule.clone();
        stored.last_run_at = last_run_at;
        Ok(true)
    }

    async fn delete_schedule(&self, id: ScheduleId) -> Result<bool> {
        Ok(self.inner.lock().schedules.remove(&id).is_some())
    }

    async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleDefinition>> {
        let mut due: Vec<_> = self
            .inner
            .lock()
            .schedules
            .values()
            .filter(|s| s.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|s| s.next_run_at);
        Ok(due)
    }

    async fn claim_firing(&self, firing: &ScheduleFiring) -> Result<bool> {
        let mut inner = self.inner.lock();
        match inner.schedules.get_mut(&firing.schedule_id) {
            Some(s) if s.enabled && s.run_count == firing.run_count => {
                s.last_run_at = Some(firing.fired_at);
                s.next_run_at = firing.next_run_at;
                s.run_count += 1;
                s.enabled = !firing.disable;
                s.updated_at = firing.fired_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn revert_firing(&self, firing: &ScheduleFiring) -> Result<bool> {
        let mut inner = self.inner.lock();
        match inner.schedules.get_mut(&firing.schedule_id) {
            Some(s) if s.run_count == firing.run_count + 1 => {
                s.last_run_at = firing.previous_last_run_at;
                s.next_run_at = firing.previous_next_run_at;
                s.run_count = firing.run_count;
                s.enabled = s.enabled || firing.disable;
                s.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::job::{JobFailure, NewJob, Priority};
    use crate::jobs::schedule::{NewSchedule, Schedule};
    use serde_json::json;
    use std::time::Duration;

    async fn enqueue(storage: &InMemoryStorage, job: NewJob) -> JobId {
        storage.persist(&job.into_job(Utc::now())).await.unwrap()
    }

    #[tokio::test]
    async fn test_persist_duplicate_id() {
        let storage = InMemoryStorage::new();
        let job = NewJob::new("t").into_job(Utc::now());
        storage.persist(&job).await.unwrap();
        let err = storage.persist(&job).await.unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::DuplicateId);
    }

    #[tokio::test]
    async fn test_claim_respects_priority_then_fifo() {
        let storage = InMemoryStorage::new();
        let low = enqueue(&storage, NewJob::new("t").priority(Priority::Low)).await;
        let first_normal = enqueue(&storage, NewJob::new("t")).await;
        let critical = enqueue(&storage, NewJob::new("t").priority(Priority::Critical)).await;
        let second_normal = enqueue(&storage, NewJob::new("t")).await;

        let mut order = Vec::new();
        while let Some(job) = storage.claim_next("default", "w").await.unwrap() {
            order.push(job.id);
        }
        assert_eq!(order, vec![critical, first_normal, second_normal, low]);
    }

    #[tokio::test]
    async fn test_future_jobs_are_not_claimed() {
        let storage = InMemoryStorage::new();
        enqueue(
            &storage,
            NewJob::new("t")
                .priority(Priority::Critical)
                .scheduled_at(Utc::now() + chrono::Duration::hours(1)),
        )
        .await;
        let ready = enqueue(&storage, NewJob::new("t").priority(Priority::Low)).await;

        let claimed = storage.claim_next("default", "w").await.unwrap().unwrap();
        assert_eq!(claimed.id, ready);
        assert_eq!(claimed.status, JobStatus::Running);
        assert_eq!(claimed.worker_id.as_deref(), Some("w"));
        assert!(claimed.started_at.is_some());
        assert!(storage.claim_next("default", "w").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_is_per_queue() {
        let storage = InMemoryStorage::new();
        enqueue(&storage, NewJob::new("t").queue("emails")).await;
        assert!(storage.claim_next("reports", "w").await.unwrap().is_none());
        assert!(storage.claim_next("emails", "w").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_retry_reindexes_job() {
        let storage = InMemoryStorage::new();
        let id = enqueue(&storage, NewJob::new("t")).await;
        storage.claim_next("default", "w").await.unwrap().unwrap();

        let update = StatusUpdate::retry_at(1, Utc::now(), JobFailure::new("TaskError", "x"));
        storage.update_status(id, update).await.unwrap();

        let again = storage.claim_next("default", "w").await.unwrap().unwrap();
        assert_eq!(again.id, id);
        assert_eq!(again.retries, 1);
    }

    #[tokio::test]
    async fn test_invalid_transition_leaves_job_untouched() {
        let storage = InMemoryStorage::new();
        let id = enqueue(&storage, NewJob::new("t")).await;
        let before = storage.get(id).await.unwrap().unwrap();

        let err = storage
            .update_status(id, StatusUpdate::succeeded(json!(1)))
            .await
            .unwrap_err();
        assert!(err.is_invalid_transition());
        assert_eq!(storage.get(id).await.unwrap().unwrap(), before);
    }

    #[tokio::test]
    async fn test_update_unknown_job() {
        let storage = InMemoryStorage::new();
        let err = storage
            .update_status(JobId::new(), StatusUpdate::cancelled())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_cancelled_job_is_never_claimed() {
        let storage = InMemoryStorage::new();
        let id = enqueue(&storage, NewJob::new("t")).await;
        storage.update_status(id, StatusUpdate::cancelled()).await.unwrap();
        assert!(storage.claim_next("default", "w").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clear_queue_cancels_pending_only() {
        let storage = InMemoryStorage::new();
        for _ in 0..3 {
            enqueue(&storage, NewJob::new("t")).await;
        }
        enqueue(&storage, NewJob::new("t").queue("other")).await;
        let claimed = storage.claim_next("default", "w").await.unwrap().unwrap();

        assert_eq!(storage.clear_queue("default").await.unwrap(), 2);
        let counts = storage.count_by_status(Some("default")).await.unwrap();
        assert_eq!(counts.cancelled, 2);
        assert_eq!(counts.running, 1);
        assert_eq!(storage.get(claimed.id).await.unwrap().unwrap().status, JobStatus::Running);
        assert_eq!(storage.count_by_status(Some("other")).await.unwrap().pending, 1);
        assert!(storage.claim_next("default", "w").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_listing_is_ordered_and_paged() {
        let storage = InMemoryStorage::new();
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(enqueue(&storage, NewJob::new("t")).await);
        }
        let page = storage
            .get_jobs_by_status(&JobFilter::default().page(2, 1))
            .await
            .unwrap();
        assert_eq!(page.iter().map(|j| j.id).collect::<Vec<_>>(), ids[1..3].to_vec());

        let again = storage
            .get_jobs_by_status(&JobFilter::default().page(2, 1))
            .await
            .unwrap();
        assert_eq!(page, again);
    }

    #[tokio::test]
    async fn test_counts_report_scheduled() {
        let storage = InMemoryStorage::new();
        enqueue(&storage, NewJob::new("t")).await;
        enqueue(
            &storage,
            NewJob::new("t").scheduled_at(Utc::now() + chrono::Duration::minutes(10)),
        )
        .await;
        let counts = storage.count_by_status(None).await.unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.scheduled, 1);
    }

    #[tokio::test]
    async fn test_paused_queues() {
        let storage = InMemoryStorage::new();
        storage.set_queue_paused("emails", true).await.unwrap();
        assert!(storage.paused_queues().await.unwrap().contains("emails"));
        assert_eq!(storage.queue_names().await.unwrap(), vec!["emails".to_string()]);
        storage.set_queue_paused("emails", false).await.unwrap();
        assert!(storage.paused_queues().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_firing_claim_and_revert() {
        let storage = InMemoryStorage::new();
        let now = Utc::now();
        let def = NewSchedule::new("s", "noop", Schedule::interval(Duration::from_secs(60)))
            .into_definition(now - chrono::Duration::minutes(2))
            .unwrap();
        storage.insert_schedule(&def).await.unwrap();

        let firing = def.firing(now).unwrap();
        assert!(storage.claim_firing(&firing).await.unwrap());
        // second claim with the same observed run_count loses
        assert!(!storage.claim_firing(&firing).await.unwrap());

        let fired = storage.get_schedule(def.id).await.unwrap().unwrap();
        assert_eq!(fired.run_count, 1);
        assert_eq!(fired.last_run_at, Some(now));

        assert!(storage.revert_firing(&firing).await.unwrap());
        let reverted = storage.get_schedule(def.id).await.unwrap().unwrap();
        assert_eq!(reverted.run_count, 0);
        assert_eq!(reverted.next_run_at, def.next_run_at);
        assert_eq!(reverted.last_run_at, None);
    }

    #[tokio::test]
    async fn test_stale_save_after_firing_is_rejected() {
        let storage = InMemoryStorage::new();
        let now = Utc::now();
        let mut def = NewSchedule::new("s", "noop", Schedule::interval(Duration::from_secs(60)))
            .into_definition(now)
            .unwrap();
        def.next_run_at = Some(now - chrono::Duration::seconds(1));
        storage.insert_schedule(&def).await.unwrap();
        assert!(storage.claim_firing(&def.firing(now).unwrap()).await.unwrap());

        let mut stale = def.clone();
        stale.name = "renamed".into();
        assert!(!storage.save_schedule(&stale).await.unwrap());

        let stored = storage.get_schedule(def.id).await.unwrap().unwrap();
        assert_eq!(stored.name, "s");
        assert_eq!(stored.run_count, 1);
        assert!(storage.due_schedules(now).await.unwrap().is_empty());

        let mut fresh = stored.clone();
        fresh.name = "renamed".into();
        assert!(storage.save_schedule(&fresh).await.unwrap());
        let stored = storage.get_schedule(def.id).await.unwrap().unwrap();
        assert_eq!(stored.name, "renamed");
        assert_eq!(stored.last_run_at, Some(now));
    }
}
