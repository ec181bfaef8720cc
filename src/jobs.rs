//! Trust recomputation queue
//!
//! One live job per user. Jobs exist for back-pressure and observability; a
//! stale or failed job never makes a stored score wrong, only old.
use super::error::{Result, TradeError};
use super::storage::{Store, TxResult, abort, decode, encode};
use super::trade::TimeStamp;
use chrono::Utc;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    #[n(0)]
    Queued,
    #[n(1)]
    Running,
    #[n(2)]
    Failed,
    #[n(3)]
    Succeeded,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct TrustJob {
    #[n(0)]
    pub user_id: String,
    #[n(1)]
    pub status: JobStatus,
    #[n(2)]
    pub attempts: u32,
    #[n(3)]
    pub last_error: Option<String>,
    #[n(4)]
    pub rerun: bool, // new input arrived while running
    #[n(5)]
    pub enqueued_at: TimeStamp<Utc>,
    #[n(6)]
    pub updated_at: TimeStamp<Utc>,
}

impl TrustJob {
    fn queued(user_id: &str, now: &TimeStamp<Utc>) -> Self {
        Self {
            user_id: user_id.to_string(),
            status: JobStatus::Queued,
            attempts: 0,
            last_error: None,
            rerun: false,
            enqueued_at: now.clone(),
            updated_at: now.clone(),
        }
    }
}

fn read_job(bytes: Option<sled::IVec>) -> TxResult<Option<TrustJob>> {
    match bytes {
        Some(bytes) => decode(&bytes).map(Some).or_else(abort),
        None => Ok(None),
    }
}

impl Store {
    pub fn trust_job(&self, user_id: &str) -> Result<Option<TrustJob>> {
        match self.trust_jobs.get(user_id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Request a recomputation for `user_id`, coalescing with any live job.
    pub fn enqueue_trust_job(&self, user_id: &str, now: &TimeStamp<Utc>) -> Result<TrustJob> {
        let job = self.trust_jobs.transaction(|tx| -> TxResult<TrustJob> {
            let job = match read_job(tx.get(user_id.as_bytes())?)? {
                Some(job) if job.status == JobStatus::Queued => return Ok(job),
                Some(mut job) if job.status == JobStatus::Running => {
                    job.rerun = true;
                    job.updated_at = now.clone();
                    job
                }
                _ => TrustJob::queued(user_id, now),
            };
            tx.insert(user_id.as_bytes(), encode(&job).or_else(abort)?)?;
            Ok(job)
        })?;
        Ok(job)
    }

    /// Move a queued job to running. Only one caller wins the claim.
    pub fn claim_trust_job(&self, user_id: &str, now: &TimeStamp<Utc>) -> Result<Option<TrustJob>> {
        let job = self.trust_jobs.transaction(|tx| -> TxResult<Option<TrustJob>> {
            let Some(mut job) = read_job(tx.get(user_id.as_bytes())?)? else {
                return Ok(None);
            };
            if job.status != JobStatus::Queued {
                return Ok(None);
            }
            job.status = JobStatus::Running;
            job.attempts += 1;
            job.rerun = false;
            job.updated_at = now.clone();
            tx.insert(user_id.as_bytes(), encode(&job).or_else(abort)?)?;
            Ok(Some(job))
        })?;
        Ok(job)
    }

    /// Settle a running job. Failures are re-queued until `max_attempts`.
    pub fn finish_trust_job(
        &self,
        user_id: &str,
        outcome: std::result::Result<(), String>,
        max_attempts: u32,
        now: &TimeStamp<Utc>,
    ) -> Result<TrustJob> {
        let job = self.trust_jobs.transaction(|tx| -> TxResult<TrustJob> {
            let Some(mut job) = read_job(tx.get(user_id.as_bytes())?)? else {
                return abort(TradeError::not_found("trust job", user_id));
            };
            if job.status != JobStatus::Running {
                return abort(TradeError::Validation(format!(
                    "trust job for {user_id} is not running"
                )));
            }
            match &outcome {
                Ok(()) if job.rerun => {
                    job.status = JobStatus::Queued;
                    job.attempts = 0;
                    job.last_error = None;
                }
                Ok(()) => {
                    job.status = JobStatus::Succeeded;
                    job.last_error = None;
                }
                Err(reason) => {
                    job.last_error = Some(reason.clone());
                    job.status = if job.attempts < max_attempts {
                        JobStatus::Queued
                    } else {
                        JobStatus::Failed
                    };
                }
            }
            job.rerun = false;
            job.updated_at = now.clone();
            tx.insert(user_id.as_bytes(), encode(&job).or_else(abort)?)?;
            Ok(job)
        })?;
        Ok(job)
    }

    /// Users with a queued job, in key order.
    pub fn queued_trust_jobs(&self, limit: usize) -> Result<Vec<String>> {
        let mut users = vec![];
        for bytes in self.trust_jobs.iter().values() {
            if users.len() >= limit {
                break;
            }
            let job: TrustJob = decode(&bytes?)?;
            if job.status == JobStatus::Queued {
                users.push(job.user_id);
            }
        }
        Ok(users)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path().join("jobs.db")).unwrap();
        (dir, Store::open(Arc::new(db)).unwrap())
    }

    #[test]
    fn enqueue_coalesces() {
        let (_dir, store) = store();
        let now = TimeStamp::new();

        let first = store.enqueue_trust_job("user_a", &now).unwrap();
        let second = store
            .enqueue_trust_job("user_a", &now.plus_hours(1))
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(store.queued_trust_jobs(10).unwrap(), vec!["user_a".to_string()]);
    }

    #[test]
    fn claim_is_exclusive() {
        let (_dir, store) = store();
        let now = TimeStamp::new();
        store.enqueue_trust_job("user_a", &now).unwrap();

        assert!(store.claim_trust_job("user_a", &now).unwrap().is_some());
        assert!(store.claim_trust_job("user_a", &now).unwrap().is_none());
    }

    #[test]
    fn enqueue_while_running_reruns() {
        let (_dir, store) = store();
        let now = TimeStamp::new();
        store.enqueue_trust_job("user_a", &now).unwrap();
        store.claim_trust_job("user_a", &now).unwrap();
        store.enqueue_trust_job("user_a", &now).unwrap();

        let job = store.finish_trust_job("user_a", Ok(()), 3, &now).unwrap();
        assert_eq!(job.status, JobStatus::Queued);
    }

    #[test]
    fn failures_retry_then_give_up() {
        let (_dir, store) = store();
        let now = TimeStamp::new();
        store.enqueue_trust_job("user_a", &now).unwrap();

        for attempt in 1..=2 {
            store.claim_trust_job("user_a", &now).unwrap().unwrap();
            let job = store
                .finish_trust_job("user_a", Err("disk".into()), 2, &now)
                .unwrap();
            let expected = if attempt < 2 {
                JobStatus::Queued
            } else {
                JobStatus::Failed
            };
            assert_eq!(job.status, expected);
            assert_eq!(job.last_error.as_deref(), Some("disk"));
        }
        assert!(store.queued_trust_jobs(10).unwrap().is_empty());
    }
}
