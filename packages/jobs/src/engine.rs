//! Chunked, checkpointed execution.
//!
//! A job walks its pending targets in fixed-size chunks, computes a result
//! for every target of a chunk, and commits the chunk in one atomic write.
//! Progress lives entirely in the destination: re-running a job rebuilds
//! the pending set from what is already committed, so an interrupted run
//! resumes where it stopped.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use mobility_database::{ActorStore, DbError, ResultRecord, ResultStore};
use mobility_models::{ActorId, Classification, InferenceMethod};

use crate::JobError;
use crate::pending::JobTarget;
use crate::progress::ProgressCallback;

/// Default number of targets per committed chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 20;

/// A place job results are committed to.
pub trait Destination {
    type Record;

    /// Name used in logs and lease keys.
    fn name(&self) -> &str;

    /// Ids of targets that already have a committed result.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the store cannot be read.
    fn completed_ids(&self) -> Result<BTreeSet<String>, DbError>;

    /// Commits a chunk atomically.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if any record could not be written; in that
    /// case none of them were.
    fn commit(&self, records: &[Self::Record]) -> Result<u64, DbError>;

    /// Claims targets for `worker`. Destinations without leases grant
    /// everything.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the claim could not be recorded.
    fn claim(&self, ids: &[String], _worker: &str, _ttl: Duration) -> Result<Vec<String>, DbError> {
        Ok(ids.to_vec())
    }

    /// Releases every claim held by `worker`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the release failed.
    fn release(&self, _worker: &str) -> Result<(), DbError> {
        Ok(())
    }
}

/// A destination whose targets were seeded up front and are filled in
/// place.
pub trait FillDestination {
    type Record;

    fn name(&self) -> &str;

    /// # Errors
    ///
    /// Returns [`DbError`] if the store cannot be read.
    fn missing_ids(&self, limit: usize) -> Result<Vec<String>, DbError>;

    /// # Errors
    ///
    /// Returns [`DbError`] if the store cannot be read.
    fn count_missing(&self) -> Result<u64, DbError>;

    /// # Errors
    ///
    /// Returns [`DbError`] if the write fails.
    fn upsert(&self, record: &Self::Record) -> Result<(), DbError>;
}

/// A named [`ResultStore`] destination.
pub struct ResultDestination<'a, S> {
    store: &'a S,
    name: String,
}

impl<'a, S: ResultStore> ResultDestination<'a, S> {
    #[must_use]
    pub fn new(store: &'a S, name: impl Into<String>) -> Self {
        Self {
            store,
            name: name.into(),
        }
    }
}

impl<S: ResultStore> Destination for ResultDestination<'_, S> {
    type Record = ResultRecord;

    fn name(&self) -> &str {
        &self.name
    }

    fn completed_ids(&self) -> Result<BTreeSet<String>, DbError> {
        self.store.completed_ids(&self.name)
    }

    fn commit(&self, records: &[ResultRecord]) -> Result<u64, DbError> {
        self.store.insert_results(&self.name, records)
    }

    fn claim(&self, ids: &[String], worker: &str, ttl: Duration) -> Result<Vec<String>, DbError> {
        self.store.try_claim(&self.name, ids, worker, ttl)
    }

    fn release(&self, worker: &str) -> Result<(), DbError> {
        let released = self.store.release_claims(&self.name, worker)?;
        log::debug!("Released {released} claims on {}", self.name);
        Ok(())
    }
}

impl<S: ResultStore> FillDestination for ResultDestination<'_, S> {
    type Record = ResultRecord;

    fn name(&self) -> &str {
        &self.name
    }

    fn missing_ids(&self, limit: usize) -> Result<Vec<String>, DbError> {
        self.store.missing_result_ids(&self.name, limit)
    }

    fn count_missing(&self) -> Result<u64, DbError> {
        self.store.count_missing(&self.name)
    }

    fn upsert(&self, record: &ResultRecord) -> Result<(), DbError> {
        self.store.upsert_result(&self.name, record)
    }
}

/// Per-actor classifications for one inference method.
pub struct ClassificationDestination<'a, S> {
    store: &'a S,
    method: InferenceMethod,
    name: String,
}

impl<'a, S: ActorStore> ClassificationDestination<'a, S> {
    #[must_use]
    pub fn new(store: &'a S, method: InferenceMethod) -> Self {
        Self {
            store,
            method,
            name: format!("homes_{}", method.tag()),
        }
    }
}

impl<S: ActorStore> Destination for ClassificationDestination<'_, S> {
    type Record = (ActorId, Classification);

    fn name(&self) -> &str {
        &self.name
    }

    fn completed_ids(&self) -> Result<BTreeSet<String>, DbError> {
        Ok(self
            .store
            .classified_actor_ids(self.method)?
            .into_iter()
            .map(|id| id.to_string())
            .collect())
    }

    fn commit(&self, records: &[(ActorId, Classification)]) -> Result<u64, DbError> {
        self.store.insert_classifications(self.method, records)
    }
}

/// Lease settings for running several workers against one destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseConfig {
    pub worker: String,
    pub ttl: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOptions {
    pub chunk_size: usize,
    pub lease: Option<LeaseConfig>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            lease: None,
        }
    }
}

/// What a run committed and how long it took.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobReport {
    pub committed: u64,
    pub chunks: usize,
    pub chunk_times: Vec<Duration>,
    pub elapsed: Duration,
}

/// Runs `compute` over `pending` in chunks, committing each chunk
/// atomically to `destination`.
///
/// A failure while computing or committing stops the run. Chunks that
/// were committed before the failure stay committed; the failing chunk
/// leaves nothing behind.
///
/// # Errors
///
/// * [`JobError::Compute`] if `compute` fails for a target
/// * [`JobError::Store`] if reading, claiming or committing fails
pub fn run_chunked<D, T, I, F, E>(
    destination: &D,
    pending: I,
    options: &JobOptions,
    mut compute: F,
    progress: &dyn ProgressCallback,
) -> Result<JobReport, JobError>
where
    D: Destination,
    T: JobTarget,
    I: IntoIterator<Item = T>,
    F: FnMut(&T) -> Result<D::Record, E>,
    E: Into<Box<dyn std::error::Error>>,
{
    let start = Instant::now();
    let chunk_size = options.chunk_size.max(1);
    let mut report = JobReport::default();

    let result = (|| -> Result<(), JobError> {
        let mut targets = pending.into_iter();
        loop {
            let chunk: Vec<T> = targets.by_ref().take(chunk_size).collect();
            if chunk.is_empty() {
                return Ok(());
            }
            let chunk_start = Instant::now();

            let chunk = match &options.lease {
                Some(lease) => claim_chunk(destination, chunk, lease)?,
                None => chunk,
            };
            if chunk.is_empty() {
                continue;
            }

            let mut records = Vec::with_capacity(chunk.len());
            for target in &chunk {
                let record = compute(target).map_err(|e| JobError::Compute {
                    target: target.target_id(),
                    source: e.into(),
                })?;
                records.push(record);
            }

            report.committed += destination.commit(&records)?;
            report.chunks += 1;

            let elapsed = chunk_start.elapsed();
            report.chunk_times.push(elapsed);
            progress.chunk_committed(report.chunks, chunk.len() as u64);
            log::info!(
                "{}: chunk {} committed {} targets in {:.1}s",
                destination.name(),
                report.chunks,
                chunk.len(),
                elapsed.as_secs_f64(),
            );
        }
    })();

    if let Some(lease) = &options.lease
        && let Err(e) = destination.release(&lease.worker)
    {
        log::warn!("{}: failed to release claims: {e}", destination.name());
    }

    result?;

    report.elapsed = start.elapsed();
    log::info!(
        "{}: committed {} targets in {} chunks in {:.1}s",
        destination.name(),
        report.committed,
        report.chunks,
        report.elapsed.as_secs_f64(),
    );

    Ok(report)
}

/// Keeps only the chunk's targets that `lease.worker` managed to claim.
fn claim_chunk<D: Destination, T: JobTarget>(
    destination: &D,
    chunk: Vec<T>,
    lease: &LeaseConfig,
) -> Result<Vec<T>, DbError> {
    let ids: Vec<String> = chunk.iter().map(JobTarget::target_id).collect();
    let claimed: BTreeSet<String> = destination
        .claim(&ids, &lease.worker, lease.ttl)?
        .into_iter()
        .collect();

    if claimed.len() < ids.len() {
        log::debug!(
            "{}: {} of {} targets held by other workers",
            destination.name(),
            ids.len() - claimed.len(),
            ids.len()
        );
    }

    Ok(chunk
        .into_iter()
        .filter(|t| claimed.contains(&t.target_id()))
        .collect())
}

/// Fills seeded targets in place until none are missing.
///
/// Each round re-queries up to `batch_size` missing targets, computes and
/// upserts each one. A round that leaves the missing count unchanged means
/// the writes are not landing, and the run stops instead of looping.
///
/// # Errors
///
/// * [`JobError::Compute`] if `compute` fails for a target
/// * [`JobError::Store`] if reading or writing fails
/// * [`JobError::Stalled`] if a round makes no progress
pub fn run_fill_missing<D, F, E>(
    destination: &D,
    batch_size: usize,
    mut compute: F,
    progress: &dyn ProgressCallback,
) -> Result<JobReport, JobError>
where
    D: FillDestination,
    F: FnMut(&str) -> Result<D::Record, E>,
    E: Into<Box<dyn std::error::Error>>,
{
    let start = Instant::now();
    let batch_size = batch_size.max(1);
    let mut report = JobReport::default();

    let total = destination.count_missing()?;
    progress.set_total(total);

    loop {
        let ids = destination.missing_ids(batch_size)?;
        if ids.is_empty() {
            break;
        }
        let before = destination.count_missing()?;
        let batch_start = Instant::now();

        for id in &ids {
            let record = compute(id).map_err(|e| JobError::Compute {
                target: id.clone(),
                source: e.into(),
            })?;
            destination.upsert(&record)?;
            report.committed += 1;
        }

        let remaining = destination.count_missing()?;
        if remaining >= before {
            return Err(JobError::Stalled {
                destination: destination.name().to_string(),
                remaining,
            });
        }

        report.chunks += 1;
        report.chunk_times.push(batch_start.elapsed());
        progress.set_position(total.saturating_sub(remaining));
        log::info!(
            "{}: filled {} targets, {remaining} remaining",
            destination.name(),
            ids.len(),
        );
    }

    report.elapsed = start.elapsed();
    log::info!(
        "{}: filled {} targets in {:.1}s",
        destination.name(),
        report.committed,
        report.elapsed.as_secs_f64(),
    );

    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::BTreeMap;

    use super::*;
    use crate::pending::pending;
    use crate::progress::NullProgress;

    #[derive(Debug, thiserror::Error)]
    #[error("boom")]
    struct Boom;

    /// Destination keeping committed values in memory, rejecting duplicate
    /// targets and optionally any batch containing `reject`.
    #[derive(Default)]
    struct MemoryDestination {
        committed: RefCell<BTreeMap<String, u32>>,
        reject: Option<String>,
        claimable: Option<BTreeSet<String>>,
        released: RefCell<Vec<String>>,
    }

    impl Destination for MemoryDestination {
        type Record = (String, u32);

        fn name(&self) -> &str {
            "memory"
        }

        fn completed_ids(&self) -> Result<BTreeSet<String>, DbError> {
            Ok(self.committed.borrow().keys().cloned().collect())
        }

        fn commit(&self, records: &[(String, u32)]) -> Result<u64, DbError> {
            let mut committed = self.committed.borrow_mut();
            for (id, _) in records {
                if committed.contains_key(id) || self.reject.as_ref() == Some(id) {
                    return Err(DbError::BatchRejected {
                        target_id: id.clone(),
                        message: "rejected".to_string(),
                    });
                }
            }
            for (id, value) in records {
                committed.insert(id.clone(), *value);
            }
            Ok(records.len() as u64)
        }

        fn claim(
            &self,
            ids: &[String],
            _worker: &str,
            _ttl: Duration,
        ) -> Result<Vec<String>, DbError> {
            Ok(match &self.claimable {
                Some(free) => ids.iter().filter(|id| free.contains(*id)).cloned().collect(),
                None => ids.to_vec(),
            })
        }

        fn release(&self, worker: &str) -> Result<(), DbError> {
            self.released.borrow_mut().push(worker.to_string());
            Ok(())
        }
    }

    fn targets(n: u32) -> Vec<String> {
        (0..n).map(|i| format!("t{i:02}")).collect()
    }

    fn value_of(target: &String) -> Result<(String, u32), Boom> {
        Ok((target.clone(), target.len() as u32))
    }

    #[test]
    fn commits_in_chunks_of_twenty_by_default() {
        let dest = MemoryDestination::default();
        let report = run_chunked(
            &dest,
            targets(45),
            &JobOptions::default(),
            value_of,
            &NullProgress,
        )
        .unwrap();
        assert_eq!(report.committed, 45);
        assert_eq!(report.chunks, 3);
        assert_eq!(report.chunk_times.len(), 3);
        assert_eq!(dest.committed.borrow().len(), 45);
    }

    #[test]
    fn empty_pending_commits_nothing() {
        let dest = MemoryDestination::default();
        let report = run_chunked(
            &dest,
            Vec::<String>::new(),
            &JobOptions::default(),
            value_of,
            &NullProgress,
        )
        .unwrap();
        assert_eq!(report.committed, 0);
        assert_eq!(report.chunks, 0);
    }

    #[test]
    fn compute_failure_keeps_earlier_chunks_only() {
        let dest = MemoryDestination::default();
        let options = JobOptions {
            chunk_size: 2,
            lease: None,
        };
        let err = run_chunked(
            &dest,
            targets(6),
            &options,
            |t: &String| {
                if t == "t03" {
                    Err(Boom)
                } else {
                    value_of(t)
                }
            },
            &NullProgress,
        )
        .unwrap_err();

        assert!(matches!(err, JobError::Compute { ref target, .. } if target == "t03"));
        let committed: Vec<String> = dest.committed.borrow().keys().cloned().collect();
        assert_eq!(committed, vec!["t00".to_string(), "t01".to_string()]);
    }

    #[test]
    fn rejected_commit_leaves_chunk_uncommitted() {
        let dest = MemoryDestination {
            reject: Some("t03".to_string()),
            ..MemoryDestination::default()
        };
        let options = JobOptions {
            chunk_size: 2,
            lease: None,
        };
        let err = run_chunked(&dest, targets(6), &options, value_of, &NullProgress).unwrap_err();

        assert!(matches!(
            err,
            JobError::Store(DbError::BatchRejected { ref target_id, .. }) if target_id == "t03"
        ));
        assert_eq!(dest.committed.borrow().len(), 2);
        assert!(!dest.committed.borrow().contains_key("t02"));
    }

    #[test]
    fn rerun_resumes_without_duplicates() {
        let dest = MemoryDestination::default();
        let options = JobOptions {
            chunk_size: 3,
            lease: None,
        };
        let all = targets(10);

        let mut calls = 0;
        let _ = run_chunked(
            &dest,
            all.clone(),
            &options,
            |t: &String| {
                calls += 1;
                if calls > 4 { Err(Boom) } else { value_of(t) }
            },
            &NullProgress,
        );
        assert_eq!(dest.committed.borrow().len(), 3);

        let done = dest.completed_ids().unwrap();
        let report = run_chunked(
            &dest,
            pending(all, done),
            &options,
            value_of,
            &NullProgress,
        )
        .unwrap();
        assert_eq!(report.committed, 7);
        assert_eq!(dest.committed.borrow().len(), 10);

        // A third run finds nothing pending.
        let done = dest.completed_ids().unwrap();
        let report = run_chunked(
            &dest,
            pending(targets(10), done),
            &options,
            value_of,
            &NullProgress,
        )
        .unwrap();
        assert_eq!(report.committed, 0);
    }

    #[test]
    fn leases_skip_targets_held_elsewhere_and_release() {
        let dest = MemoryDestination {
            claimable: Some(["t00", "t02", "t04"].iter().map(ToString::to_string).collect()),
            ..MemoryDestination::default()
        };
        let options = JobOptions {
            chunk_size: 2,
            lease: Some(LeaseConfig {
                worker: "w1".to_string(),
                ttl: Duration::from_secs(60),
            }),
        };

        let mut computed = Vec::new();
        let report = run_chunked(
            &dest,
            targets(6),
            &options,
            |t: &String| {
                computed.push(t.clone());
                value_of(t)
            },
            &NullProgress,
        )
        .unwrap();

        assert_eq!(computed, vec!["t00", "t02", "t04"]);
        assert_eq!(report.committed, 3);
        assert_eq!(*dest.released.borrow(), vec!["w1".to_string()]);
    }

    /// Fill destination over an in-memory map; `stuck` makes upserts no-ops.
    struct MemoryFill {
        rows: RefCell<BTreeMap<String, Option<u32>>>,
        stuck: bool,
    }

    impl MemoryFill {
        fn seeded(n: u32, stuck: bool) -> Self {
            Self {
                rows: RefCell::new(targets(n).into_iter().map(|t| (t, None)).collect()),
                stuck,
            }
        }
    }

    impl FillDestination for MemoryFill {
        type Record = (String, u32);

        fn name(&self) -> &str {
            "memory_fill"
        }

        fn missing_ids(&self, limit: usize) -> Result<Vec<String>, DbError> {
            Ok(self
                .rows
                .borrow()
                .iter()
                .filter(|(_, v)| v.is_none())
                .map(|(k, _)| k.clone())
                .take(limit)
                .collect())
        }

        fn count_missing(&self) -> Result<u64, DbError> {
            Ok(self.rows.borrow().values().filter(|v| v.is_none()).count() as u64)
        }

        fn upsert(&self, record: &(String, u32)) -> Result<(), DbError> {
            if !self.stuck {
                self.rows.borrow_mut().insert(record.0.clone(), Some(record.1));
            }
            Ok(())
        }
    }

    #[test]
    fn fill_runs_until_nothing_is_missing() {
        let dest = MemoryFill::seeded(12, false);
        let report = run_fill_missing(
            &dest,
            5,
            |id: &str| Ok::<_, Boom>((id.to_string(), 1)),
            &NullProgress,
        )
        .unwrap();
        assert_eq!(report.committed, 12);
        assert_eq!(report.chunks, 3);
        assert_eq!(dest.count_missing().unwrap(), 0);
    }

    #[test]
    fn fill_without_progress_stalls() {
        let dest = MemoryFill::seeded(3, true);
        let err = run_fill_missing(
            &dest,
            5,
            |id: &str| Ok::<_, Boom>((id.to_string(), 1)),
            &NullProgress,
        )
        .unwrap_err();
        assert!(matches!(err, JobError::Stalled { remaining: 3, .. }));
    }
}
