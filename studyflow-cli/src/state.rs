use anyhow::{Context, Result, bail};
use chrono::{Duration, Utc};
use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use studyflow_core::{InMemoryStore, JobKind, JobLock, StoreSnapshot};

use crate::locks::FileJobLock;

/// Lock key guarding `state.json`; lives next to the job locks.
const STATE_LOCK: &str = "state";
const DEFAULT_WAIT: std::time::Duration = std::time::Duration::from_secs(120);
const POLL: std::time::Duration = std::time::Duration::from_millis(100);

/// `$STUDYFLOW_HOME`, or `~/.studyflow`.
pub fn studyflow_home() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("STUDYFLOW_HOME") {
        if !dir.trim().is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }
    let home = std::env::var("HOME").context("HOME is not set")?;
    Ok(PathBuf::from(home).join(".studyflow"))
}

pub fn ensure_home() -> Result<PathBuf> {
    let dir = studyflow_home()?;
    fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
    Ok(dir)
}

pub fn state_path() -> Result<PathBuf> {
    Ok(ensure_home()?.join("state.json"))
}

pub fn locks_dir() -> Result<PathBuf> {
    let dir = ensure_home()?.join("locks");
    fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
    Ok(dir)
}

pub fn outbox_path() -> Result<PathBuf> {
    Ok(ensure_home()?.join("outbox.jsonl"))
}

/// Longest a single job can keep the state locked: its timeout on every try,
/// plus a minute for loading and saving.
fn state_lock_ttl() -> Duration {
    JobKind::ALL
        .into_iter()
        .map(|job| {
            let spec = job.spec();
            spec.timeout * i32::try_from(spec.tries).unwrap_or(i32::MAX)
        })
        .max()
        .unwrap_or_else(|| Duration::minutes(10))
        + Duration::seconds(60)
}

/// `state.json`, shared by every CLI process and the daemon.
///
/// Writers go through [`StateFile::transaction`], which holds the `state`
/// file lock, reloads the file into the caller's store, runs the mutation and
/// saves the result. A process that loaded the file earlier therefore never
/// writes back a stale copy over someone else's change.
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
    locks: FileJobLock,
    wait: std::time::Duration,
}

struct StateGuard<'a> {
    locks: &'a FileJobLock,
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.locks.release(STATE_LOCK) {
            tracing::warn!(error = %e, "failed to release state lock");
        }
    }
}

impl StateFile {
    pub fn open() -> Result<Self> {
        Ok(Self::new(state_path()?, FileJobLock::new(locks_dir()?)))
    }

    pub fn new(path: impl Into<PathBuf>, locks: FileJobLock) -> Self {
        Self {
            path: path.into(),
            locks,
            wait: DEFAULT_WAIT,
        }
    }

    /// How long [`StateFile::transaction`] waits for another writer.
    pub fn with_wait(mut self, wait: std::time::Duration) -> Self {
        self.wait = wait;
        self
    }

    /// Current contents, without taking the lock. A missing file is empty.
    pub fn read(&self) -> Result<StoreSnapshot> {
        if !self.path.exists() {
            return Ok(StoreSnapshot::default());
        }
        let s = fs::read_to_string(&self.path)
            .with_context(|| format!("read {}", self.path.display()))?;
        serde_json::from_str(&s).with_context(|| format!("parse {}", self.path.display()))
    }

    /// Write through a temp file so a crash never leaves half a state file.
    fn write(&self, store: &InMemoryStore) -> Result<()> {
        let snapshot = store.snapshot().context("snapshot store")?;
        let tmp = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(&snapshot)?;
        fs::write(&tmp, json).with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("replace {}", self.path.display()))?;
        Ok(())
    }

    fn lock(&self) -> Result<StateGuard<'_>> {
        let started = Instant::now();
        let ttl = state_lock_ttl();
        loop {
            if self.locks.try_acquire(STATE_LOCK, Utc::now(), ttl)? {
                return Ok(StateGuard { locks: &self.locks });
            }
            if started.elapsed() >= self.wait {
                bail!(
                    "state file {} is busy; another studyflow process holds it",
                    self.path.display()
                );
            }
            std::thread::sleep(POLL);
        }
    }

    /// Reload `store` from disk, run `f` and save `store`, all under the
    /// state lock. The store is saved even when `f` fails, since a batch job
    /// can fail after some users were already written.
    pub fn transaction<T>(&self, store: &InMemoryStore, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let _guard = self.lock()?;
        store.restore(self.read()?).context("load state")?;
        let result = f();
        self.write(store)?;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::Arc;

    use chrono::{NaiveDate, NaiveTime, TimeZone};
    use studyflow_core::{
        Clock, FixedClock, JobRun, Orchestrator, PlannerConfig, PlannerStore, SessionAction,
        SessionStatus, StudySession, SubjectForUser, User,
    };

    use crate::Engine;
    use crate::notifier::OutboxDispatcher;

    fn state_in(dir: &Path) -> StateFile {
        StateFile::new(dir.join("state.json"), FileJobLock::new(dir.join("locks")))
    }

    fn engine_at(dir: &Path, state: &StateFile, now: chrono::DateTime<Utc>) -> Engine {
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(now));
        Orchestrator::new(
            InMemoryStore::from_snapshot(state.read().unwrap()),
            OutboxDispatcher::new(dir.join("outbox.jsonl")),
            FileJobLock::new(dir.join("locks")),
            clock,
            PlannerConfig {
                timezone: "UTC".into(),
                ..PlannerConfig::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn long_lived_engine_does_not_overwrite_a_newer_change() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());

        let seed = InMemoryStore::new();
        let id = state
            .transaction(&seed, || {
                seed.add_user(User::new(1, "amina"))?;
                seed.upsert_subject(SubjectForUser::new(10, 1, "Math"))?;
                let date = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
                let start = NaiveTime::from_hms_opt(17, 0, 0).unwrap();
                Ok(seed.insert_session(StudySession::new(0, 1, 10, date, start, 60))?)
            })
            .unwrap();

        // The daemon loaded the file before the user acted.
        let evening = Utc.with_ymd_and_hms(2026, 3, 2, 20, 0, 0).unwrap();
        let daemon = engine_at(dir.path(), &state, evening);

        let cli = engine_at(dir.path(), &state, evening);
        state
            .transaction(cli.store(), || {
                Ok(cli.transition_session(id, SessionAction::Skip, None)?)
            })
            .unwrap();

        let run = state
            .transaction(daemon.store(), || {
                Ok(daemon.run(studyflow_core::JobKind::CheckMissedSessions)?)
            })
            .unwrap();
        let JobRun::Completed(report) = run else {
            panic!("job unexpectedly locked");
        };
        assert_eq!(report.affected, 0);

        let saved = state.read().unwrap();
        assert_eq!(saved.sessions[&id].status, SessionStatus::Skipped);
        assert_eq!(daemon.store().session(id).unwrap().status, SessionStatus::Skipped);
    }

    #[test]
    fn busy_state_times_out_and_frees_after_release() {
        let dir = tempfile::tempdir().unwrap();
        let locks = FileJobLock::new(dir.path().join("locks"));
        assert!(locks.try_acquire(STATE_LOCK, Utc::now(), Duration::minutes(5)).unwrap());

        let state = StateFile::new(dir.path().join("state.json"), locks.clone())
            .with_wait(std::time::Duration::from_millis(250));
        let store = InMemoryStore::new();
        let err = state.transaction(&store, || Ok(())).unwrap_err();
        assert!(err.to_string().contains("busy"));

        locks.release(STATE_LOCK).unwrap();
        let failed: Result<()> = state.transaction(&store, || {
            store.add_user(User::new(1, "amina"))?;
            bail!("job failed midway")
        });
        assert!(failed.is_err());
        // The lock was released and the partial write kept.
        state.transaction(&store, || Ok(())).unwrap();
        assert_eq!(state.read().unwrap().users.len(), 1);
    }
}
