//! Job locks shared between CLI processes: one file per job under `locks/`,
//! holding the RFC 3339 instant at which the lock expires.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use studyflow_core::{JobLock, StoreError};

#[derive(Debug, Clone)]
pub struct FileJobLock {
    dir: PathBuf,
}

impl FileJobLock {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, job: &str) -> PathBuf {
        self.dir.join(format!("{job}.lock"))
    }

    fn expiry(&self, job: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let raw = match fs::read_to_string(self.path(job)) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(job, e)),
        };
        // An unparsable expiry counts as expired.
        Ok(DateTime::parse_from_rfc3339(raw.trim())
            .ok()
            .map(|at| at.with_timezone(&Utc)))
    }

    fn create(&self, job: &str, expires: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.path(job))
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(io_error(job, e)),
        };
        file.write_all(expires.to_rfc3339().as_bytes())
            .map_err(|e| io_error(job, e))?;
        Ok(true)
    }
}

fn io_error(job: &str, e: std::io::Error) -> StoreError {
    StoreError::Unavailable(format!("lock {job}: {e}"))
}

impl JobLock for FileJobLock {
    fn try_acquire(&self, job: &str, now: DateTime<Utc>, ttl: Duration) -> Result<bool, StoreError> {
        fs::create_dir_all(&self.dir).map_err(|e| io_error(job, e))?;
        if self.create(job, now + ttl)? {
            return Ok(true);
        }
        match self.expiry(job)? {
            Some(expires) if expires > now => Ok(false),
            _ => {
                tracing::warn!(job, "taking over expired job lock");
                match fs::remove_file(self.path(job)) {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(io_error(job, e)),
                }
                self.create(job, now + ttl)
            }
        }
    }

    fn release(&self, job: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.path(job)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(job, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 16, 0, 0).unwrap()
    }

    #[test]
    fn second_holder_is_refused_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let locks = FileJobLock::new(dir.path());
        let ttl = Duration::seconds(120);

        assert!(locks.try_acquire("send-reminders", t0(), ttl).unwrap());
        assert!(!locks.try_acquire("send-reminders", t0(), ttl).unwrap());
        assert!(locks.try_acquire("adapt-schedules", t0(), ttl).unwrap());

        locks.release("send-reminders").unwrap();
        assert!(locks.try_acquire("send-reminders", t0(), ttl).unwrap());
    }

    #[test]
    fn stale_lock_expires() {
        let dir = tempfile::tempdir().unwrap();
        let locks = FileJobLock::new(dir.path());
        let ttl = Duration::seconds(300);

        assert!(locks.try_acquire("recalculate-priorities", t0(), ttl).unwrap());
        let later = t0() + Duration::seconds(299);
        assert!(!locks.try_acquire("recalculate-priorities", later, ttl).unwrap());
        let expired = t0() + Duration::seconds(300);
        assert!(locks.try_acquire("recalculate-priorities", expired, ttl).unwrap());
    }

    #[test]
    fn garbage_lock_file_is_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("check-missed-sessions.lock"), "not a date").unwrap();
        let locks = FileJobLock::new(dir.path());
        assert!(locks
            .try_acquire("check-missed-sessions", t0(), Duration::seconds(180))
            .unwrap());
    }

    #[test]
    fn releasing_twice_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        let locks = FileJobLock::new(dir.path());
        locks.release("send-reminders").unwrap();
        locks.release("send-reminders").unwrap();
    }
}
