use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use studyflow_core::{DispatchError, NotificationDispatcher, ReminderPayload, User};

/// One line of `outbox.jsonl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub user_name: String,
    #[serde(flatten)]
    pub payload: ReminderPayload,
}

/// Appends reminders to a JSON Lines file for an external sender to pick up.
#[derive(Debug)]
pub struct OutboxDispatcher {
    path: PathBuf,
    write: Mutex<()>,
}

impl OutboxDispatcher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write: Mutex::new(()),
        }
    }
}

impl NotificationDispatcher for OutboxDispatcher {
    fn dispatch(&self, user: &User, payload: &ReminderPayload) -> Result<String, DispatchError> {
        let record = OutboxRecord {
            user_name: user.name.clone(),
            payload: payload.clone(),
        };
        let mut line = serde_json::to_string(&record).map_err(|e| DispatchError(e.to_string()))?;
        line.push('\n');

        let _guard = self
            .write
            .lock()
            .map_err(|_| DispatchError("outbox writer poisoned".into()))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| DispatchError(format!("open {}: {e}", self.path.display())))?;
        file.write_all(line.as_bytes())
            .map_err(|e| DispatchError(format!("write {}: {e}", self.path.display())))?;

        Ok(payload.dedupe_key.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(session_id: u64) -> ReminderPayload {
        ReminderPayload {
            session_id,
            user_id: 1,
            subject_name: "Mathematics".into(),
            session_type: "Study".into(),
            start_time: "16:00".into(),
            duration_minutes: 60,
            minutes_until_start: 15,
            title: "Study session in 15 min".into(),
            body: "Mathematics - Study at 16:00 (60 min)".into(),
            dedupe_key: format!("session:{session_id}:2026-03-02"),
        }
    }

    #[test]
    fn appends_one_line_per_reminder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outbox.jsonl");
        let outbox = OutboxDispatcher::new(&path);
        let user = User::new(1, "amina");

        let handle = outbox.dispatch(&user, &payload(7)).unwrap();
        assert_eq!(handle, "session:7:2026-03-02");
        outbox.dispatch(&user, &payload(8)).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let records: Vec<OutboxRecord> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].user_name, "amina");
        assert_eq!(records[1].payload.session_id, 8);
        assert!(text.lines().next().unwrap().contains("\"dedupe_key\":\"session:7:2026-03-02\""));
    }

    #[test]
    fn unwritable_outbox_is_a_dispatch_error() {
        let dir = tempfile::tempdir().unwrap();
        let outbox = OutboxDispatcher::new(dir.path().join("missing").join("outbox.jsonl"));
        let err = outbox.dispatch(&User::new(1, "amina"), &payload(7)).unwrap_err();
        assert!(err.0.contains("open"));
    }
}
