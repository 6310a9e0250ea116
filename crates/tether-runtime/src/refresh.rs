use serde_json::{Map, Value};
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;

pub const DEFAULT_REFRESH_DEBOUNCE: Duration = Duration::from_millis(750);

/// Runs at most one delayed job at a time. Each trigger replaces the pending
/// job and restarts its delay.
#[derive(Debug)]
pub struct Debouncer {
    delay: Duration,
    pending: Option<JoinHandle<()>>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: None,
        }
    }

    pub fn trigger<F>(&mut self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        let delay = self.delay;
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            work.await;
        }));
    }

    pub fn is_pending(&self) -> bool {
        self.pending
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// One row of the session list used as the summary backstop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub key: String,
    pub updated_at_ms: Option<i64>,
    pub running: Option<bool>,
}

/// Accepts `{sessions: [...]}` or a bare array; rows without a key are skipped.
pub fn parse_session_summaries(payload: &Value) -> Vec<SessionSummary> {
    let rows = match payload {
        Value::Array(rows) => rows.as_slice(),
        Value::Object(object) => match object.get("sessions") {
            Some(Value::Array(rows)) => rows.as_slice(),
            _ => &[],
        },
        _ => &[],
    };
    rows.iter()
        .filter_map(Value::as_object)
        .filter_map(parse_row)
        .collect()
}

fn parse_row(row: &Map<String, Value>) -> Option<SessionSummary> {
    let key = ["key", "sessionKey"]
        .iter()
        .find_map(|field| row.get(*field).and_then(Value::as_str))
        .filter(|key| !key.trim().is_empty())?
        .to_string();
    let updated_at_ms = ["updatedAt", "updated_at"]
        .iter()
        .find_map(|field| row.get(*field).and_then(Value::as_i64));
    Some(SessionSummary {
        key,
        updated_at_ms,
        running: running_flag(row),
    })
}

fn running_flag(row: &Map<String, Value>) -> Option<bool> {
    if let Some(running) = row.get("running").and_then(Value::as_bool) {
        return Some(running);
    }
    if let Some(status) = row.get("status").and_then(Value::as_str) {
        return Some(matches!(status, "running" | "busy" | "active"));
    }
    match row.get("activeRunId") {
        Some(Value::String(run_id)) if !run_id.is_empty() => Some(true),
        Some(Value::Null) => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn repeated_triggers_collapse_into_one_run() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut debouncer = Debouncer::new(DEFAULT_REFRESH_DEBOUNCE);
        for n in 0..3 {
            let tx = tx.clone();
            debouncer.trigger(async move {
                let _ = tx.send(n);
            });
            tokio::time::advance(Duration::from_millis(100)).await;
        }
        assert!(debouncer.is_pending());

        assert_eq!(rx.recv().await, Some(2));
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
        assert!(!debouncer.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_and_drop_stop_the_pending_job() {
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let mut debouncer = Debouncer::new(DEFAULT_REFRESH_DEBOUNCE);
        let first = tx.clone();
        debouncer.trigger(async move {
            let _ = first.send(());
        });
        debouncer.cancel();
        assert!(!debouncer.is_pending());

        let second = tx.clone();
        debouncer.trigger(async move {
            let _ = second.send(());
        });
        drop(debouncer);
        drop(tx);
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    fn summaries_parse_from_list_payloads() {
        let summaries = parse_session_summaries(&json!({"sessions": [
            {"key": "main", "updatedAt": 1700, "running": true},
            {"sessionKey": "ops", "status": "idle"},
            {"key": "cron", "activeRunId": "r4"},
            {"label": "no key"}
        ]}));
        assert_eq!(
            summaries,
            vec![
                SessionSummary { key: "main".to_string(), updated_at_ms: Some(1700), running: Some(true) },
                SessionSummary { key: "ops".to_string(), updated_at_ms: None, running: Some(false) },
                SessionSummary { key: "cron".to_string(), updated_at_ms: None, running: Some(true) },
            ]
        );
        assert_eq!(parse_session_summaries(&json!([{"key": "a"}])).len(), 1);
        assert!(parse_session_summaries(&json!(null)).is_empty());
    }
}
