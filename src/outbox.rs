//! Durable retry queue for envelopes that could not be delivered
//!
//! Entries live in a JSONL file, one [`OutboxEntry`] per line. Every change
//! rewrites the whole file through a temporary file and a rename, so a
//! reader never sees a half-written queue. Deliveries run without holding
//! the file lock; entries enqueued meanwhile are merged back in.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::atomic::write_atomic;
use crate::error::PersistenceError;
use crate::message::Envelope;

/// Failed attempts after which an entry is dropped
pub const MAX_RETRIES: u32 = 100;

/// Retry delays in seconds, indexed by failed attempts so far (last one repeats)
pub const BACKOFF_SECS: [i64; 5] = [30, 60, 120, 300, 600];

/// Delay before the first retry of a newly queued envelope
pub const INITIAL_RETRY_SECS: i64 = BACKOFF_SECS[0];

/// Delay before the next attempt, given the failures so far
pub fn backoff(attempts: u32) -> Duration {
    let index = (attempts as usize).min(BACKOFF_SECS.len() - 1);
    Duration::from_secs(BACKOFF_SECS[index] as u64)
}

/// An envelope waiting for delivery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// The signed envelope, sent as-is on every attempt
    pub envelope: Envelope,
    /// Failed delivery attempts so far
    pub attempts: u32,
    /// Unix time of the next attempt
    pub next_retry: i64,
}

impl OutboxEntry {
    /// Fresh entry, first retry after [`INITIAL_RETRY_SECS`]
    pub fn new(envelope: Envelope, now: i64) -> Self {
        OutboxEntry {
            envelope,
            attempts: 0,
            next_retry: now + INITIAL_RETRY_SECS,
        }
    }

    /// Whether the entry should be attempted at `now`
    pub fn is_due(&self, now: i64) -> bool {
        self.next_retry <= now
    }

    /// Whether the entry has used up its attempts
    pub fn is_exhausted(&self) -> bool {
        self.attempts >= MAX_RETRIES
    }

    /// Schedule the next attempt after a failure at `now`
    pub fn record_failure(&mut self, now: i64) {
        self.next_retry = now + backoff(self.attempts).as_secs() as i64;
        self.attempts += 1;
    }
}

/// Something that can push one envelope to its addressee
#[async_trait]
pub trait Deliver: Send + Sync {
    /// `Ok` once the envelope is on the wire, acked or not
    async fn deliver(&self, envelope: &Envelope) -> crate::Result<()>;
}

/// What one sweep did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Entries handed to their addressee and removed
    pub delivered: usize,
    /// Entries removed after [`MAX_RETRIES`] failures
    pub dropped: usize,
    /// Entries still queued
    pub retained: usize,
}

/// The outbox file and its in-process lock
#[derive(Debug)]
pub struct Outbox {
    path: PathBuf,
    lock: Mutex<()>,
}

impl Outbox {
    /// Outbox backed by `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Outbox {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every readable entry, in file order
    pub async fn entries(&self) -> Result<Vec<OutboxEntry>, PersistenceError> {
        let _guard = self.lock.lock().await;
        self.read().await
    }

    /// Queue `envelope` for its first retry
    pub async fn enqueue(&self, envelope: Envelope, now: i64) -> Result<OutboxEntry, PersistenceError> {
        let _guard = self.lock.lock().await;
        let mut entries = self.read().await?;
        let entry = OutboxEntry::new(envelope, now);
        entries.push(entry.clone());
        self.write(&entries).await?;
        debug!(id = %entry.envelope.id, to = %entry.envelope.to, "queued in outbox");
        Ok(entry)
    }

    /// Remove every entry. Returns how many there were.
    pub async fn clear(&self) -> Result<usize, PersistenceError> {
        let _guard = self.lock.lock().await;
        let count = self.read().await?.len();
        self.write(&[]).await?;
        Ok(count)
    }

    /// Attempt every due entry once
    pub async fn process<D>(&self, deliverer: &D, now: i64) -> Result<SweepReport, PersistenceError>
    where
        D: Deliver + ?Sized,
    {
        let snapshot = {
            let _guard = self.lock.lock().await;
            self.read().await?
        };
        if snapshot.is_empty() {
            return Ok(SweepReport::default());
        }

        let mut report = SweepReport::default();
        // id -> replacement (None = remove)
        let mut outcomes: HashMap<String, Option<OutboxEntry>> = HashMap::new();
        for mut entry in snapshot {
            if !entry.is_due(now) {
                continue;
            }
            let id = entry.envelope.id.clone();
            if entry.is_exhausted() {
                warn!(%id, attempts = entry.attempts, "giving up on envelope");
                report.dropped += 1;
                outcomes.insert(id, None);
                continue;
            }
            match deliverer.deliver(&entry.envelope).await {
                Ok(()) => {
                    info!(%id, to = %entry.envelope.to, "delivered queued envelope");
                    report.delivered += 1;
                    outcomes.insert(id, None);
                }
                Err(e) => {
                    entry.record_failure(now);
                    debug!(%id, attempts = entry.attempts, next_retry = entry.next_retry, error = %e, "outbox delivery failed");
                    outcomes.insert(id, Some(entry));
                }
            }
        }

        let _guard = self.lock.lock().await;
        let current = self.read().await?;
        let remaining: Vec<OutboxEntry> = current
            .into_iter()
            .filter_map(|entry| match outcomes.remove(&entry.envelope.id) {
                Some(outcome) => outcome,
                None => Some(entry),
            })
            .collect();
        report.retained = remaining.len();
        self.write(&remaining).await?;

        if report.delivered > 0 || report.dropped > 0 {
            info!(
                delivered = report.delivered,
                dropped = report.dropped,
                retained = report.retained,
                "outbox sweep"
            );
        }
        Ok(report)
    }

    async fn read(&self) -> Result<Vec<OutboxEntry>, PersistenceError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(PersistenceError::io(&self.path, e)),
        };

        Ok(contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    debug!(path = %self.path.display(), error = %e, "skipping corrupt outbox line");
                    None
                }
            })
            .collect())
    }

    async fn write(&self, entries: &[OutboxEntry]) -> Result<(), PersistenceError> {
        if entries.is_empty() {
            return match tokio::fs::remove_file(&self.path).await {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                    Err(PersistenceError::io(&self.path, e))
                }
                _ => Ok(()),
            };
        }

        let mut contents = Vec::new();
        for entry in entries {
            let line =
                serde_json::to_vec(entry).map_err(|e| PersistenceError::json(&self.path, e))?;
            contents.extend_from_slice(&line);
            contents.push(b'\n');
        }

        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, &contents))
            .await
            .map_err(|e| PersistenceError::io(&self.path, std::io::Error::other(e)))??;
        Ok(())
    }
}

/// Sweep the outbox every `interval` until `token` fires
pub async fn run_retry_loop(
    outbox: Arc<Outbox>,
    deliverer: Arc<dyn Deliver>,
    interval: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let now = chrono::Utc::now().timestamp();
                if let Err(e) = outbox.process(deliverer.as_ref(), now).await {
                    warn!(error = %e, "outbox sweep failed");
                }
            }
        }
    }
    debug!("outbox retry loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::kind;
    use crate::transport::TransportError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails every delivery, counting attempts
    #[derive(Default)]
    struct AlwaysFail {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Deliver for AlwaysFail {
        async fn deliver(&self, _envelope: &Envelope) -> crate::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::ConnectionFailed("unreachable".into()).into())
        }
    }

    struct AlwaysSucceed;

    #[async_trait]
    impl Deliver for AlwaysSucceed {
        async fn deliver(&self, _envelope: &Envelope) -> crate::Result<()> {
            Ok(())
        }
    }

    fn envelope(body: &str) -> Envelope {
        Envelope::new("me", "you", kind::MESSAGE, body)
    }

    fn outbox() -> (tempfile::TempDir, Outbox) {
        let tmp = tempfile::tempdir().unwrap();
        let outbox = Outbox::new(tmp.path().join("outbox.jsonl"));
        (tmp, outbox)
    }

    #[test]
    fn test_backoff_is_monotonic_and_capped() {
        let mut previous = Duration::ZERO;
        for attempts in 0..1000 {
            let delay = backoff(attempts);
            assert!(delay >= previous);
            assert!(delay <= Duration::from_secs(600));
            previous = delay;
        }
        assert_eq!(backoff(0), Duration::from_secs(30));
        assert_eq!(backoff(4), Duration::from_secs(600));
        assert_eq!(backoff(u32::MAX), Duration::from_secs(600));
    }

    #[tokio::test]
    async fn test_enqueue_and_restart() {
        let (_tmp, outbox) = outbox();
        let entry = outbox.enqueue(envelope("hello"), 1_000).await.unwrap();
        assert_eq!(entry.attempts, 0);
        assert_eq!(entry.next_retry, 1_030);

        // a new instance over the same file sees the identical entry
        let reopened = Outbox::new(outbox.path());
        assert_eq!(reopened.entries().await.unwrap(), vec![entry]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_handles_leave_whole_file() {
        let (tmp, first) = outbox();
        let second = Outbox::new(first.path());

        let a = async {
            for i in 0..20 {
                first.enqueue(envelope(&format!("a{i}")), 1_000).await.unwrap();
            }
        };
        let b = async {
            for i in 0..20 {
                second.enqueue(envelope(&format!("b{i}")), 1_000).await.unwrap();
            }
        };
        tokio::join!(a, b);

        let raw = std::fs::read_to_string(first.path()).unwrap();
        assert!(!raw.is_empty());
        for line in raw.lines() {
            assert!(serde_json::from_str::<OutboxEntry>(line).is_ok());
        }
        let names: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("outbox.jsonl")]);
    }

    #[tokio::test]
    async fn test_five_failures_follow_backoff_table() {
        let (_tmp, outbox) = outbox();
        let failing = AlwaysFail::default();
        outbox.enqueue(envelope("x"), 0).await.unwrap();

        let mut now = 30;
        let mut deltas = Vec::new();
        for _ in 0..5 {
            outbox.process(&failing, now).await.unwrap();
            let entry = outbox.entries().await.unwrap().remove(0);
            deltas.push(entry.next_retry - now);
            now = entry.next_retry;
        }

        assert_eq!(deltas, vec![30, 60, 120, 300, 600]);
        assert_eq!(outbox.entries().await.unwrap()[0].attempts, 5);
        assert_eq!(failing.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_not_due_entries_are_untouched() {
        let (_tmp, outbox) = outbox();
        let failing = AlwaysFail::default();
        let entry = outbox.enqueue(envelope("later"), 100).await.unwrap();

        let report = outbox.process(&failing, 129).await.unwrap();
        assert_eq!(report, SweepReport { delivered: 0, dropped: 0, retained: 1 });
        assert_eq!(failing.calls.load(Ordering::SeqCst), 0);
        assert_eq!(outbox.entries().await.unwrap(), vec![entry]);
    }

    #[tokio::test]
    async fn test_exhausted_entry_is_dropped_without_attempt() {
        let (_tmp, outbox) = outbox();
        let failing = AlwaysFail::default();
        outbox.enqueue(envelope("doomed"), 0).await.unwrap();

        let mut now = 0;
        for _ in 0..MAX_RETRIES {
            now += 600;
            outbox.process(&failing, now).await.unwrap();
        }
        assert_eq!(outbox.entries().await.unwrap()[0].attempts, MAX_RETRIES);
        assert_eq!(failing.calls.load(Ordering::SeqCst), MAX_RETRIES as usize);

        let report = outbox.process(&failing, now + 600).await.unwrap();
        assert_eq!(report.dropped, 1);
        assert_eq!(failing.calls.load(Ordering::SeqCst), MAX_RETRIES as usize);
        assert!(outbox.entries().await.unwrap().is_empty());
        assert!(!outbox.path().exists());
    }

    #[tokio::test]
    async fn test_delivered_entries_are_removed() {
        let (_tmp, outbox) = outbox();
        outbox.enqueue(envelope("a"), 0).await.unwrap();
        let later = outbox.enqueue(envelope("b"), 1_000).await.unwrap();

        let report = outbox.process(&AlwaysSucceed, 30).await.unwrap();
        assert_eq!(report, SweepReport { delivered: 1, dropped: 0, retained: 1 });
        assert_eq!(outbox.entries().await.unwrap(), vec![later]);

        outbox.process(&AlwaysSucceed, 2_000).await.unwrap();
        assert!(!outbox.path().exists());
    }

    #[tokio::test]
    async fn test_corrupt_lines_are_skipped() {
        let (_tmp, outbox) = outbox();
        let entry = OutboxEntry::new(envelope("kept"), 0);
        let contents = format!(
            "not json\n{}\n{{\"envelope\":\n",
            serde_json::to_string(&entry).unwrap()
        );
        tokio::fs::write(outbox.path(), contents).await.unwrap();

        assert_eq!(outbox.entries().await.unwrap(), vec![entry]);
    }

    #[tokio::test]
    async fn test_clear() {
        let (_tmp, outbox) = outbox();
        outbox.enqueue(envelope("a"), 0).await.unwrap();
        outbox.enqueue(envelope("b"), 0).await.unwrap();

        assert_eq!(outbox.clear().await.unwrap(), 2);
        assert!(outbox.entries().await.unwrap().is_empty());
        assert_eq!(outbox.clear().await.unwrap(), 0);
    }

    /// Enqueues another envelope from inside a delivery attempt
    struct EnqueueDuring {
        outbox: Arc<Outbox>,
    }

    #[async_trait]
    impl Deliver for EnqueueDuring {
        async fn deliver(&self, _envelope: &Envelope) -> crate::Result<()> {
            self.outbox.enqueue(envelope("late"), 10_000).await?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_entries_enqueued_during_sweep_survive() {
        let tmp = tempfile::tempdir().unwrap();
        let outbox = Arc::new(Outbox::new(tmp.path().join("outbox.jsonl")));
        outbox.enqueue(envelope("first"), 0).await.unwrap();

        let deliverer = EnqueueDuring {
            outbox: outbox.clone(),
        };
        let report = outbox.process(&deliverer, 30).await.unwrap();
        assert_eq!(report.delivered, 1);

        let remaining = outbox.entries().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].envelope.body, "late");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_loop_stops_on_cancel() {
        let (_tmp, outbox) = outbox();
        let token = CancellationToken::new();
        let handle = tokio::spawn(run_retry_loop(
            Arc::new(outbox),
            Arc::new(AlwaysSucceed),
            Duration::from_secs(30),
            token.clone(),
        ));

        tokio::time::sleep(Duration::from_secs(95)).await;
        token.cancel();
        handle.await.unwrap();
    }
}
