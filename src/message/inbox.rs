//! Append-only JSONL logs of received and delivered envelopes

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::envelope::Envelope;
use crate::error::PersistenceError;

/// One envelope per line, appended as it arrives
#[derive(Debug, Clone)]
pub struct MessageLog {
    path: PathBuf,
}

impl MessageLog {
    /// Log backed by `path` (created on first append)
    pub fn new(path: impl Into<PathBuf>) -> Self {
        MessageLog { path: path.into() }
    }

    /// Backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one envelope
    pub async fn append(&self, envelope: &Envelope) -> Result<(), PersistenceError> {
        let mut line = envelope
            .to_json()
            .map_err(|e| PersistenceError::json(&self.path, e))?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| PersistenceError::io(&self.path, e))?;
        file.write_all(&line)
            .await
            .map_err(|e| PersistenceError::io(&self.path, e))?;
        file.flush()
            .await
            .map_err(|e| PersistenceError::io(&self.path, e))
    }

    /// Every readable envelope, oldest first. Corrupt lines are skipped.
    pub async fn read_all(&self) -> Result<Vec<Envelope>, PersistenceError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(PersistenceError::io(&self.path, e)),
        };

        let mut envelopes = Vec::new();
        for (lineno, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match Envelope::from_json(line.as_bytes()) {
                Ok(envelope) => envelopes.push(envelope),
                Err(e) => debug!(path = %self.path.display(), line = lineno + 1, error = %e, "skipping corrupt log line"),
            }
        }
        Ok(envelopes)
    }
}

/// Selection applied when listing a log
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    /// Only envelopes from this address
    pub from: Option<String>,
    /// Only envelopes in this thread
    pub thread: Option<String>,
    /// Keep only the most recent N
    pub last: Option<usize>,
}

impl LogFilter {
    /// Apply the filter, preserving order
    pub fn apply(&self, envelopes: Vec<Envelope>) -> Vec<Envelope> {
        let mut selected: Vec<Envelope> = envelopes
            .into_iter()
            .filter(|e| self.from.as_deref().map_or(true, |from| e.from == from))
            .filter(|e| {
                self.thread
                    .as_deref()
                    .map_or(true, |thread| e.thread_id.as_deref() == Some(thread))
            })
            .collect();
        if let Some(last) = self.last {
            let skip = selected.len().saturating_sub(last);
            selected.drain(..skip);
        }
        selected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::kind;

    #[tokio::test]
    async fn test_append_and_read() {
        let tmp = tempfile::tempdir().unwrap();
        let log = MessageLog::new(tmp.path().join("inbox.jsonl"));

        assert!(log.read_all().await.unwrap().is_empty());

        let first = Envelope::new("a", "me", kind::MESSAGE, "one");
        let second = Envelope::new("b", "me", kind::MESSAGE, "two");
        log.append(&first).await.unwrap();
        log.append(&second).await.unwrap();

        assert_eq!(log.read_all().await.unwrap(), vec![first, second]);
    }

    #[tokio::test]
    async fn test_corrupt_lines_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let log = MessageLog::new(tmp.path().join("inbox.jsonl"));

        let good = Envelope::new("a", "me", kind::MESSAGE, "kept");
        log.append(&good).await.unwrap();
        tokio::fs::write(
            log.path(),
            format!(
                "{{\"truncated\n{}\n\n",
                String::from_utf8(good.to_json().unwrap()).unwrap()
            ),
        )
        .await
        .unwrap();

        assert_eq!(log.read_all().await.unwrap(), vec![good]);
    }

    #[test]
    fn test_filter() {
        let envelopes: Vec<Envelope> = (0..5)
            .map(|i| {
                let from = if i % 2 == 0 { "even" } else { "odd" };
                Envelope::new(from, "me", kind::MESSAGE, i.to_string()).with_thread("t")
            })
            .collect();

        let from_even = LogFilter {
            from: Some("even".into()),
            ..Default::default()
        }
        .apply(envelopes.clone());
        assert_eq!(from_even.len(), 3);

        let last_two = LogFilter {
            last: Some(2),
            ..Default::default()
        }
        .apply(envelopes.clone());
        assert_eq!(
            last_two.iter().map(|e| e.body.as_str()).collect::<Vec<_>>(),
            vec!["3", "4"]
        );

        let other_thread = LogFilter {
            thread: Some("nope".into()),
            ..Default::default()
        }
        .apply(envelopes);
        assert!(other_thread.is_empty());
    }
}
