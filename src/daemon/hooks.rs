//! User hook scripts run for inbound envelopes

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::message::{kind, Envelope};

/// Hook file name inside the hooks directory
pub const ON_RECEIVE: &str = "on-receive";

/// Upper bound on one hook run
pub const HOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Characters of the body exposed through `MURMUR_MSG_BODY`
const BODY_PREVIEW_CHARS: usize = 256;

/// Written by `murmur init` next to the real hook
pub const SAMPLE_HOOK: &str = r#"#!/bin/sh
# on-receive hook, run by murmur for each incoming message.
# Rename to "on-receive" and chmod +x to enable.
#
# Stdin: the full JSON envelope
# Environment:
#   MURMUR_MSG_ID    message id
#   MURMUR_MSG_FROM  sender address
#   MURMUR_MSG_TYPE  message type
#   MURMUR_MSG_BODY  first 256 characters of the body
#   MURMUR_MSG_TS    unix timestamp

echo "Received message $MURMUR_MSG_ID from $MURMUR_MSG_FROM"
"#;

/// Runs `hooks/on-receive` for inbound envelopes
#[derive(Debug, Clone)]
pub struct ReceiveHook {
    path: PathBuf,
}

impl ReceiveHook {
    /// Hook at `<hooks_dir>/on-receive`
    pub fn new(hooks_dir: &Path) -> Self {
        ReceiveHook {
            path: hooks_dir.join(ON_RECEIVE),
        }
    }

    /// Hook script location
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the script exists and is executable
    pub async fn is_installed(&self) -> bool {
        match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
            Err(_) => false,
        }
    }

    /// Run the hook for `envelope`. Failures are logged and otherwise ignored.
    ///
    /// Acks and pings never trigger the hook.
    pub async fn run(&self, envelope: &Envelope) {
        if envelope.kind == kind::ACK || envelope.kind == kind::PING {
            return;
        }
        if !self.is_installed().await {
            return;
        }

        match tokio::time::timeout(HOOK_TIMEOUT, self.execute(envelope)).await {
            Ok(Ok(status)) if status.success() => {
                debug!(id = %envelope.id, "on-receive hook finished");
            }
            Ok(Ok(status)) => warn!(id = %envelope.id, %status, "on-receive hook failed"),
            Ok(Err(e)) => warn!(id = %envelope.id, error = %e, "on-receive hook could not run"),
            Err(_) => warn!(id = %envelope.id, timeout = ?HOOK_TIMEOUT, "on-receive hook killed"),
        }
    }

    async fn execute(&self, envelope: &Envelope) -> std::io::Result<std::process::ExitStatus> {
        let json = envelope
            .to_json()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let mut child = Command::new(&self.path)
            .envs(hook_env(envelope))
            .stdin(Stdio::piped())
            .stdout(Stdio::from(std::io::stderr()))
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            // a hook that ignores stdin may close it early
            if let Err(e) = stdin.write_all(&json).await {
                debug!(error = %e, "hook closed stdin");
            }
        }
        child.wait().await
    }
}

/// `MURMUR_MSG_*` variables describing `envelope`
pub fn hook_env(envelope: &Envelope) -> Vec<(&'static str, String)> {
    let preview: String = envelope.body.chars().take(BODY_PREVIEW_CHARS).collect();
    vec![
        ("MURMUR_MSG_ID", sanitize(&envelope.id)),
        ("MURMUR_MSG_FROM", sanitize(&envelope.from)),
        ("MURMUR_MSG_TYPE", sanitize(&envelope.kind)),
        ("MURMUR_MSG_BODY", sanitize(&preview)),
        ("MURMUR_MSG_TS", envelope.ts.to_string()),
    ]
}

fn sanitize(value: &str) -> String {
    value.replace(['\n', '\r'], " ")
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn install(dir: &Path, script: &str) -> ReceiveHook {
        let hook = ReceiveHook::new(dir);
        tokio::fs::write(hook.path(), script).await.unwrap();
        let mut perms = tokio::fs::metadata(hook.path()).await.unwrap().permissions();
        perms.set_mode(0o755);
        tokio::fs::set_permissions(hook.path(), perms).await.unwrap();
        hook
    }

    #[test]
    fn test_env_is_sanitized_and_truncated() {
        let body = format!("line one\r\nline two {}", "x".repeat(500));
        let envelope = Envelope::new("a", "b", kind::MESSAGE, body);
        let env = hook_env(&envelope);

        let value = |key: &str| env.iter().find(|(k, _)| *k == key).map(|(_, v)| v.clone()).unwrap();
        let preview = value("MURMUR_MSG_BODY");
        assert_eq!(preview.chars().count(), 256);
        assert!(preview.starts_with("line one  line two"));
        assert_eq!(value("MURMUR_MSG_TS"), envelope.ts.to_string());
        assert_eq!(value("MURMUR_MSG_ID"), envelope.id);
    }

    #[tokio::test]
    async fn test_hook_receives_envelope() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("out");
        let script = format!(
            "#!/bin/sh\necho \"$MURMUR_MSG_TYPE $MURMUR_MSG_BODY\" > {out}\ncat >> {out}\n",
            out = out.display()
        );
        let hook = install(tmp.path(), &script).await;
        assert!(hook.is_installed().await);

        let envelope = Envelope::new("a", "b", kind::MESSAGE, "hello");
        hook.run(&envelope).await;

        let written = tokio::fs::read_to_string(&out).await.unwrap();
        let mut lines = written.lines();
        assert_eq!(lines.next(), Some("message hello"));
        let echoed = Envelope::from_json(lines.next().unwrap().as_bytes()).unwrap();
        assert_eq!(echoed, envelope);
    }

    #[tokio::test]
    async fn test_ack_and_ping_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("out");
        let hook = install(tmp.path(), &format!("#!/bin/sh\ntouch {}\n", out.display())).await;

        hook.run(&Envelope::new("a", "b", kind::PING, "")).await;
        hook.run(&Envelope::new("a", "b", kind::ACK, "id")).await;
        assert!(!out.exists());
    }

    #[tokio::test]
    async fn test_missing_or_non_executable_hook() {
        let tmp = tempfile::tempdir().unwrap();
        let hook = ReceiveHook::new(tmp.path());
        assert!(!hook.is_installed().await);
        hook.run(&Envelope::new("a", "b", kind::MESSAGE, "x")).await;

        tokio::fs::write(hook.path(), "#!/bin/sh\n").await.unwrap();
        assert!(!hook.is_installed().await);
    }
}
