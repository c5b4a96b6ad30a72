//! Minimal Tor control-port client
//!
//! Speaks just enough of the line-based control protocol to authenticate,
//! publish an onion service from our own key, probe the daemon and remove
//! the service again.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::transport::{TransportError, TransportResult};

/// Deadline for any single control command
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// A complete control-port reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Three-digit status of the final line
    pub status: u16,
    /// Text of every line, status prefix removed. Data blocks (`250+`) are
    /// folded into their line, newline-separated.
    pub lines: Vec<String>,
}

impl Reply {
    fn is_ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Value of the first `key=value` line with this key
    pub fn value(&self, key: &str) -> Option<&str> {
        self.lines.iter().find_map(|line| {
            line.strip_prefix(key)
                .and_then(|rest| rest.strip_prefix('='))
        })
    }
}

/// An authenticated control connection
pub struct ControlClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl ControlClient {
    /// Connect to `addr` and authenticate
    ///
    /// Tries, in order: password (when given and offered), no auth, cookie.
    pub async fn connect(addr: SocketAddr, password: Option<&str>) -> TransportResult<Self> {
        let stream = tokio::time::timeout(COMMAND_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout(COMMAND_TIMEOUT))?
            .map_err(|e| TransportError::Control(format!("connect to {addr}: {e}")))?;
        let (reader, writer) = stream.into_split();
        let mut client = ControlClient {
            reader: BufReader::new(reader),
            writer,
        };
        client.authenticate(password).await?;
        info!(%addr, "authenticated with tor control port");
        Ok(client)
    }

    async fn authenticate(&mut self, password: Option<&str>) -> TransportResult<()> {
        let info = self.command("PROTOCOLINFO 1").await?;
        let auth_line = info
            .lines
            .iter()
            .find(|line| line.starts_with("AUTH "))
            .cloned()
            .unwrap_or_default();
        let methods = parse_auth_methods(&auth_line);
        debug!(?methods, "tor control auth methods");

        let offers = |m: &str| methods.iter().any(|offered| offered == m);
        let command = match password {
            Some(password) if offers("HASHEDPASSWORD") => {
                format!("AUTHENTICATE {}", quote(password))
            }
            _ if offers("NULL") => "AUTHENTICATE".to_string(),
            _ if offers("COOKIE") => {
                let path = parse_cookie_file(&auth_line).ok_or_else(|| {
                    TransportError::Control("cookie auth offered without COOKIEFILE".into())
                })?;
                let cookie = tokio::fs::read(&path)
                    .await
                    .map_err(|e| TransportError::Control(format!("read cookie {path}: {e}")))?;
                format!("AUTHENTICATE {}", hex::encode(cookie))
            }
            Some(password) => format!("AUTHENTICATE {}", quote(password)),
            None => {
                return Err(TransportError::Control(format!(
                    "no supported authentication method in {methods:?}"
                )))
            }
        };
        self.command(&command).await.map(|_| ())
    }

    /// Publish an onion service for `key_blob`, mapping each
    /// `(virtual port, local port)` pair. Returns the service id.
    pub async fn add_onion(&mut self, key_blob: &str, ports: &[(u16, u16)]) -> TransportResult<String> {
        let mut command = format!("ADD_ONION {key_blob}");
        for (virtual_port, local_port) in ports {
            command.push_str(&format!(" Port={virtual_port},127.0.0.1:{local_port}"));
        }
        let reply = self.command(&command).await?;
        reply
            .value("ServiceID")
            .map(str::to_string)
            .ok_or_else(|| TransportError::Registration("ADD_ONION reply without ServiceID".into()))
    }

    /// Remove a service published on this connection
    pub async fn del_onion(&mut self, service_id: &str) -> TransportResult<()> {
        self.command(&format!("DEL_ONION {service_id}")).await.map(|_| ())
    }

    /// Daemon version, doubling as a liveness probe
    pub async fn version(&mut self) -> TransportResult<String> {
        let reply = self.command("GETINFO version").await?;
        reply
            .value("version")
            .map(str::to_string)
            .ok_or_else(|| TransportError::Control("GETINFO reply without version".into()))
    }

    /// Send one command and read its reply. Non-2xx replies are errors.
    pub async fn command(&mut self, line: &str) -> TransportResult<Reply> {
        let verb = line.split_whitespace().next().unwrap_or_default().to_string();
        let reply = tokio::time::timeout(COMMAND_TIMEOUT, self.exchange(line))
            .await
            .map_err(|_| TransportError::Timeout(COMMAND_TIMEOUT))??;

        if reply.is_ok() {
            Ok(reply)
        } else {
            Err(TransportError::Control(format!(
                "{verb} failed: {} {}",
                reply.status,
                reply.lines.join("; ")
            )))
        }
    }

    async fn exchange(&mut self, line: &str) -> TransportResult<Reply> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        self.writer.flush().await?;
        self.read_reply().await
    }

    async fn read_reply(&mut self) -> TransportResult<Reply> {
        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await?;
            let (status, separator, text) = match (line.get(..3), line.get(3..4), line.get(4..)) {
                (Some(status), Some(separator), Some(text)) => (status, separator, text),
                _ => return Err(TransportError::Control(format!("short reply line {line:?}"))),
            };
            let status: u16 = status
                .parse()
                .map_err(|_| TransportError::Control(format!("bad status in {line:?}")))?;
            let text = text.to_string();

            match separator {
                " " => {
                    lines.push(text);
                    return Ok(Reply { status, lines });
                }
                "-" => lines.push(text),
                "+" => {
                    let mut data = text;
                    loop {
                        let next = self.read_line().await?;
                        if next == "." {
                            break;
                        }
                        data.push('\n');
                        data.push_str(next.strip_prefix('.').unwrap_or(&next));
                    }
                    lines.push(data);
                }
                other => {
                    return Err(TransportError::Control(format!(
                        "bad separator {other:?} in {line:?}"
                    )))
                }
            }
        }
    }

    async fn read_line(&mut self) -> TransportResult<String> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(TransportError::Control("control connection closed".into()));
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }
}

fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// `AUTH METHODS=COOKIE,SAFECOOKIE COOKIEFILE="..."` -> methods
fn parse_auth_methods(line: &str) -> Vec<String> {
    line.split_whitespace()
        .find_map(|field| field.strip_prefix("METHODS="))
        .map(|list| list.split(',').map(str::to_string).collect())
        .unwrap_or_default()
}

fn parse_cookie_file(line: &str) -> Option<String> {
    let start = line.find("COOKIEFILE=\"")? + "COOKIEFILE=\"".len();
    let mut path = String::new();
    let mut chars = line[start..].chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => path.push(chars.next()?),
            '"' => return Some(path),
            c => path.push(c),
        }
    }
    None
}
