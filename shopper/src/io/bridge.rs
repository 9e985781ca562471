//! Browser drivers backed by an external bridge process.
//!
//! The bridge speaks JSON lines over stdio: one request object per line
//! (`{"op":"navigate","url":"https://..."}`) answered by one response line
//! (`{"ok":true,"value":...}` or `{"ok":false,"error":"..."}`). The bridge owns
//! the actual browser automation library.
//!
//! [`BridgeDriver`] is the blocking variant, bounding every request with its
//! own timeout. [`AsyncBridgeDriver`] is the tokio variant, meant to be wrapped
//! in [`AsyncAdapter`](crate::io::driver::AsyncAdapter).

use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::types::{Control, LinkRecord};
use crate::io::driver::{AsyncBrowserDriver, BrowserDriver, ClickMode};

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum BridgeRequest<'a> {
    Initialize,
    Navigate { url: &'a str },
    Close,
    Screenshot { path: &'a Path },
    CurrentUrl,
    BodyText,
    Buttons,
    Links,
    TextFields,
    Click { control: &'a Control, mode: ClickMode },
    TypeText { control: &'a Control, text: &'a str },
}

impl BridgeRequest<'_> {
    fn op(&self) -> &'static str {
        match self {
            BridgeRequest::Initialize => "initialize",
            BridgeRequest::Navigate { .. } => "navigate",
            BridgeRequest::Close => "close",
            BridgeRequest::Screenshot { .. } => "screenshot",
            BridgeRequest::CurrentUrl => "current_url",
            BridgeRequest::BodyText => "body_text",
            BridgeRequest::Buttons => "buttons",
            BridgeRequest::Links => "links",
            BridgeRequest::TextFields => "text_fields",
            BridgeRequest::Click { .. } => "click",
            BridgeRequest::TypeText { .. } => "type_text",
        }
    }

    fn encode(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)
            .with_context(|| format!("encode bridge request {}", self.op()))?;
        line.push('\n');
        Ok(line)
    }
}

#[derive(Debug, Deserialize)]
struct BridgeResponse {
    ok: bool,
    #[serde(default)]
    value: serde_json::Value,
    #[serde(default)]
    error: Option<String>,
}

fn decode<T: DeserializeOwned>(op: &str, line: &str) -> Result<T> {
    let response: BridgeResponse = serde_json::from_str(line)
        .with_context(|| format!("parse bridge response to {op}: {line:?}"))?;
    if !response.ok {
        bail!(
            "bridge {op} failed: {}",
            response.error.as_deref().unwrap_or("unknown error")
        );
    }
    serde_json::from_value(response.value).with_context(|| format!("decode bridge {op} value"))
}

fn bridge_command(command: &[String]) -> Result<Command> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| anyhow!("bridge command is empty"))?;
    let mut cmd = Command::new(program);
    cmd.args(args);
    Ok(cmd)
}

struct BridgeSession {
    child: Child,
    stdin: ChildStdin,
    lines: Receiver<std::io::Result<String>>,
}

/// Blocking driver talking to a bridge process.
///
/// The process is spawned on the first `initialize` and shut down by `close`;
/// a later `initialize` spawns a fresh one.
pub struct BridgeDriver {
    command: Vec<String>,
    timeout: Duration,
    session: Option<BridgeSession>,
}

impl BridgeDriver {
    pub fn new(command: Vec<String>, timeout: Duration) -> Self {
        Self {
            command,
            timeout,
            session: None,
        }
    }

    #[instrument(skip_all, fields(command = ?self.command))]
    fn spawn(&mut self) -> Result<()> {
        let mut cmd = bridge_command(&self.command)?;
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        let mut child = cmd.spawn().context("spawn bridge process")?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout was not piped"))?;

        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
        debug!(pid = child.id(), "bridge process started");
        self.session = Some(BridgeSession {
            child,
            stdin,
            lines: rx,
        });
        Ok(())
    }

    fn call<T: DeserializeOwned>(&mut self, request: BridgeRequest<'_>) -> Result<T> {
        let op = request.op();
        let line = request.encode()?;
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| anyhow!("bridge {op} called before initialize"))?;
        session
            .stdin
            .write_all(line.as_bytes())
            .and_then(|()| session.stdin.flush())
            .with_context(|| format!("send bridge {op}"))?;
        match session.lines.recv_timeout(self.timeout) {
            Ok(Ok(reply)) => decode(op, &reply),
            Ok(Err(e)) => Err(e).with_context(|| format!("read bridge {op} response")),
            Err(RecvTimeoutError::Timeout) => {
                warn!(op, timeout_secs = self.timeout.as_secs(), "bridge call timed out");
                self.abandon_session();
                Err(anyhow!("bridge {op} timed out after {:?}", self.timeout))
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(anyhow!("bridge process exited during {op}"))
            }
        }
    }

    /// Kill the bridge so a late reply can never answer a later request.
    /// The next `initialize` starts a fresh process.
    fn abandon_session(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        if let Err(e) = session.child.kill() {
            debug!(err = %e, "bridge process already gone");
        }
        if let Err(e) = session.child.wait() {
            debug!(err = %e, "reaping abandoned bridge failed");
        }
    }
}

impl BrowserDriver for BridgeDriver {
    fn initialize(&mut self) -> Result<()> {
        if self.session.is_none() {
            self.spawn()?;
        }
        self.call(BridgeRequest::Initialize)
    }

    fn navigate(&mut self, url: &str) -> Result<()> {
        self.call(BridgeRequest::Navigate { url })
    }

    fn close(&mut self) -> Result<()> {
        if self.session.is_none() {
            return Ok(());
        }
        let sent: Result<()> = self.call(BridgeRequest::Close);
        let Some(mut session) = self.session.take() else {
            return sent;
        };
        drop(session.stdin);
        match session
            .child
            .wait_timeout(self.timeout)
            .context("wait for bridge exit")?
        {
            Some(status) => debug!(exit_code = ?status.code(), "bridge process exited"),
            None => {
                warn!("bridge process did not exit, killing");
                session.child.kill().context("kill bridge process")?;
                session.child.wait().context("wait bridge after kill")?;
            }
        }
        sent
    }

    fn screenshot(&mut self, path: &Path) -> Result<()> {
        self.call(BridgeRequest::Screenshot { path })
    }

    fn current_url(&mut self) -> Result<String> {
        self.call(BridgeRequest::CurrentUrl)
    }

    fn body_text(&mut self) -> Result<String> {
        self.call(BridgeRequest::BodyText)
    }

    fn buttons(&mut self) -> Result<Vec<Control>> {
        self.call(BridgeRequest::Buttons)
    }

    fn links(&mut self) -> Result<Vec<LinkRecord>> {
        self.call(BridgeRequest::Links)
    }

    fn text_fields(&mut self) -> Result<Vec<Control>> {
        self.call(BridgeRequest::TextFields)
    }

    fn click(&mut self, control: &Control, mode: ClickMode) -> Result<()> {
        self.call(BridgeRequest::Click { control, mode })
    }

    fn type_text(&mut self, control: &Control, text: &str) -> Result<()> {
        self.call(BridgeRequest::TypeText { control, text })
    }
}

impl Drop for BridgeDriver {
    fn drop(&mut self) {
        if let Some(mut session) = self.session.take()
            && let Err(e) = session.child.kill()
        {
            debug!(err = %e, "bridge process already gone");
        }
    }
}

struct AsyncBridgeSession {
    child: tokio::process::Child,
    stdin: tokio::process::ChildStdin,
    lines: tokio::io::Lines<tokio::io::BufReader<tokio::process::ChildStdout>>,
    /// Op whose reply has not been read yet. Still set when a call was
    /// cancelled mid-flight.
    in_flight: Option<&'static str>,
}

/// Suspension-based driver talking to a bridge process.
///
/// Calls are unbounded here; wrap in `AsyncAdapter` to bound them.
pub struct AsyncBridgeDriver {
    command: Vec<String>,
    session: Option<AsyncBridgeSession>,
}

impl AsyncBridgeDriver {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            session: None,
        }
    }

    fn spawn(&mut self) -> Result<()> {
        let std_cmd = bridge_command(&self.command)?;
        let mut cmd = tokio::process::Command::from(std_cmd);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        let mut child = cmd.spawn().context("spawn bridge process")?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout was not piped"))?;
        debug!(pid = ?child.id(), "async bridge process started");
        self.session = Some(AsyncBridgeSession {
            child,
            stdin,
            lines: tokio::io::BufReader::new(stdout).lines(),
            in_flight: None,
        });
        Ok(())
    }

    async fn call<T: DeserializeOwned>(&mut self, request: BridgeRequest<'_>) -> Result<T> {
        let op = request.op();
        let line = request.encode()?;
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| anyhow!("bridge {op} called before initialize"))?;
        if let Some(cancelled) = session.in_flight {
            // its reply may still arrive, so this process can no longer be trusted
            warn!(op, cancelled, "bridge call was cancelled, dropping bridge process");
            if let Some(mut stale) = self.session.take()
                && let Err(e) = stale.child.start_kill()
            {
                debug!(err = %e, "bridge process already gone");
            }
            bail!("bridge {op} refused: session dropped after {cancelled} was cancelled");
        }
        session.in_flight = Some(op);
        session
            .stdin
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("send bridge {op}"))?;
        session
            .stdin
            .flush()
            .await
            .with_context(|| format!("send bridge {op}"))?;
        let reply = session
            .lines
            .next_line()
            .await
            .with_context(|| format!("read bridge {op} response"))?
            .ok_or_else(|| anyhow!("bridge process exited during {op}"))?;
        session.in_flight = None;
        decode(op, &reply)
    }
}

#[async_trait]
impl AsyncBrowserDriver for AsyncBridgeDriver {
    async fn initialize(&mut self) -> Result<()> {
        if self.session.is_none() {
            self.spawn()?;
        }
        self.call(BridgeRequest::Initialize).await
    }

    async fn navigate(&mut self, url: &str) -> Result<()> {
        self.call(BridgeRequest::Navigate { url }).await
    }

    async fn close(&mut self) -> Result<()> {
        if self.session.is_none() {
            return Ok(());
        }
        let sent: Result<()> = self.call(BridgeRequest::Close).await;
        if let Some(mut session) = self.session.take() {
            drop(session.stdin);
            let status = session.child.wait().await.context("wait for bridge exit")?;
            debug!(exit_code = ?status.code(), "async bridge process exited");
        }
        sent
    }

    async fn screenshot(&mut self, path: &Path) -> Result<()> {
        self.call(BridgeRequest::Screenshot { path }).await
    }

    async fn current_url(&mut self) -> Result<String> {
        self.call(BridgeRequest::CurrentUrl).await
    }

    async fn body_text(&mut self) -> Result<String> {
        self.call(BridgeRequest::BodyText).await
    }

    async fn buttons(&mut self) -> Result<Vec<Control>> {
        self.call(BridgeRequest::Buttons).await
    }

    async fn links(&mut self) -> Result<Vec<LinkRecord>> {
        self.call(BridgeRequest::Links).await
    }

    async fn text_fields(&mut self) -> Result<Vec<Control>> {
        self.call(BridgeRequest::TextFields).await
    }

    async fn click(&mut self, control: &Control, mode: ClickMode) -> Result<()> {
        self.call(BridgeRequest::Click { control, mode }).await
    }

    async fn type_text(&mut self, control: &Control, text: &str) -> Result<()> {
        self.call(BridgeRequest::TypeText { control, text }).await
    }
}
