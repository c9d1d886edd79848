use crate::error::{Error, Result};
use crate::util::to_file_uri;
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Grace period for a backend to exit after `shutdown`/`exit` before it is
/// force-killed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

type ReplySlot = oneshot::Sender<Result<Value>>;
type PendingMap = Arc<Mutex<HashMap<i64, ReplySlot>>>;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub language: String,
    pub command: String,
    pub args: Vec<String>,
    pub workspace_root: PathBuf,
    pub start_timeout: Duration,
    pub request_timeout: Duration,
}

/// Framed JSON-RPC connection to one backend: a writer guarded by a lock and
/// a dispatcher task that reads frames and resolves waiters by id. Stale or
/// unknown ids are dropped, never misdelivered.
pub struct Connection {
    label: String,
    next_id: AtomicI64,
    pending: PendingMap,
    writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    dispatcher: JoinHandle<()>,
}

impl Connection {
    pub fn new<R, W>(reader: R, writer: W, label: String) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let dispatcher = tokio::spawn(dispatch_loop(reader, pending.clone(), label.clone()));
        Self {
            label,
            next_id: AtomicI64::new(1),
            pending,
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            dispatcher,
        }
    }

    /// Send a request and await its correlated reply under `deadline`.
    /// On expiry the waiter is removed so a late reply is discarded by the
    /// dispatcher instead of resolving a newer request.
    pub async fn request(&self, method: &str, params: Value, deadline: Duration) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);

        let frame = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        if let Err(err) = self.write_frame(&frame).await {
            self.pending.lock().unwrap().remove(&id);
            return Err(err);
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(Error::Protocol(format!(
                "{}: backend connection closed",
                self.label
            ))),
            Err(_) => {
                self.pending.lock().unwrap().remove(&id);
                Err(Error::timeout(method, deadline))
            }
        }
    }

    /// Fire-and-forget notification, no reply correlation.
    pub async fn notify(&self, method: &str, params: Value) -> Result<()> {
        let frame = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        self.write_frame(&frame).await
    }

    async fn write_frame(&self, frame: &Value) -> Result<()> {
        let body = serde_json::to_vec(frame)
            .map_err(|err| Error::Protocol(format!("encode frame: {err}")))?;
        let header = format!("Content-Length: {}\r\n\r\n", body.len());
        let mut writer = self.writer.lock().await;
        writer.write_all(header.as_bytes()).await?;
        writer.write_all(&body).await?;
        writer.flush().await?;
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

#[derive(Deserialize)]
struct InboundFrame {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

async fn dispatch_loop<R>(reader: R, pending: PendingMap, label: String)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut reader = BufReader::new(reader);
    loop {
        let raw = match read_frame(&mut reader).await {
            Ok(Some(value)) => value,
            Ok(None) => {
                debug!("{label}: backend closed its stream");
                break;
            }
            Err(err) => {
                warn!("{label}: frame read error: {err}");
                break;
            }
        };

        let frame: InboundFrame = match serde_json::from_value(raw) {
            Ok(value) => value,
            Err(err) => {
                warn!("{label}: malformed frame: {err}");
                continue;
            }
        };

        if let Some(method) = frame.method {
            // Server-to-client requests and notifications are outside our
            // capability set; acknowledge nothing.
            debug!("{label}: ignoring inbound {method}");
            continue;
        }

        let Some(id) = frame.id.as_ref().and_then(Value::as_i64) else {
            debug!("{label}: reply without usable id, dropping");
            continue;
        };

        let slot = pending.lock().unwrap().remove(&id);
        let Some(slot) = slot else {
            debug!("{label}: reply for unknown id {id}, dropping");
            continue;
        };

        let outcome = match frame.error {
            Some(error) => Err(Error::Protocol(format!("backend error: {error}"))),
            None => Ok(frame.result.unwrap_or(Value::Null)),
        };
        // The waiter may have timed out between removal and send; ignore.
        let _ = slot.send(outcome);
    }

    // Fail everything still in flight so callers unblock.
    let mut pending = pending.lock().unwrap();
    for (_, slot) in pending.drain() {
        let _ = slot.send(Err(Error::Protocol(format!(
            "{label}: backend connection closed"
        ))));
    }
}

/// Read one `Content-Length`-framed JSON message; `None` at end of stream.
pub(crate) async fn read_frame<R>(reader: &mut BufReader<R>) -> std::io::Result<Option<Value>>
where
    R: AsyncRead + Unpin,
{
    let mut content_length: Option<usize> = None;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some(rest) = line
            .split_once(':')
            .filter(|(name, _)| name.eq_ignore_ascii_case("content-length"))
            .map(|(_, rest)| rest)
        {
            content_length = rest.trim().parse().ok();
        }
    }

    let len = content_length.ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, "missing Content-Length")
    })?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    serde_json::from_slice(&body)
        .map(Some)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))
}

/// One spawned language-analysis backend: child process, framed connection,
/// and lifecycle state. At most one session exists per language (enforced by
/// the registry).
pub struct BackendSession {
    language: String,
    conn: Connection,
    child: tokio::sync::Mutex<Option<Child>>,
    request_timeout: Duration,
    terminated: AtomicBool,
}

impl std::fmt::Debug for BackendSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendSession")
            .field("language", &self.language)
            .finish_non_exhaustive()
    }
}

impl BackendSession {
    /// Spawn the backend and run the two-step handshake: `initialize`
    /// (process id, workspace root URI, declared capabilities) followed by
    /// the `initialized` notification.
    pub async fn start(config: SessionConfig) -> Result<Self> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .current_dir(&config.workspace_root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|err| Error::ProcessStart {
            language: config.language.clone(),
            reason: format!("spawn {}: {err}", config.command),
        })?;

        let (stdin, stdout, stderr) = match (
            child.stdin.take(),
            child.stdout.take(),
            child.stderr.take(),
        ) {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => {
                return Err(Error::ProcessStart {
                    language: config.language.clone(),
                    reason: "child spawned without piped stdio".to_string(),
                });
            }
        };

        // Drain stderr into the log so the child never blocks on it.
        let stderr_label = config.language.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(language = %stderr_label, stderr = %line, "backend stderr");
            }
        });

        let conn = Connection::new(stdout, stdin, config.language.clone());

        let init_params = json!({
            "processId": std::process::id(),
            "rootUri": to_file_uri(&config.workspace_root),
            "capabilities": {
                "textDocument": {
                    "definition": {},
                    "references": {},
                    "documentSymbol": {},
                }
            },
        });
        conn.request("initialize", init_params, config.start_timeout)
            .await
            .map_err(|err| Error::ProcessStart {
                language: config.language.clone(),
                reason: format!("handshake: {err}"),
            })?;
        conn.notify("initialized", json!({})).await?;

        info!(language = %config.language, command = %config.command, "backend session ready");

        Ok(Self {
            language: config.language,
            conn,
            child: tokio::sync::Mutex::new(Some(child)),
            request_timeout: config.request_timeout,
            terminated: AtomicBool::new(false),
        })
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    /// Correlated request against this session's backend.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(Error::Protocol(format!(
                "{}: session terminated",
                self.language
            )));
        }
        self.conn.request(method, params, self.request_timeout).await
    }

    pub async fn notify(&self, method: &str, params: Value) -> Result<()> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(Error::Protocol(format!(
                "{}: session terminated",
                self.language
            )));
        }
        self.conn.notify(method, params).await
    }

    /// Graceful stop: `shutdown` request, `exit` notification, then wait up
    /// to the grace period before force-killing. Safe to call twice.
    pub async fn stop(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.conn.request("shutdown", Value::Null, SHUTDOWN_GRACE).await {
            debug!(language = %self.language, "shutdown request failed: {err}");
        }
        if let Err(err) = self.conn.notify("exit", Value::Null).await {
            debug!(language = %self.language, "exit notification failed: {err}");
        }

        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    warn!(language = %self.language, "backend did not exit, killing");
                    let _ = child.kill().await;
                }
            }
        }
        info!(language = %self.language, "backend session stopped");
    }
}
