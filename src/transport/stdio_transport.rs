//! Standard input/output based transports
//!
//! - [`ClientStdioTransport`] spawns a child process and exchanges newline-delimited
//!   JSON with it over the child's stdin/stdout. Lines the child writes to stderr
//!   are collected in order and reported if the child exits abnormally.
//! - [`StreamTransport`] speaks the same framing over any async reader/writer
//!   pair; [`ServerStdioTransport`] binds it to this process's own stdin/stdout.
//!
//! # Examples
//!
//! ```rust,no_run
//! use mcp_duplex::transport::{ClientStdioTransport, Transport};
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = ClientStdioTransport::new("my-mcp-server", &["--stdio"])
//!     .current_dir("/srv/tools")
//!     .env("RUST_LOG", "debug")
//!     .shutdown_timeout(Duration::from_secs(2));
//!
//! let lifetime = CancellationToken::new();
//! transport.start(&lifetime).await?;
//! let response = transport.send_request("ping", None, &lifetime).await?;
//! println!("{response:?}");
//!
//! // Terminates the child and everything it spawned.
//! transport.dispose().await?;
//! # Ok(())
//! # }
//! ```

use super::error::{TransportError, TransportErrorCode};
use super::process_tree;
use super::{Listener, Result, Transport};
use crate::protocol::{lock, LineStream, Protocol};
use async_trait::async_trait;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, Lines, Stdin,
    Stdout,
};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default grace period for the child to exit after it was signalled
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// How long stdout/stderr may keep draining after the child exited
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// One stdout line, or the terminal fault that ends the stream
type OutputItem = Result<String>;

/// The child's pipes as seen by the correlator
#[derive(Default)]
struct ChildPipes {
    stdin: tokio::sync::Mutex<Option<BufWriter<ChildStdin>>>,
    output: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<OutputItem>>>,
}

#[async_trait]
impl LineStream for ChildPipes {
    async fn read_line(&self) -> Result<Option<String>> {
        let mut output = self.output.lock().await;
        let output = output
            .as_mut()
            .ok_or_else(|| TransportError::new(TransportErrorCode::InvalidState, "Transport not opened"))?;
        match output.recv().await {
            Some(Ok(line)) => Ok(Some(line)),
            Some(Err(fault)) => Err(fault),
            None => Ok(None),
        }
    }

    async fn write_line(&self, line: &str) -> Result<()> {
        let mut stdin = self.stdin.lock().await;
        let stdin = stdin
            .as_mut()
            .ok_or_else(|| TransportError::new(TransportErrorCode::ConnectionClosed, "child stdin is closed"))?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }
}

struct RunningChild {
    pid: Option<u32>,
    exited: watch::Receiver<Option<i32>>,
    watcher: JoinHandle<()>,
}

/// Client transport that owns a child process
pub struct ClientStdioTransport {
    program: String,
    args: Vec<String>,
    current_dir: Option<PathBuf>,
    env: Vec<(String, String)>,
    shutdown_timeout: Duration,
    pipes: Arc<ChildPipes>,
    protocol: Arc<Protocol>,
    listener: Listener,
    child: Mutex<Option<RunningChild>>,
}

impl ClientStdioTransport {
    /// Describes the command to spawn. Nothing runs until [`Transport::start`].
    pub fn new(program: &str, args: &[&str]) -> Self {
        let pipes = Arc::new(ChildPipes::default());
        let protocol = Arc::new(Protocol::new(pipes.clone()));
        Self {
            program: program.to_string(),
            args: args.iter().map(|&s| s.to_string()).collect(),
            current_dir: None,
            env: Vec::new(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            listener: Listener::new("stdio-client", protocol.clone()),
            pipes,
            protocol,
            child: Mutex::new(None),
        }
    }

    /// Working directory of the child
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Adds an environment variable on top of the inherited environment
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Grace period `dispose` waits for the child to exit
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// OS process id of the running child
    pub fn pid(&self) -> Option<u32> {
        lock(&self.child).as_ref().and_then(|child| child.pid)
    }

    fn spawn_child(&self) -> Result<Child> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }
        command.envs(self.env.iter().map(|(key, value)| (key.as_str(), value.as_str())));

        command.spawn().map_err(|e| {
            TransportError::with_source(
                TransportErrorCode::SpawnFailed,
                format!("failed to spawn '{}'", self.program),
                e,
            )
        })
    }
}

fn missing_pipe(name: &str) -> TransportError {
    TransportError::new(
        TransportErrorCode::ConnectionFailed,
        format!("Child process {name} not available"),
    )
}

async fn pump_stdout(stdout: ChildStdout, tx: mpsc::UnboundedSender<OutputItem>) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(Ok(line)).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                let _ = tx.send(Err(e.into()));
                break;
            }
        }
    }
}

async fn collect_stderr(stderr: ChildStderr, buffer: Arc<Mutex<Vec<String>>>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(line = %line, "child stderr");
        lock(&buffer).push(line);
    }
}

/// Waits for the child to exit, lets both readers drain, then completes the
/// output queue cleanly or with a process fault.
async fn watch_exit(
    mut child: Child,
    mut readers: [JoinHandle<()>; 2],
    stderr: Arc<Mutex<Vec<String>>>,
    tx: mpsc::UnboundedSender<OutputItem>,
    exited: watch::Sender<Option<i32>>,
) {
    let exit_code = match child.wait().await {
        Ok(status) => status.code().unwrap_or(-1),
        Err(e) => {
            warn!(error = %e, "failed to wait for child process");
            -1
        }
    };

    for reader in readers.iter_mut() {
        if tokio::time::timeout(DRAIN_TIMEOUT, &mut *reader).await.is_err() {
            debug!("child output still open after exit, abandoning reader");
            reader.abort();
        }
    }

    let stderr = std::mem::take(&mut *lock(&stderr));
    if exit_code != 0 || !stderr.is_empty() {
        debug!(exit_code, stderr_lines = stderr.len(), "child process exited abnormally");
        let _ = tx.send(Err(TransportError::Process { exit_code, stderr }));
    } else {
        debug!("child process exited cleanly");
    }
    let _ = exited.send(Some(exit_code));
}

#[async_trait]
impl Transport for ClientStdioTransport {
    fn protocol(&self) -> &Arc<Protocol> {
        &self.protocol
    }

    fn is_connected(&self) -> bool {
        self.listener.is_connected()
    }

    async fn start(&self, cancel: &CancellationToken) -> Result<()> {
        self.listener.ensure_unstarted()?;
        debug!(program = %self.program, args = ?self.args, "spawning child process");
        let mut child = self.spawn_child()?;
        let pid = child.id();

        let stdin = child.stdin.take().ok_or_else(|| missing_pipe("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing_pipe("stderr"))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let stderr_lines = Arc::new(Mutex::new(Vec::new()));
        let readers = [
            tokio::spawn(pump_stdout(stdout, tx.clone())),
            tokio::spawn(collect_stderr(stderr, stderr_lines.clone())),
        ];
        let (exit_tx, exit_rx) = watch::channel(None);
        let watcher = tokio::spawn(watch_exit(child, readers, stderr_lines, tx, exit_tx));

        *self.pipes.stdin.lock().await = Some(BufWriter::new(stdin));
        *self.pipes.output.lock().await = Some(rx);
        *lock(&self.child) = Some(RunningChild {
            pid,
            exited: exit_rx,
            watcher,
        });
        debug!(pid = ?pid, "child process started");

        self.listener.spawn(cancel)
    }

    async fn dispose(&self) -> Result<()> {
        self.listener.stop();
        // Closing stdin lets well-behaved servers exit on their own.
        self.pipes.stdin.lock().await.take();

        let running = lock(&self.child).take();
        let Some(RunningChild { pid, mut exited, watcher }) = running else {
            return Ok(());
        };

        let already_exited = exited.borrow().is_some();
        if let (false, Some(pid)) = (already_exited, pid) {
            debug!(pid, "terminating child process tree");
            process_tree::kill_tree(pid).await;
        }

        let stopped = tokio::time::timeout(self.shutdown_timeout, exited.wait_for(Option::is_some))
            .await
            .is_ok();
        if stopped {
            debug!(pid = ?pid, "child process stopped");
        } else {
            warn!(
                pid = ?pid,
                timeout = ?self.shutdown_timeout,
                "child did not exit in time, killing it"
            );
            // Dropping the child inside the watcher delivers SIGKILL.
            watcher.abort();
        }
        Ok(())
    }
}

struct IoLines<R, W> {
    reader: tokio::sync::Mutex<Lines<BufReader<R>>>,
    writer: tokio::sync::Mutex<W>,
}

#[async_trait]
impl<R, W> LineStream for IoLines<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn read_line(&self) -> Result<Option<String>> {
        Ok(self.reader.lock().await.next_line().await?)
    }

    async fn write_line(&self, line: &str) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Newline-delimited JSON over an arbitrary reader/writer pair.
///
/// The read loop runs on a background task. Failures inside it are logged, not
/// propagated, since nothing supervises it.
pub struct StreamTransport<R, W> {
    protocol: Arc<Protocol>,
    listener: Listener,
    _io: PhantomData<fn() -> (R, W)>,
}

/// Server transport over the current process's stdin and stdout
pub type ServerStdioTransport = StreamTransport<Stdin, Stdout>;

impl<R, W> StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Wraps `reader` and `writer`
    pub fn new(reader: R, writer: W) -> Self {
        let stream = IoLines {
            reader: tokio::sync::Mutex::new(BufReader::new(reader).lines()),
            writer: tokio::sync::Mutex::new(writer),
        };
        let protocol = Arc::new(Protocol::new(Arc::new(stream)));
        Self {
            listener: Listener::new("stream", protocol.clone()),
            protocol,
            _io: PhantomData,
        }
    }
}

impl StreamTransport<Stdin, Stdout> {
    /// Binds to this process's stdin and stdout
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }
}

impl Default for StreamTransport<Stdin, Stdout> {
    fn default() -> Self {
        Self::stdio()
    }
}

#[async_trait]
impl<R, W> Transport for StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    fn protocol(&self) -> &Arc<Protocol> {
        &self.protocol
    }

    fn is_connected(&self) -> bool {
        self.listener.is_connected()
    }

    async fn start(&self, cancel: &CancellationToken) -> Result<()> {
        self.listener.spawn(cancel)
    }

    async fn dispose(&self) -> Result<()> {
        self.listener.stop();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tokio::io::AsyncBufReadExt;

    async fn wait_until_disconnected(transport: &impl Transport) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while transport.is_connected() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("transport should disconnect");
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_cat_reflects_requests_back_as_responses() {
        // cat echoes our request; the correlator answers it with "method not
        // found", cat echoes that answer, and it resolves the original call.
        let transport = ClientStdioTransport::new("cat", &[]);
        let lifetime = CancellationToken::new();
        transport.start(&lifetime).await.unwrap();
        assert!(transport.pid().is_some());

        let response = transport.send_request("ping", None, &lifetime).await.unwrap();
        assert_eq!(response.error.unwrap().code, -32601);

        transport.dispose().await.unwrap();
        transport.dispose().await.unwrap();
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_clean_exit_closes_without_fault() {
        let transport = ClientStdioTransport::new("sh", &["-c", "exit 0"]);
        let lifetime = CancellationToken::new();
        transport.start(&lifetime).await.unwrap();
        wait_until_disconnected(&transport).await;

        let err = transport.send_request("ping", None, &lifetime).await.unwrap_err();
        assert_eq!(err.code(), Some(TransportErrorCode::ConnectionClosed));
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_nonzero_exit_surfaces_process_fault() {
        let transport = ClientStdioTransport::new("sh", &["-c", "exit 3"]);
        let lifetime = CancellationToken::new();
        transport.start(&lifetime).await.unwrap();
        wait_until_disconnected(&transport).await;

        match transport.send_request("ping", None, &lifetime).await.unwrap_err() {
            TransportError::Process { exit_code, stderr } => {
                assert_eq!(exit_code, 3);
                assert!(stderr.is_empty());
            }
            other => panic!("expected a process fault, got {other}"),
        }
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_stderr_output_is_a_fault_even_on_success() {
        let transport = ClientStdioTransport::new(
            "sh",
            &["-c", "echo first >&2; echo second >&2; echo third >&2"],
        );
        let lifetime = CancellationToken::new();
        transport.start(&lifetime).await.unwrap();
        wait_until_disconnected(&transport).await;

        match transport.protocol().notify("ping", None).await.unwrap_err() {
            TransportError::Process { exit_code, stderr } => {
                assert_eq!(exit_code, 0);
                assert_eq!(stderr, vec!["first", "second", "third"]);
            }
            other => panic!("expected a process fault, got {other}"),
        }
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_output_before_exit_is_delivered_and_noise_skipped() {
        let script = r#"echo "server starting"; echo '{"jsonrpc":"2.0","method":"notifications/message","params":{"level":"info"}}'; echo bad >&2; exit 2"#;
        let transport = ClientStdioTransport::new("sh", &["-c", script]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.set_notification_handler(
            "notifications/message",
            crate::protocol::notification_handler(move |notification, _| {
                let tx = tx.clone();
                async move {
                    tx.send(notification.params).unwrap();
                    Ok(())
                }
            }),
        );

        let lifetime = CancellationToken::new();
        transport.start(&lifetime).await.unwrap();

        let params = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert_eq!(params, Some(Some(json!({ "level": "info" }))));

        wait_until_disconnected(&transport).await;
        match transport.send_request("ping", None, &lifetime).await.unwrap_err() {
            TransportError::Process { exit_code, stderr } => {
                assert_eq!(exit_code, 2);
                assert_eq!(stderr, vec!["bad"]);
            }
            other => panic!("expected a process fault, got {other}"),
        }
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_working_directory_and_environment_overlay() {
        let script = r#"printf '{"jsonrpc":"2.0","method":"env","params":{"dir":"%s","value":"%s"}}\n' "$(pwd)" "$MCP_DUPLEX_TEST"; sleep 5"#;
        let transport = ClientStdioTransport::new("sh", &["-c", script])
            .current_dir("/")
            .env("MCP_DUPLEX_TEST", "overlay");
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.set_notification_handler(
            "env",
            crate::protocol::notification_handler(move |notification, _| {
                let tx = tx.clone();
                async move {
                    tx.send(notification.params.unwrap_or(Value::Null)).unwrap();
                    Ok(())
                }
            }),
        );

        let lifetime = CancellationToken::new();
        transport.start(&lifetime).await.unwrap();
        let params = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(params, json!({ "dir": "/", "value": "overlay" }));
        transport.dispose().await.unwrap();
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_dispose_tears_down_the_process_tree() {
        let pid_file = std::env::temp_dir().join(format!("mcp-duplex-tree-{}", std::process::id()));
        let _ = std::fs::remove_file(&pid_file);
        let transport = ClientStdioTransport::new(
            "sh",
            &["-c", r#"sleep 30 & echo $! > "$PID_FILE"; sleep 30 & wait"#],
        )
        .env("PID_FILE", pid_file.to_string_lossy())
        .shutdown_timeout(Duration::from_secs(5));
        let lifetime = CancellationToken::new();
        transport.start(&lifetime).await.unwrap();

        let mut grandchild = None;
        for _ in 0..100 {
            grandchild = std::fs::read_to_string(&pid_file)
                .ok()
                .and_then(|text| text.trim().parse::<u32>().ok());
            if grandchild.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let grandchild = grandchild.expect("shell never reported its background pid");

        let started = std::time::Instant::now();
        transport.dispose().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!transport.is_connected());
        assert!(transport.pid().is_none());
        assert!(
            crate::transport::process_tree::tests::wait_gone(grandchild).await,
            "grandchild {grandchild} survived dispose"
        );
        let _ = std::fs::remove_file(&pid_file);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let transport = ClientStdioTransport::new("/definitely/not/a/real/program", &[]);
        let err = transport.start(&CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.code(), Some(TransportErrorCode::SpawnFailed));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_stream_transport_answers_over_a_duplex_pipe() {
        let (peer, ours) = tokio::io::duplex(4096);
        let (reader, writer) = tokio::io::split(ours);
        let transport = StreamTransport::new(reader, writer);
        let lifetime = CancellationToken::new();
        transport.start(&lifetime).await.unwrap();

        let (peer_reader, mut peer_writer) = tokio::io::split(peer);
        let mut peer_lines = BufReader::new(peer_reader).lines();
        peer_writer
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"tools/list\"}\n")
            .await
            .unwrap();

        let line = tokio::time::timeout(Duration::from_secs(5), peer_lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let response: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(response["id"], 1);
        assert_eq!(response["error"]["code"], -32601);

        peer_writer.shutdown().await.unwrap();
        wait_until_disconnected(&transport).await;
    }
}
