//! Process output multiplexer
//!
//! Wraps one spawned process and splits its output into the three logs of a
//! [`LogSink`]. Every write for a process goes through one queue drained by a
//! single writer task, so arrival order is preserved on disk and chunks that
//! arrive before the files are open simply wait in the queue.
//!
//! Lifecycle of a handle: `Opening → Streaming → Closing → Closed`. The
//! writer task owns the state sender and is the only place that publishes
//! `Closed`, which therefore happens exactly once.

use crate::error::SuiteError;
use crate::runtime::process::{kill_process_tree, ControlMessage, EventSender, ProcessEvent};
use crate::runtime::sink::{LogSink, SinkFiles, Stream};
use regex::Regex;
use std::borrow::Cow;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

/// Log target used to echo process output to the console
pub const ECHO_TARGET: &str = "suite_runner::echo";

const READ_BUFFER_SIZE: usize = 4096;

/// Lines kept for exit-status extraction
const TAIL_LINES: usize = 20;

/// How long a stream may stay open after its process exited
const STREAM_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Held-back bytes are flushed when the stream stays quiet this long
const PARTIAL_FLUSH_DELAY: Duration = Duration::from_millis(100);

/// Upper bound on a partial line held back between reads
const MAX_PENDING_LINE: usize = 64 * 1024;

/// Longest escape sequence waited for across reads
const MAX_ESCAPE_LEN: usize = 256;

/// CSI sequences, OSC sequences and two-byte escapes
static ANSI_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]").unwrap()
});

/// Remove ANSI escape sequences
pub fn strip_ansi(text: &str) -> Cow<'_, str> {
    ANSI_PATTERN.replace_all(text, "")
}

/// One chunk of output, ready for echo and persistence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Trimmed chunk, colors intact
    pub echo: String,
    /// Trimmed chunk without escape sequences
    pub text: String,
}

/// Decode and trim a raw chunk. Whitespace-only chunks yield `None`.
pub fn prepare_chunk(raw: &[u8]) -> Option<Chunk> {
    let decoded = String::from_utf8_lossy(raw);
    let trimmed = decoded.trim();
    let text = strip_ansi(trimmed);
    if text.trim().is_empty() {
        return None;
    }
    Some(Chunk {
        echo: trimmed.to_string(),
        text: text.into_owned(),
    })
}

/// Terminal notification of a multiplexed process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessClose {
    /// Exit code, `None` when killed by a signal
    pub code: Option<i32>,
    /// Last non-empty line written to the logs
    pub last_log: Option<String>,
    /// Most recent lines, oldest first
    pub tail: Vec<String>,
    /// Log capture failure, if any
    pub error: Option<String>,
}

impl ProcessClose {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Lifecycle state of a handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleState {
    Opening,
    Streaming,
    Closing,
    Closed(ProcessClose),
}

/// Options for [`attach`]
#[derive(Debug, Clone, Copy, Default)]
pub struct MuxOptions {
    /// Write `exit-code.log` once the process closes
    pub record_exit_code: bool,
    /// Echo output to the console log target
    pub echo: bool,
}

enum SinkMessage {
    Chunk { stream: Stream, chunk: Chunk },
    Exited(Option<i32>),
}

/// Cloneable view of a multiplexed process
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    name: String,
    pid: Option<u32>,
    sink: LogSink,
    state: watch::Receiver<HandleState>,
    terminating: Arc<AtomicBool>,
    control: Option<Arc<Mutex<ChildStdin>>>,
}

impl ProcessHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn sink(&self) -> &LogSink {
        &self.sink
    }

    /// Current lifecycle state
    pub fn state(&self) -> HandleState {
        self.state.borrow().clone()
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.state.borrow(), HandleState::Closed(_))
    }

    /// Whether termination was already requested
    pub fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::SeqCst)
    }

    /// Whether the process was spawned with a control channel
    pub fn has_control(&self) -> bool {
        self.control.is_some()
    }

    /// Wait for the close notification
    pub async fn wait(&self) -> ProcessClose {
        let mut state = self.state.clone();
        loop {
            if let HandleState::Closed(close) = &*state.borrow_and_update() {
                return close.clone();
            }
            if state.changed().await.is_err() {
                return match &*state.borrow() {
                    HandleState::Closed(close) => close.clone(),
                    _ => ProcessClose {
                        error: Some("log writer stopped before the process closed".to_string()),
                        ..Default::default()
                    },
                };
            }
        }
    }

    /// Force-kill the process tree.
    ///
    /// Returns `false` without doing anything when the process is already
    /// closed or already being terminated.
    pub fn terminate(&self) -> bool {
        if self.is_closed() || self.terminating.swap(true, Ordering::SeqCst) {
            return false;
        }
        match self.pid {
            Some(pid) => {
                log::debug!("[{}] Killing process tree {}", self.name, pid);
                kill_process_tree(pid);
                true
            }
            None => false,
        }
    }

    /// Write a control message on the child's stdin.
    ///
    /// Returns `Ok(false)` when there is no control channel or the process
    /// already closed.
    pub async fn send_control(&self, message: ControlMessage) -> std::io::Result<bool> {
        let Some(control) = &self.control else {
            return Ok(false);
        };
        if self.is_closed() {
            return Ok(false);
        }

        let line = message.to_line().map_err(std::io::Error::other)?;
        let mut stdin = control.lock().await;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        log::debug!("[{}] Sent control message {}", self.name, line.trim_end());
        Ok(true)
    }
}

/// Take over `child`'s output and start persisting it to `sink`
pub fn attach(
    name: impl Into<String>,
    mut child: Child,
    sink: LogSink,
    options: MuxOptions,
    events: Option<EventSender>,
) -> ProcessHandle {
    let name = name.into();
    let pid = child.id();
    let (state_tx, state_rx) = watch::channel(HandleState::Opening);
    let (queue_tx, queue_rx) = mpsc::unbounded_channel();
    let terminating = Arc::new(AtomicBool::new(false));

    if let (Some(pid), Some(tx)) = (pid, &events) {
        let _ = tx.send((name.clone(), ProcessEvent::Started { pid }));
    }

    let readers: Vec<JoinHandle<()>> = [
        child
            .stdout
            .take()
            .map(|out| spawn_reader(out, Stream::Stdout, queue_tx.clone())),
        child
            .stderr
            .take()
            .map(|err| spawn_reader(err, Stream::Stderr, queue_tx.clone())),
    ]
    .into_iter()
    .flatten()
    .collect();

    let control = child.stdin.take().map(|stdin| Arc::new(Mutex::new(stdin)));

    tokio::spawn(wait_for_exit(name.clone(), child, readers, queue_tx));

    let writer = Writer {
        name: name.clone(),
        sink: sink.clone(),
        options,
        pid,
        terminating: terminating.clone(),
        events,
        state: state_tx,
    };
    tokio::spawn(writer.run(queue_rx));

    ProcessHandle {
        name,
        pid,
        sink,
        state: state_rx,
        terminating,
        control,
    }
}

/// Joins consecutive reads of one stream so that no chunk ends inside a
/// UTF-8 character or an escape sequence. After a read that filled the
/// buffer, the partial last line also waits for the next read.
#[derive(Debug, Default)]
struct ChunkAssembler {
    pending: Vec<u8>,
}

impl ChunkAssembler {
    fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Feed one read and take the bytes that are ready to become a chunk
    fn push(&mut self, data: &[u8], full_read: bool) -> Option<Vec<u8>> {
        self.pending.extend_from_slice(data);
        let mut end = self.pending.len() - incomplete_tail(&self.pending);
        if full_read && self.pending.len() < MAX_PENDING_LINE {
            end = self.pending[..end].iter().rposition(|&b| b == b'\n')? + 1;
        }
        if end == 0 {
            return None;
        }
        let rest = self.pending.split_off(end);
        Some(std::mem::replace(&mut self.pending, rest))
    }

    /// Take whatever is held back, complete or not
    fn finish(&mut self) -> Option<Vec<u8>> {
        if self.pending.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.pending))
    }
}

/// Length of a trailing incomplete UTF-8 character or escape sequence
fn incomplete_tail(buf: &[u8]) -> usize {
    let utf8 = incomplete_utf8(buf);
    let body = &buf[..buf.len() - utf8];
    match body.iter().rposition(|&b| b == 0x1b) {
        Some(esc) if buf.len() - esc <= MAX_ESCAPE_LEN && !escape_complete(&body[esc..]) => buf.len() - esc,
        _ => utf8,
    }
}

fn incomplete_utf8(buf: &[u8]) -> usize {
    for back in 1..=buf.len().min(3) {
        let byte = buf[buf.len() - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let width = match byte {
            0xF0..=0xFF => 4,
            0xE0..=0xEF => 3,
            0xC0..=0xDF => 2,
            _ => 1,
        };
        return if width > back { back } else { 0 };
    }
    0
}

/// `seq` starts with ESC
fn escape_complete(seq: &[u8]) -> bool {
    match seq.get(1) {
        None => false,
        Some(b'[') => seq[2..].iter().any(|b| (0x40..=0x7e).contains(b)),
        Some(b']') => seq[2..].contains(&0x07),
        Some(_) => true,
    }
}

fn spawn_reader<R>(mut reader: R, stream: Stream, queue: mpsc::UnboundedSender<SinkMessage>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; READ_BUFFER_SIZE];
        let mut assembler = ChunkAssembler::default();
        loop {
            let read = if assembler.is_empty() {
                reader.read(&mut buf).await
            } else {
                match tokio::time::timeout(PARTIAL_FLUSH_DELAY, reader.read(&mut buf)).await {
                    Ok(read) => read,
                    Err(_) => {
                        if !forward(&queue, stream, assembler.finish()) {
                            break;
                        }
                        continue;
                    }
                }
            };

            let ready = match read {
                Ok(0) | Err(_) => {
                    forward(&queue, stream, assembler.finish());
                    break;
                }
                Ok(n) => assembler.push(&buf[..n], n == buf.len()),
            };
            if !forward(&queue, stream, ready) {
                break;
            }
        }
    })
}

/// Queue raw bytes as a chunk. Returns `false` once the writer is gone.
fn forward(queue: &mpsc::UnboundedSender<SinkMessage>, stream: Stream, raw: Option<Vec<u8>>) -> bool {
    match raw.as_deref().and_then(prepare_chunk) {
        Some(chunk) => queue.send(SinkMessage::Chunk { stream, chunk }).is_ok(),
        None => true,
    }
}

async fn wait_for_exit(
    name: String,
    mut child: Child,
    readers: Vec<JoinHandle<()>>,
    queue: mpsc::UnboundedSender<SinkMessage>,
) {
    let code = match child.wait().await {
        Ok(status) => status.code(),
        Err(e) => {
            log::error!("[{}] Error waiting for process: {}", name, e);
            None
        }
    };

    // A background grandchild may keep a pipe open forever
    for reader in readers {
        let abort = reader.abort_handle();
        if tokio::time::timeout(STREAM_DRAIN_TIMEOUT, reader).await.is_err() {
            log::debug!("[{}] Output stream still open after exit, detaching", name);
            abort.abort();
        }
    }

    let _ = queue.send(SinkMessage::Exited(code));
}

struct Writer {
    name: String,
    sink: LogSink,
    options: MuxOptions,
    pid: Option<u32>,
    terminating: Arc<AtomicBool>,
    events: Option<EventSender>,
    state: watch::Sender<HandleState>,
}

impl Writer {
    async fn run(self, mut queue: mpsc::UnboundedReceiver<SinkMessage>) {
        let mut error: Option<String> = None;
        let mut exited = false;

        let mut files: Option<SinkFiles> = match self.sink.open().await {
            Ok(files) => Some(files),
            Err(e) => {
                let message = format!("cannot open logs in {}: {}", self.sink.dir().display(), e);
                self.fail(&mut error, message, exited);
                None
            }
        };
        self.advance(HandleState::Streaming);

        let mut code = None;
        let mut last_log: Option<String> = None;
        let mut tail: VecDeque<String> = VecDeque::with_capacity(TAIL_LINES);

        while let Some(message) = queue.recv().await {
            match message {
                SinkMessage::Chunk { stream, chunk } => {
                    if self.options.echo {
                        log::info!(target: ECHO_TARGET, "[{}] {}", self.name, chunk.echo);
                    }

                    for line in chunk.text.lines().filter(|l| !l.trim().is_empty()) {
                        if tail.len() == TAIL_LINES {
                            tail.pop_front();
                        }
                        tail.push_back(line.to_string());
                        last_log = Some(line.trim().to_string());
                    }

                    let failed = match files.as_mut() {
                        Some(f) => f.append(stream, &chunk.text).await.err(),
                        None => None,
                    };
                    if let Some(e) = failed {
                        files = None;
                        self.fail(&mut error, format!("write failed: {}", e), exited);
                    }
                }
                SinkMessage::Exited(exit) => {
                    code = exit;
                    exited = true;
                    self.advance(HandleState::Closing);
                }
            }
        }

        if let Some(files) = files.take() {
            if let Err(e) = files.close().await {
                self.fail(&mut error, format!("flush failed: {}", e), exited);
            }
        }

        if self.options.record_exit_code && error.is_none() {
            if let Err(e) = self.sink.write_exit_code(code).await {
                self.fail(&mut error, format!("cannot record exit code: {}", e), exited);
            }
        }

        self.publish(ProcessClose {
            code,
            last_log,
            tail: tail.into(),
            error,
        });
    }

    /// Record an I/O failure and stop the process so nobody waits forever
    fn fail(&self, error: &mut Option<String>, message: String, exited: bool) {
        let failure = SuiteError::ProcessIo {
            name: self.name.clone(),
            message,
        };
        log::error!("{}", failure);
        let message = failure.to_string();
        if let Some(tx) = &self.events {
            let _ = tx.send((
                self.name.clone(),
                ProcessEvent::Error {
                    message: message.clone(),
                },
            ));
        }

        if !exited && !self.terminating.swap(true, Ordering::SeqCst) {
            if let Some(pid) = self.pid {
                kill_process_tree(pid);
            }
        }

        error.get_or_insert(message);
    }

    fn advance(&self, next: HandleState) {
        self.state.send_if_modified(|state| {
            if matches!(state, HandleState::Closed(_)) || *state == next {
                return false;
            }
            *state = next;
            true
        });
    }

    fn publish(&self, close: ProcessClose) {
        let published = self.state.send_if_modified(|state| {
            if matches!(state, HandleState::Closed(_)) {
                return false;
            }
            *state = HandleState::Closed(close.clone());
            true
        });

        if published {
            log::debug!("[{}] Closed with code {:?}", self.name, close.code);
            if let Some(tx) = &self.events {
                let _ = tx.send((self.name.clone(), ProcessEvent::Closed(close)));
            }
        }
    }
}
