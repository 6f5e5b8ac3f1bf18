//! Asynchronous command/reply transceiver for one serial link.
//!
//! One background task per link drains the read half one unit at a time into a shared
//! [`ReplyBuffer`]. Callers serialise whole exchanges through the busy lock (which also owns the
//! write half), write their command, and wait for the reader to signal a complete reply.
//!
//! ```text
//!  caller ──lock busy──► write command ──► wait reply_ready ──► take buffer ──► notify cleared
//!  reader ──read unit──► push into buffer ──complete?──► notify reply_ready ──► wait cleared
//! ```
//!
//! The reader never touches the busy lock, so a blocked read cannot stall a writer, and after
//! signalling a reply it waits for the buffer to be cleared, so at most one unread reply is ever
//! buffered. Replies are therefore returned in command order.
//!
//! # Example
//!
//! ```no_run
//! use rust_thermo::link::TransceiverBuilder;
//! use std::time::Duration;
//!
//! # async fn example(port: tokio::io::DuplexStream) -> rust_thermo::error::AppResult<()> {
//! let link = TransceiverBuilder::new()
//!     .with_name("furnace")
//!     .with_timeout(Duration::from_secs(2))
//!     .with_reply_terminator("\r\n")
//!     .build(port)?;
//!
//! let reply = link.send_and_receive("PV?").await?;
//! # Ok(())
//! # }
//! ```

use super::reply_buffer::{
    string_to_units, units_to_string, ReplyBuffer, ReplyChecker, TerminatorChecker,
};
use super::LinkChannel;
use crate::error::{AppResult, ThermoError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

/// Default bound on the wait for a complete reply.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_millis(10_000);
/// Default reply and command terminator.
pub const DEFAULT_TERMINATOR: &str = "\r";
/// Default reply buffer capacity in units.
pub const DEFAULT_CAPACITY: usize = 1024;
/// Pause before the reader retries after a recoverable read error.
pub const READ_RETRY_BACKOFF: Duration = Duration::from_millis(50);

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// State shared between the background reader and callers.
struct Shared {
    buffer: Mutex<ReplyBuffer>,
    reply_ready: Notify,
    buffer_cleared: Notify,
    reader_alive: AtomicBool,
    /// Set after an overflow: the next completion is the tail of the oversized reply.
    resyncing: AtomicBool,
}

impl Shared {
    async fn clear_buffer(&self) {
        self.buffer.lock().await.clear();
        self.resyncing.store(false, Ordering::SeqCst);
        self.buffer_cleared.notify_waiters();
    }
}

/// Builder for [`AsyncLinkTransceiver`]
///
/// Default configuration:
/// * timeout: 10 seconds
/// * reply terminator: "\r"
/// * command terminator: "\r"
/// * capacity: 1024 units
pub struct TransceiverBuilder {
    name: String,
    timeout: Duration,
    reply_terminator: String,
    command_terminator: String,
    capacity: usize,
    checker: Option<Arc<dyn ReplyChecker>>,
}

impl Default for TransceiverBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TransceiverBuilder {
    /// Create a builder with default settings
    pub fn new() -> Self {
        Self {
            name: "link".to_string(),
            timeout: DEFAULT_REPLY_TIMEOUT,
            reply_terminator: DEFAULT_TERMINATOR.to_string(),
            command_terminator: DEFAULT_TERMINATOR.to_string(),
            capacity: DEFAULT_CAPACITY,
            checker: None,
        }
    }

    /// Name used in log output
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the reply timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the terminator that ends a reply
    pub fn with_reply_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.reply_terminator = terminator.into();
        self
    }

    /// Set the terminator appended to every command
    pub fn with_command_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.command_terminator = terminator.into();
        self
    }

    /// Set the reply buffer capacity
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Replace the terminator check with a custom completion predicate
    pub fn with_reply_checker(mut self, checker: Arc<dyn ReplyChecker>) -> Self {
        self.checker = Some(checker);
        self
    }

    /// Split `link` and spawn the background reader.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build<L: LinkChannel>(self, link: L) -> AppResult<AsyncLinkTransceiver> {
        if self.capacity == 0 {
            return Err(ThermoError::Configuration(
                "reply buffer capacity must be > 0".to_string(),
            ));
        }
        let command_terminator = string_to_units(&self.command_terminator)?;
        let (checker, strip_terminator): (Arc<dyn ReplyChecker>, Option<Vec<u8>>) =
            match self.checker {
                Some(checker) => (checker, None),
                None => {
                    let checker = TerminatorChecker::new(&self.reply_terminator)?;
                    let terminator = checker.terminator().to_vec();
                    (Arc::new(checker), Some(terminator))
                }
            };

        let shared = Arc::new(Shared {
            buffer: Mutex::new(ReplyBuffer::new(self.capacity, checker)),
            reply_ready: Notify::new(),
            buffer_cleared: Notify::new(),
            reader_alive: AtomicBool::new(true),
            resyncing: AtomicBool::new(false),
        });

        let (read_half, write_half) = tokio::io::split(link);
        let writer: BoxedWriter = Box::new(write_half);
        let reader = tokio::spawn(run_reader(self.name.clone(), read_half, shared.clone()));

        debug!(link = %self.name, timeout = ?self.timeout, "transceiver started");

        Ok(AsyncLinkTransceiver {
            name: self.name,
            shared,
            busy: Mutex::new(writer),
            command_terminator,
            strip_terminator,
            timeout: self.timeout,
            reader,
        })
    }
}

/// Serialised request/reply access to one link.
pub struct AsyncLinkTransceiver {
    name: String,
    shared: Arc<Shared>,
    /// Busy lock: held for the whole of one exchange, owns the write half.
    busy: Mutex<BoxedWriter>,
    command_terminator: Vec<u8>,
    strip_terminator: Option<Vec<u8>>,
    timeout: Duration,
    reader: JoinHandle<()>,
}

impl AsyncLinkTransceiver {
    /// Build a transceiver with default settings
    pub fn new<L: LinkChannel>(link: L) -> AppResult<Self> {
        TransceiverBuilder::new().build(link)
    }

    /// Send `command` and wait for the next complete reply.
    ///
    /// Blocks while another exchange is in flight. The command terminator is appended and the
    /// reply terminator (when the default terminator check is used) is stripped from the reply.
    ///
    /// # Errors
    /// - [`ThermoError::Timeout`] if the command cannot be written or no complete reply arrives
    ///   within the timeout
    /// - [`ThermoError::Io`] if the command could not be written
    /// - [`ThermoError::ReaderStopped`] if the link has closed
    /// - [`ThermoError::InvalidCommand`] for characters that are not single link units
    pub async fn send_and_receive(&self, command: &str) -> AppResult<String> {
        let mut units = string_to_units(command)?;
        units.extend_from_slice(&self.command_terminator);

        let mut writer = self.busy.lock().await;
        if !self.is_reader_running() {
            return Err(ThermoError::ReaderStopped);
        }

        // Anything buffered now arrived after the previous exchange finished.
        self.shared.clear_buffer().await;

        // One deadline covers the write and the reply; a stalled link must not hold the lock.
        let deadline = Instant::now() + self.timeout;
        let written = tokio::time::timeout_at(deadline, async {
            for unit in &units {
                writer.write_u8(*unit).await?;
            }
            writer.flush().await?;
            Ok::<(), std::io::Error>(())
        })
        .await;

        let result = match written {
            Ok(Ok(())) => {
                debug!(link = %self.name, command = %command.escape_debug(), "command sent");
                self.wait_for_reply(deadline).await
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(ThermoError::Timeout {
                timeout: self.timeout,
            }),
        };
        match &result {
            Ok(reply) => {
                debug!(link = %self.name, reply = %reply.escape_debug(), "reply received")
            }
            Err(e) => {
                self.shared.clear_buffer().await;
                warn!(link = %self.name, command = %command.escape_debug(), error = %e, "exchange failed");
            }
        }
        drop(writer);
        result
    }

    /// Send `command`, discard the reply, and log rather than propagate link failures.
    pub async fn send_only(&self, command: &str) {
        match self.send_and_receive(command).await {
            Ok(_) => {}
            Err(ThermoError::Timeout { .. }) => {
                debug!(link = %self.name, command = %command.escape_debug(), "no reply to fire-and-forget command")
            }
            Err(e) => {
                warn!(link = %self.name, command = %command.escape_debug(), error = %e, "fire-and-forget command failed")
            }
        }
    }

    async fn wait_for_reply(&self, deadline: Instant) -> AppResult<String> {
        loop {
            let ready = self.shared.reply_ready.notified();
            tokio::pin!(ready);
            ready.as_mut().enable();

            {
                let mut buffer = self.shared.buffer.lock().await;
                if buffer.is_complete() {
                    let reply = buffer.take();
                    drop(buffer);
                    self.shared.buffer_cleared.notify_waiters();
                    return Ok(self.strip(reply));
                }
            }

            if !self.is_reader_running() {
                return Err(ThermoError::ReaderStopped);
            }

            if tokio::time::timeout_at(deadline, ready).await.is_err() {
                return Err(ThermoError::Timeout {
                    timeout: self.timeout,
                });
            }
        }
    }

    fn strip(&self, mut reply: String) -> String {
        if let Some(terminator) = &self.strip_terminator {
            let terminator = units_to_string(terminator);
            let kept = reply.strip_suffix(terminator.as_str()).map(str::len);
            if let Some(len) = kept {
                reply.truncate(len);
            }
        }
        reply
    }

    /// Whether the background reader is still draining the link.
    pub fn is_reader_running(&self) -> bool {
        self.shared.reader_alive.load(Ordering::SeqCst) && !self.reader.is_finished()
    }

    /// Stop the background reader. Later exchanges fail with [`ThermoError::ReaderStopped`].
    pub fn shutdown(&self) {
        self.reader.abort();
        self.shared.reader_alive.store(false, Ordering::SeqCst);
        self.shared.reply_ready.notify_waiters();
        debug!(link = %self.name, "transceiver shut down");
    }

    /// Configured reply timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Name used in log output.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for AsyncLinkTransceiver {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Background reader: one unit at a time for the lifetime of the link.
async fn run_reader<R>(name: String, mut reader: R, shared: Arc<Shared>)
where
    R: AsyncRead + Unpin,
{
    loop {
        let unit = match reader.read_u8().await {
            Ok(unit) => unit,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                warn!(link = %name, "link closed; reader stopping");
                break;
            }
            Err(e) => {
                warn!(link = %name, error = %e, "link read failed; retrying");
                tokio::time::sleep(READ_RETRY_BACKOFF).await;
                continue;
            }
        };

        let complete = {
            let mut buffer = shared.buffer.lock().await;
            match buffer.push(unit) {
                Ok(true) if shared.resyncing.swap(false, Ordering::SeqCst) => {
                    warn!(link = %name, "discarded tail of overflowed reply");
                    buffer.clear();
                    false
                }
                Ok(complete) => complete,
                Err(e) => {
                    error!(link = %name, error = %e, "reply stream desynchronised; buffer cleared");
                    shared.resyncing.store(true, Ordering::SeqCst);
                    false
                }
            }
        };

        if complete {
            trace!(link = %name, "complete reply buffered");
            shared.reply_ready.notify_waiters();
            wait_until_cleared(&shared).await;
        }
    }

    shared.reader_alive.store(false, Ordering::SeqCst);
    shared.reply_ready.notify_waiters();
}

async fn wait_until_cleared(shared: &Shared) {
    loop {
        let cleared = shared.buffer_cleared.notified();
        tokio::pin!(cleared);
        cleared.as_mut().enable();

        if !shared.buffer.lock().await.is_complete() {
            return;
        }
        cleared.await;
    }
}
