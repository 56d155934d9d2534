// src/core/connection/mod.rs

//! A single TCP connection to the server.
//!
//! Each connection owns two background tasks: a writer that drains an
//! unbounded queue of encoded requests onto the socket, and a reader that
//! keeps exactly one read outstanding, decodes frames as they complete, and
//! hands them either to the push handler (pub/sub connections) or to the
//! in-flight slot. Callers send and then wait on the slot, blocking on a
//! condition variable (sync API) or awaiting a notification (async API).

mod handshake;
pub mod inflight;

use crate::config::{ConnectionOptions, Endpoint};
use crate::core::clock;
use crate::core::commands;
use crate::core::metrics;
use crate::core::protocol::{Command, CommandFlags, RespFrame, RespFrameCodec};
use crate::core::runtime::IoRuntime;
use crate::core::ClientError;
use bytes::{Bytes, BytesMut};
use inflight::{InFlight, ReplyOutcome};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use strum_macros::Display;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle of a connection. `Faulted` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Handshaking,
    Ready,
    Faulted,
}

/// Receives frames that arrive outside the request/response flow.
///
/// Implemented by the subscription router. `route` returns the frame back
/// when it is the reply to the command currently in flight.
pub trait PushHandler: Send + Sync {
    fn route(&self, frame: RespFrame) -> Option<RespFrame>;

    /// Called once when the socket dies.
    fn on_disconnect(&self) {}
}

/// State shared between a connection and its background tasks.
struct Link {
    inflight: InFlight,
    connected: AtomicBool,
    state: Mutex<ConnectionState>,
    push: Option<Arc<dyn PushHandler>>,
    endpoint: Endpoint,
}

impl Link {
    fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    /// Marks the connection dead and fails the pending request, if any.
    fn fault(&self, err: ClientError) {
        let was_connected = self.connected.swap(false, Ordering::AcqRel);
        self.set_state(ConnectionState::Faulted);
        if was_connected {
            match &err {
                ClientError::ConnectionClosed => {
                    debug!("Connection to {} closed by peer.", self.endpoint)
                }
                other => warn!("Connection to {} faulted: {}", self.endpoint, other),
            }
            if let Some(push) = &self.push {
                push.on_disconnect();
            }
        }
        self.inflight.fail(err);
    }
}

/// An open connection. Shared as `Arc<Connection>` by the pool.
pub struct Connection {
    /// Pool-local identity.
    id: u64,
    name: Option<String>,
    link: Arc<Link>,
    codec: Mutex<RespFrameCodec>,
    writer: mpsc::UnboundedSender<Bytes>,
    tasks: Mutex<Vec<AbortHandle>>,
    handle: tokio::runtime::Handle,
    command_timeout: Duration,
    /// Server-assigned id from `CLIENT ID`.
    client_id: AtomicU64,
    database: AtomicU8,
    tracking: AtomicBool,
    /// The client id that receives this connection's invalidations.
    redirect_id: AtomicU64,
    last_active: AtomicU64,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("endpoint", &self.link.endpoint)
            .field("client_id", &self.client_id())
            .field("state", &self.state())
            .finish()
    }
}

/// A request that has been written and is waiting for its replies.
struct Sent {
    seq: u64,
    deadline: Instant,
    label: String,
    started: Instant,
}

impl Connection {
    /// Opens a socket, starts the I/O tasks, and performs the handshake.
    pub async fn connect_async(
        id: u64,
        endpoint: &Endpoint,
        options: &ConnectionOptions,
        push: Option<Arc<dyn PushHandler>>,
    ) -> Result<Arc<Connection>, ClientError> {
        let addr = endpoint.to_string();
        debug!("Connecting to {}.", addr);
        let stream = tokio::time::timeout(options.connect_timeout(), TcpStream::connect(&addr))
            .await
            .map_err(|_| {
                ClientError::Io(Arc::new(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to {addr} timed out"),
                )))
            })??;
        stream.set_nodelay(true)?;

        let conn = Arc::new(Self::attach(id, stream, endpoint.clone(), options, push));
        conn.link.set_state(ConnectionState::Handshaking);
        if let Err(e) = handshake::perform(&conn, options).await {
            conn.close();
            return Err(e);
        }
        conn.link.set_state(ConnectionState::Ready);
        info!(
            "Connected to {} (client id {}).",
            endpoint,
            conn.client_id()
        );
        Ok(conn)
    }

    /// Blocking variant of [`Connection::connect_async`].
    pub fn connect(
        id: u64,
        endpoint: &Endpoint,
        options: &ConnectionOptions,
        push: Option<Arc<dyn PushHandler>>,
        runtime: &IoRuntime,
    ) -> Result<Arc<Connection>, ClientError> {
        let endpoint = endpoint.clone();
        let options = options.clone();
        runtime.run_blocking(async move { Self::connect_async(id, &endpoint, &options, push).await })
    }

    /// Wraps an already-connected stream. Must be called inside a tokio runtime.
    fn attach(
        id: u64,
        stream: TcpStream,
        endpoint: Endpoint,
        options: &ConnectionOptions,
        push: Option<Arc<dyn PushHandler>>,
    ) -> Self {
        let link = Arc::new(Link {
            inflight: InFlight::new(),
            connected: AtomicBool::new(true),
            state: Mutex::new(ConnectionState::Connecting),
            push,
            endpoint,
        });
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();

        let handle = tokio::runtime::Handle::current();
        let reader = handle.spawn(read_loop(
            read_half,
            Arc::clone(&link),
            options.receive_buffer_size,
        ));
        let writer = handle.spawn(write_loop(write_half, rx, Arc::clone(&link)));

        Self {
            id,
            name: options.client_name.clone(),
            link,
            codec: Mutex::new(RespFrameCodec::with_key_prefix(options.key_prefix())),
            writer: tx,
            tasks: Mutex::new(vec![reader.abort_handle(), writer.abort_handle()]),
            handle,
            command_timeout: options.command_timeout(),
            client_id: AtomicU64::new(0),
            database: AtomicU8::new(0),
            tracking: AtomicBool::new(false),
            redirect_id: AtomicU64::new(0),
            last_active: AtomicU64::new(clock::now_millis()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.link.endpoint
    }

    pub fn client_id(&self) -> u64 {
        self.client_id.load(Ordering::Acquire)
    }

    pub fn database(&self) -> u8 {
        self.database.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        self.link.connected.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ConnectionState {
        *self.link.state.lock()
    }

    pub fn is_tracking(&self) -> bool {
        self.tracking.load(Ordering::Acquire)
    }

    pub fn redirect_id(&self) -> u64 {
        self.redirect_id.load(Ordering::Acquire)
    }

    /// Time since the last command that counted as activity.
    pub fn idle_for(&self) -> Duration {
        clock::since(self.last_active.load(Ordering::Acquire))
    }

    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    /// Executes one command and returns its reply. A server error reply is
    /// returned as `ClientError::Server`.
    pub fn execute(
        &self,
        cmd: &Command,
        cancel: Option<&CancellationToken>,
    ) -> Result<RespFrame, ClientError> {
        let replies = self.execute_batch(std::slice::from_ref(cmd), cancel)?;
        single_reply(replies)
    }

    pub async fn execute_async(
        &self,
        cmd: &Command,
        cancel: Option<&CancellationToken>,
    ) -> Result<RespFrame, ClientError> {
        let replies = self
            .execute_batch_async(std::slice::from_ref(cmd), cancel)
            .await?;
        single_reply(replies)
    }

    /// Writes all commands in one send and waits until every expected reply
    /// has been decoded. Error replies are returned in place, not as `Err`.
    pub fn execute_batch(
        &self,
        cmds: &[Command],
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<RespFrame>, ClientError> {
        let sent = self.send(cmds, cancel)?;

        let watcher = cancel.map(|token| {
            let token = token.clone();
            let link = Arc::clone(&self.link);
            let seq = sent.seq;
            let label = sent.label.clone();
            self.handle.spawn(async move {
                token.cancelled().await;
                link.inflight
                    .complete(seq, Err(ClientError::Cancelled { command: label }));
            })
        });

        let outcome = match self.link.inflight.wait_blocking(sent.seq, sent.deadline) {
            Some(result) => result,
            None => self.abandon(&sent),
        };
        if let Some(watcher) = watcher {
            watcher.abort();
        }
        self.finish(cmds, &sent, outcome)
    }

    pub async fn execute_batch_async(
        &self,
        cmds: &[Command],
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<RespFrame>, ClientError> {
        let sent = self.send(cmds, cancel)?;
        let outcome = loop {
            let notified = self.link.inflight.notified();
            if let Some(result) = self.link.inflight.take(sent.seq) {
                break result;
            }
            tokio::select! {
                _ = notified => continue,
                _ = tokio::time::sleep_until(sent.deadline.into()) => {
                    break self.abandon(&sent);
                }
                _ = cancelled(cancel) => {
                    break match self.link.inflight.abandon(sent.seq) {
                        Some(result) => result,
                        None => Err(ClientError::Cancelled { command: sent.label.clone() }),
                    };
                }
            }
        };
        self.finish(cmds, &sent, outcome)
    }

    /// Encodes and queues the batch. Fails without touching the socket if a
    /// command is empty, the connection is down, the caller already cancelled,
    /// or the deadline is already in the past.
    fn send(
        &self,
        cmds: &[Command],
        cancel: Option<&CancellationToken>,
    ) -> Result<Sent, ClientError> {
        let label = batch_label(cmds);
        if cmds.is_empty() || cmds.iter().any(Command::is_empty) {
            return Err(ClientError::InvalidConfig(
                "cannot send a command without a name".into(),
            ));
        }
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(ClientError::Cancelled { command: label });
        }
        let started = Instant::now();
        let deadline = started + self.command_timeout;
        if deadline <= started {
            metrics::COMMAND_TIMEOUTS_TOTAL.inc();
            return Err(ClientError::CommandTimeout {
                command: label,
                timeout_ms: self.command_timeout.as_millis() as u64,
            });
        }

        let mut buf = BytesMut::new();
        {
            let mut codec = self.codec.lock();
            for cmd in cmds {
                codec.encode(cmd, &mut buf)?;
            }
        }
        let expected = cmds.iter().filter(|c| c.expects_reply()).count();

        let seq = self.link.inflight.begin(expected);
        if self.writer.send(buf.freeze()).is_err() {
            self.link.inflight.abandon(seq);
            return Err(ClientError::NotConnected);
        }
        metrics::COMMANDS_SENT_TOTAL.inc();
        debug!("Sent '{}' on connection {}.", label, self.id);

        Ok(Sent {
            seq,
            deadline,
            label,
            started,
        })
    }

    fn abandon(&self, sent: &Sent) -> Result<Vec<RespFrame>, ClientError> {
        match self.link.inflight.abandon(sent.seq) {
            Some(result) => result,
            None => Err(ClientError::CommandTimeout {
                command: sent.label.clone(),
                timeout_ms: self.command_timeout.as_millis() as u64,
            }),
        }
    }

    fn finish(
        &self,
        cmds: &[Command],
        sent: &Sent,
        outcome: Result<Vec<RespFrame>, ClientError>,
    ) -> Result<Vec<RespFrame>, ClientError> {
        match outcome {
            Ok(replies) => {
                metrics::COMMAND_LATENCY_SECONDS.observe(sent.started.elapsed().as_secs_f64());
                if cmds
                    .iter()
                    .any(|c| !c.has_flag(CommandFlags::WITHOUT_ACTIVE_TIME))
                {
                    self.last_active
                        .store(clock::now_millis(), Ordering::Release);
                }
                self.observe_select(cmds, &replies);
                Ok(replies)
            }
            Err(e) => {
                if e.is_timeout() {
                    metrics::COMMAND_TIMEOUTS_TOTAL.inc();
                }
                if e.is_fatal_to_connection() {
                    // Unread bytes for the abandoned request may still arrive.
                    self.link.connected.store(false, Ordering::Release);
                    self.link.set_state(ConnectionState::Faulted);
                    debug!("Connection {} unusable after '{}': {}", self.id, sent.label, e);
                }
                Err(e)
            }
        }
    }

    /// Keeps the recorded database in step with `SELECT`s sent by callers.
    fn observe_select(&self, cmds: &[Command], replies: &[RespFrame]) {
        let mut replies = replies.iter();
        for cmd in cmds.iter().filter(|c| c.expects_reply()) {
            let reply = replies.next();
            if cmd.name().eq_ignore_ascii_case(b"SELECT")
                && reply.is_some_and(RespFrame::is_ok)
                && let Some(db) = cmd.arguments().get(1).and_then(|a| {
                    std::str::from_utf8(&a.value).ok()?.parse::<u8>().ok()
                })
            {
                self.database.store(db, Ordering::Release);
            }
        }
    }

    /// Health check used by the pool sweep. Accepts both `PONG` and the
    /// `["pong", ""]` form sent by connections in subscribe mode.
    pub fn ping(&self) -> Result<(), ClientError> {
        let reply = self.execute(&commands::heartbeat(), None)?;
        check_pong(&reply)
    }

    pub async fn ping_async(&self) -> Result<(), ClientError> {
        let reply = self.execute_async(&commands::heartbeat(), None).await?;
        check_pong(&reply)
    }

    /// Turns on server-assisted tracking with invalidations redirected to `redirect`.
    pub async fn enable_tracking_async(
        &self,
        redirect: u64,
        broadcast: bool,
        prefixes: &[Bytes],
    ) -> Result<(), ClientError> {
        let cmd = commands::client_tracking(redirect, broadcast, prefixes);
        self.execute_async(&cmd, None).await?;
        self.mark_tracking(redirect);
        Ok(())
    }

    pub fn enable_tracking(
        &self,
        redirect: u64,
        broadcast: bool,
        prefixes: &[Bytes],
    ) -> Result<(), ClientError> {
        let cmd = commands::client_tracking(redirect, broadcast, prefixes);
        self.execute(&cmd, None)?;
        self.mark_tracking(redirect);
        Ok(())
    }

    fn mark_tracking(&self, redirect: u64) {
        self.tracking.store(true, Ordering::Release);
        self.redirect_id.store(redirect, Ordering::Release);
        debug!(
            "Connection {} tracking keys, redirecting to client {}.",
            self.id, redirect
        );
    }

    pub(crate) fn set_client_id(&self, id: u64) {
        self.client_id.store(id, Ordering::Release);
    }

    pub(crate) fn set_database(&self, db: u8) {
        self.database.store(db, Ordering::Release);
    }

    /// Closes the socket and fails anything still waiting. Idempotent.
    pub fn close(&self) {
        let was_connected = self.link.connected.swap(false, Ordering::AcqRel);
        self.link.set_state(ConnectionState::Disconnected);
        self.link
            .inflight
            .fail(ClientError::Disposed("connection"));
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        if was_connected {
            debug!("Closed connection {} to {}.", self.id, self.link.endpoint);
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

fn single_reply(replies: Vec<RespFrame>) -> Result<RespFrame, ClientError> {
    match replies.into_iter().next() {
        Some(frame) => frame.into_result(),
        // Commands flagged NO_REPLY produce nothing.
        None => Ok(RespFrame::Null),
    }
}

fn check_pong(reply: &RespFrame) -> Result<(), ClientError> {
    let is_pong = match reply {
        RespFrame::SimpleString(s) => s.eq_ignore_ascii_case("PONG"),
        RespFrame::Array(items) | RespFrame::Push(items) => items
            .first()
            .and_then(RespFrame::as_str)
            .is_some_and(|s| s.eq_ignore_ascii_case("pong")),
        _ => false,
    };
    if is_pong {
        Ok(())
    } else {
        Err(ClientError::UnexpectedResponse(format!(
            "expected PONG, got {}",
            reply.to_text_lossy()
        )))
    }
}

fn batch_label(cmds: &[Command]) -> String {
    match cmds {
        [single] => single.to_string(),
        [first, ..] => format!("pipeline of {} starting with {}", cmds.len(), first.name_str()),
        [] => "empty pipeline".to_string(),
    }
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

/// Keeps one read outstanding at all times and decodes frames as bytes arrive.
async fn read_loop(mut reader: OwnedReadHalf, link: Arc<Link>, buffer_size: usize) {
    let mut codec = RespFrameCodec::default();
    let mut buf = BytesMut::with_capacity(buffer_size);
    loop {
        loop {
            match codec.decode(&mut buf) {
                Ok(Some(frame)) => dispatch(&link, frame),
                Ok(None) => break,
                Err(e) => {
                    link.fault(e);
                    return;
                }
            }
        }
        if buf.capacity() - buf.len() < buffer_size / 4 {
            buf.reserve(buffer_size);
        }
        match reader.read_buf(&mut buf).await {
            Ok(0) => {
                link.fault(ClientError::ConnectionClosed);
                return;
            }
            Ok(_) => {}
            Err(e) => {
                link.fault(e.into());
                return;
            }
        }
    }
}

fn dispatch(link: &Link, frame: RespFrame) {
    let frame = match &link.push {
        Some(push) => match push.route(frame) {
            Some(frame) => frame,
            None => return,
        },
        None if matches!(frame, RespFrame::Push(_)) => {
            debug!("Dropping push frame on a request connection.");
            return;
        }
        None => frame,
    };
    if link.inflight.push_reply(frame) == ReplyOutcome::Unsolicited {
        link.fault(ClientError::Protocol(
            "received a reply with no request in flight".to_string(),
        ));
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    link: Arc<Link>,
) {
    while let Some(bytes) = rx.recv().await {
        if let Err(e) = writer.write_all(&bytes).await {
            link.fault(e.into());
            return;
        }
    }
    let _ = writer.shutdown().await;
}
