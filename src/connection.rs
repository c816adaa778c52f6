use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, error, info, warn};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::timeout;
use tracing::{span, Instrument, Level};

use crate::commands::{Command, TxnMark};
use crate::config::Options;
use crate::framer::LineFramer;
use crate::pipeline::Pipeline;
use crate::resp::{read_value, Value};
use crate::{Error, RedisResult};

const REQUEST_QUEUE_DEPTH: usize = 1024;
const EVENT_QUEUE_DEPTH: usize = 256;

/// Lifecycle notifications published by a connection.
#[derive(Debug, Clone)]
pub enum Event {
    Connected,
    Disconnected { had_error: bool },
    ConnectError(String),
    Error(String),
    /// The server answered a command with an error reply; the connection
    /// stays live.
    RedisError(String),
    /// A command completed. Fires once per reply, in reply order, before
    /// the next queued submit is served.
    Reply(Value),
}

/// Availability flags read by the pool scan. Written by the owning
/// connection task (the pool's reserve CAS aside), so readers only ever
/// see states the connection actually passed through.
#[derive(Debug, Default)]
pub(crate) struct Flags {
    pub(crate) ready: AtomicBool,
    pub(crate) busy: AtomicBool,
    pub(crate) transaction_open: AtomicBool,
    pub(crate) reserved: AtomicBool,
}

/// One command's share of a batch: how to interpret its reply and where to
/// deliver it.
pub(crate) struct Slot {
    pub(crate) expects_map: bool,
    pub(crate) txn: TxnMark,
    pub(crate) reply: oneshot::Sender<RedisResult<Value>>,
}

pub(crate) enum Request {
    /// One socket write, `slots.len()` replies read back in order.
    Batch { buffer: Bytes, slots: Vec<Slot> },
    Reconnect { delay: Option<Duration> },
    Shutdown,
}

/// Handle to one connection. Cloning is cheap and every clone talks to the
/// same connection task; the task owns the socket and serves one batch at
/// a time, which is what enforces at-most-one-command-in-flight.
#[derive(Debug, Clone)]
pub struct Connection {
    tx: mpsc::Sender<Request>,
    events: broadcast::Sender<Event>,
    flags: Arc<Flags>,
    options: Options,
    pool_index: Option<usize>,
}

impl Connection {
    pub(crate) fn spawn(
        host: String,
        port: u16,
        options: Options,
        pool_index: Option<usize>,
    ) -> Connection {
        let (tx, rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
        let (events, _) = broadcast::channel(EVENT_QUEUE_DEPTH);
        let flags = Arc::new(Flags::default());
        let actor = Actor {
            host,
            port,
            options: options.clone(),
            flags: flags.clone(),
            events: events.clone(),
            rx,
            stash: VecDeque::new(),
            pool_index,
        };
        tokio::spawn(actor.run());
        Connection {
            tx,
            events,
            flags,
            options,
            pool_index,
        }
    }

    /// Submits one pre-serialized command and waits for its reply. Submits
    /// issued while the connection is not ready or another command is in
    /// flight are queued and served in order.
    pub async fn send_raw(&self, cmd: Command) -> RedisResult<Value> {
        let Command {
            bytes,
            expects_map,
            txn,
        } = cmd;
        let (reply, rx) = oneshot::channel();
        self.dispatch(
            bytes,
            vec![Slot {
                expects_map,
                txn,
                reply,
            }],
        )
        .await?;
        rx.await
            .map_err(|_| Error::transport("connection is closed"))?
    }

    pub(crate) async fn dispatch(&self, buffer: Bytes, slots: Vec<Slot>) -> RedisResult<()> {
        self.tx
            .send(Request::Batch { buffer, slots })
            .await
            .map_err(|_| Error::transport("connection is closed"))
    }

    /// A deferred batch bound to this connection.
    pub fn pipeline(&self) -> Pipeline {
        Pipeline::for_connection(self.clone())
    }

    /// A pipeline that already opens with MULTI.
    pub fn pmulti(&self) -> Pipeline {
        self.pipeline().multi()
    }

    pub async fn multi(&self) -> RedisResult<Value> {
        self.send_raw(Command::new(&["MULTI"])).await
    }

    pub async fn exec(&self) -> RedisResult<Value> {
        self.send_raw(Command::new(&["EXEC"])).await
    }

    pub async fn discard(&self) -> RedisResult<Value> {
        self.send_raw(Command::new(&["DISCARD"])).await
    }

    /// Disables reconnecting, flushes the write end and closes the socket.
    /// Queued and in-flight submits fail with a transport error. Idempotent.
    pub async fn disconnect(&self) {
        let _ = self.tx.send(Request::Shutdown).await;
    }

    /// Destroys the current socket and connects again immediately.
    pub async fn reconnect(&self) -> RedisResult<()> {
        self.request_reconnect(None).await
    }

    /// Destroys the current socket and connects again after `delay`.
    pub async fn reconnect_after(&self, delay: Duration) -> RedisResult<()> {
        self.request_reconnect(Some(delay)).await
    }

    async fn request_reconnect(&self, delay: Option<Duration>) -> RedisResult<()> {
        self.tx
            .send(Request::Reconnect { delay })
            .await
            .map_err(|_| Error::usage("connection is closed, reconnect is disabled"))
    }

    /// Subscribes to lifecycle events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Resolves once the connection is ready. With reconnecting disabled a
    /// connect failure resolves to its error instead.
    pub async fn wait_ready(&self) -> RedisResult<()> {
        let mut events = self.events.subscribe();
        if self.flags.ready.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.tx.is_closed() {
            return Err(Error::transport("connection is closed"));
        }
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(Event::Connected) => return Ok(()),
                    Ok(Event::ConnectError(msg)) if self.options.reconnect_after.is_none() => {
                        return Err(Error::connect(msg));
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if self.flags.ready.load(Ordering::SeqCst) {
                            return Ok(());
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(Error::transport("connection is closed"));
                    }
                },
                _ = self.tx.closed() => {
                    return Err(Error::transport("connection is closed"));
                }
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        self.flags.ready.load(Ordering::SeqCst)
    }

    /// Index of this connection within its pool, when pool-owned.
    pub fn pool_index(&self) -> Option<usize> {
        self.pool_index
    }

    pub(crate) fn flags(&self) -> &Flags {
        &self.flags
    }

    pub(crate) fn options(&self) -> &Options {
        &self.options
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

enum SessionEnd {
    Shutdown,
    Lost { had_error: bool },
    Reconnect { delay: Option<Duration> },
}

/// The task side of a connection: owns the socket and all per-connection
/// state, serves requests strictly one batch at a time.
struct Actor {
    host: String,
    port: u16,
    options: Options,
    flags: Arc<Flags>,
    events: broadcast::Sender<Event>,
    rx: mpsc::Receiver<Request>,
    /// Batches received while between sessions; served first once
    /// connected again.
    stash: VecDeque<Request>,
    pool_index: Option<usize>,
}

impl Actor {
    async fn run(mut self) {
        loop {
            debug!("connecting to {}:{}{}", self.host, self.port, self.label());
            let connect = TcpStream::connect((self.host.as_str(), self.port));
            let stream = match timeout(self.options.connect_timeout, connect).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(err)) => {
                    if self.connect_failed(err.to_string()).await {
                        continue;
                    }
                    return;
                }
                Err(_) => {
                    let msg = format!(
                        "connect timed out after {:?}",
                        self.options.connect_timeout
                    );
                    if self.connect_failed(msg).await {
                        continue;
                    }
                    return;
                }
            };
            if let Err(err) = stream.set_nodelay(true) {
                warn!("failed to enable TCP_NODELAY: {}", err);
            }
            info!("connected to {}:{}{}", self.host, self.port, self.label());
            self.flags.ready.store(true, Ordering::SeqCst);
            let _ = self.events.send(Event::Connected);

            let end = self.session(stream).await;
            self.flags.ready.store(false, Ordering::SeqCst);
            self.flags.busy.store(false, Ordering::SeqCst);
            self.flags.transaction_open.store(false, Ordering::SeqCst);
            match end {
                SessionEnd::Shutdown => {
                    info!("disconnected from {}:{}{}", self.host, self.port, self.label());
                    let _ = self.events.send(Event::Disconnected { had_error: false });
                    return;
                }
                SessionEnd::Lost { had_error } => {
                    let _ = self.events.send(Event::Disconnected { had_error });
                    match self.options.reconnect_after {
                        Some(delay) => {
                            if !self.idle_sleep(delay).await {
                                return;
                            }
                        }
                        None => return,
                    }
                }
                SessionEnd::Reconnect { delay } => {
                    let _ = self.events.send(Event::Disconnected { had_error: false });
                    if let Some(delay) = delay {
                        if !self.idle_sleep(delay).await {
                            return;
                        }
                    }
                }
            }
        }
    }

    fn label(&self) -> String {
        match self.pool_index {
            Some(index) => format!(" (pool index {})", index),
            None => String::new(),
        }
    }

    /// Returns true when the connect should be retried.
    async fn connect_failed(&mut self, msg: String) -> bool {
        warn!("connect to {}:{} failed: {}", self.host, self.port, msg);
        let _ = self.events.send(Event::ConnectError(msg));
        match self.options.reconnect_after {
            Some(delay) => self.idle_sleep(delay).await,
            None => false,
        }
    }

    /// Sleeps between sessions while still accepting requests: batches are
    /// stashed for the next session, shutdown aborts the sleep. Returns
    /// false on shutdown.
    async fn idle_sleep(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                req = self.rx.recv() => match req {
                    None | Some(Request::Shutdown) => return false,
                    Some(Request::Reconnect { .. }) => return true,
                    Some(batch @ Request::Batch { .. }) => self.stash.push_back(batch),
                },
            }
        }
    }

    async fn session(&mut self, stream: TcpStream) -> SessionEnd {
        let (read_half, write_half) = stream.into_split();
        let mut framer = LineFramer::new(read_half);
        let mut writer = BufWriter::new(write_half);
        loop {
            let req = match self.stash.pop_front() {
                Some(req) => req,
                None => match self.rx.recv().await {
                    Some(req) => req,
                    // Every handle is gone; nothing can submit anymore.
                    None => {
                        let _ = writer.flush().await;
                        return SessionEnd::Shutdown;
                    }
                },
            };
            match req {
                Request::Shutdown => {
                    let _ = writer.flush().await;
                    let _ = writer.shutdown().await;
                    return SessionEnd::Shutdown;
                }
                Request::Reconnect { delay } => {
                    let _ = writer.flush().await;
                    return SessionEnd::Reconnect { delay };
                }
                Request::Batch { buffer, slots } => {
                    let span = span!(Level::DEBUG, "batch", commands = slots.len());
                    if let Err(end) = self
                        .handle_batch(&mut framer, &mut writer, buffer, slots)
                        .instrument(span)
                        .await
                    {
                        return end;
                    }
                }
            }
        }
    }

    async fn handle_batch(
        &mut self,
        framer: &mut LineFramer<OwnedReadHalf>,
        writer: &mut BufWriter<OwnedWriteHalf>,
        buffer: Bytes,
        slots: Vec<Slot>,
    ) -> Result<(), SessionEnd> {
        self.flags.busy.store(true, Ordering::SeqCst);
        let started = Instant::now();
        let count = slots.len();
        if let Err(err) = write_all_flush(writer, &buffer).await {
            let msg = err.to_string();
            error!("write to {}:{} failed: {}", self.host, self.port, msg);
            let _ = self.events.send(Event::Error(msg.clone()));
            fail_slots(slots, &msg);
            self.flags.busy.store(false, Ordering::SeqCst);
            return Err(SessionEnd::Lost { had_error: true });
        }
        let mut slots = slots.into_iter();
        while let Some(slot) = slots.next() {
            match read_value(framer, slot.expects_map).await {
                Ok(Value::Error(msg)) => {
                    debug!("server error reply: {}", msg);
                    self.track_transaction(slot.txn, false);
                    let _ = self.events.send(Event::RedisError(msg.clone()));
                    let _ = self.events.send(Event::Reply(Value::Error(msg.clone())));
                    let _ = slot.reply.send(Err(Error::server(msg)));
                }
                Ok(value) => {
                    self.track_transaction(slot.txn, true);
                    let _ = self.events.send(Event::Reply(value.clone()));
                    let _ = slot.reply.send(Ok(value));
                }
                Err(err @ Error::Protocol(_)) => {
                    // Line framing is still intact after a protocol error,
                    // so the session survives; only this slot fails.
                    warn!("protocol error from {}:{}: {}", self.host, self.port, err);
                    let _ = self.events.send(Event::RedisError(err.to_string()));
                    let _ = self.events.send(Event::Reply(Value::Error(err.to_string())));
                    let _ = slot.reply.send(Err(err));
                }
                Err(err) => {
                    let msg = err.to_string();
                    error!("read from {}:{} failed: {}", self.host, self.port, msg);
                    let _ = self.events.send(Event::Error(msg.clone()));
                    let _ = slot.reply.send(Err(err));
                    fail_slots(slots, &msg);
                    self.flags.busy.store(false, Ordering::SeqCst);
                    return Err(SessionEnd::Lost { had_error: true });
                }
            }
        }
        self.flags.busy.store(false, Ordering::SeqCst);
        debug!(
            "served batch of {} in {}us",
            count,
            started.elapsed().as_micros()
        );
        Ok(())
    }

    fn track_transaction(&self, txn: TxnMark, success: bool) {
        match txn {
            TxnMark::Multi if success => self.flags.transaction_open.store(true, Ordering::SeqCst),
            TxnMark::Exec | TxnMark::Discard => {
                self.flags.transaction_open.store(false, Ordering::SeqCst)
            }
            _ => {}
        }
    }
}

async fn write_all_flush(writer: &mut BufWriter<OwnedWriteHalf>, buffer: &[u8]) -> io::Result<()> {
    writer.write_all(buffer).await?;
    writer.flush().await
}

fn fail_slots<I>(slots: I, msg: &str)
where
    I: IntoIterator<Item = Slot>,
{
    for slot in slots {
        let _ = slot.reply.send(Err(Error::transport(msg)));
    }
}
