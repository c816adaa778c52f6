use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use tokio::sync::{broadcast, Notify};

use crate::commands::Command;
use crate::config::Options;
use crate::connection::{Connection, Event};
use crate::pipeline::Pipeline;
use crate::{Error, RedisResult};

const EVENT_QUEUE_DEPTH: usize = 256;

/// Pool-level lifecycle notifications. Per-connection events are re-emitted
/// with the member's pool index attached.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// The first member reached ready; the pool is usable.
    Connected,
    ClientConnected(usize),
    ClientDisconnected(usize, bool),
    ClientError(usize, String),
}

struct PoolInner {
    connections: Vec<Connection>,
    notify: Notify,
    events: broadcast::Sender<PoolEvent>,
    connected: AtomicBool,
}

impl PoolInner {
    fn relay(&self, index: usize, event: Event) {
        match event {
            Event::Connected => {
                if !self.connected.swap(true, Ordering::SeqCst) {
                    let _ = self.events.send(PoolEvent::Connected);
                }
                let _ = self.events.send(PoolEvent::ClientConnected(index));
                self.notify.notify_waiters();
            }
            Event::Reply(_) => self.notify.notify_waiters(),
            Event::Disconnected { had_error } => {
                let _ = self
                    .events
                    .send(PoolEvent::ClientDisconnected(index, had_error));
            }
            Event::ConnectError(msg) | Event::Error(msg) => {
                let _ = self.events.send(PoolEvent::ClientError(index, msg));
            }
            Event::RedisError(_) => {}
        }
    }
}

/// A fixed set of connections sharing one command interface. Commands go to
/// the first idle member; submitters wait when every member is busy or
/// holds an open transaction.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
    options: Options,
}

impl Pool {
    pub(crate) fn spawn(host: String, port: u16, options: Options, size: usize) -> Pool {
        let (events, _) = broadcast::channel(EVENT_QUEUE_DEPTH);
        let connections = (0..size)
            .map(|index| Connection::spawn(host.clone(), port, options.clone(), Some(index)))
            .collect();
        let inner = Arc::new(PoolInner {
            connections,
            notify: Notify::new(),
            events,
            connected: AtomicBool::new(false),
        });
        info!("created pool of {} connections to {}:{}", size, host, port);
        for (index, conn) in inner.connections.iter().enumerate() {
            let mut events = conn.subscribe();
            let inner = inner.clone();
            tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(event) => inner.relay(index, event),
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => {
                            // The member's task is gone; wake waiters so
                            // they can notice.
                            inner.notify.notify_waiters();
                            return;
                        }
                    }
                }
            });
        }
        Pool { inner, options }
    }

    pub fn len(&self) -> usize {
        self.inner.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.connections.is_empty()
    }

    /// Reserves the first idle member, waiting for one to become idle when
    /// all are taken. Wakeups race: whoever scans first wins, which is
    /// acceptable for short-lived commands over a bounded member count.
    pub async fn acquire(&self) -> RedisResult<PooledConnection> {
        loop {
            // Arm the waiter before scanning so a release between the scan
            // and the await cannot be lost.
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(guard) = self.try_acquire() {
                return Ok(guard);
            }
            if self.inner.connections.iter().all(|c| c.is_closed()) {
                return Err(Error::transport("all pool connections are closed"));
            }
            notified.await;
        }
    }

    fn try_acquire(&self) -> Option<PooledConnection> {
        for conn in &self.inner.connections {
            let flags = conn.flags();
            if flags.ready.load(Ordering::SeqCst)
                && !flags.busy.load(Ordering::SeqCst)
                && !flags.transaction_open.load(Ordering::SeqCst)
                && flags
                    .reserved
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
            {
                debug!("reserved pool connection {:?}", conn.pool_index());
                return Some(PooledConnection {
                    conn: conn.clone(),
                    pool: self.inner.clone(),
                });
            }
        }
        None
    }

    pub(crate) async fn raw_command(&self, cmd: Command) -> RedisResult<crate::Value> {
        let conn = self.acquire().await?;
        conn.send_raw(cmd).await
    }

    /// A deferred batch that reserves one member at send time.
    pub fn pipeline(&self) -> Pipeline {
        Pipeline::for_pool(self.clone(), self.options.auto_close_transaction)
    }

    /// A transaction pipeline; the preferred way to run MULTI/EXEC against
    /// a pool since the whole block is self-contained on one member.
    pub fn pmulti(&self) -> Pipeline {
        self.pipeline().multi()
    }

    /// Reserves an idle member and opens a transaction on it. The caller
    /// must run the rest of the transaction on the returned connection and
    /// drop it when done. Fails without waiting when no member is idle.
    pub async fn multi(&self) -> RedisResult<PooledConnection> {
        let conn = self
            .try_acquire()
            .ok_or_else(|| Error::usage("no idle connection available for MULTI"))?;
        conn.send_raw(Command::new(&["MULTI"])).await?;
        Ok(conn)
    }

    /// Disconnects every member. Queued and in-flight submits fail.
    pub async fn disconnect(&self) {
        for conn in &self.inner.connections {
            conn.disconnect().await;
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.events.subscribe()
    }

    /// Resolves once the first member is ready.
    pub async fn wait_connected(&self) -> RedisResult<()> {
        let mut events = self.subscribe();
        loop {
            if self.inner.connected.load(Ordering::SeqCst) {
                return Ok(());
            }
            if self.inner.connections.iter().all(|c| c.is_closed()) {
                return Err(Error::connect("no pool connection could be established"));
            }
            tokio::select! {
                event = events.recv() => match event {
                    Ok(PoolEvent::Connected) => return Ok(()),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(Error::connect("no pool connection could be established"));
                    }
                },
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            }
        }
    }
}

/// A pool member reserved for one submitter. Dropping the guard releases
/// the reservation and wakes waiters.
pub struct PooledConnection {
    conn: Connection,
    pool: Arc<PoolInner>,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("conn", &self.conn)
            .finish_non_exhaustive()
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.conn.flags().reserved.store(false, Ordering::SeqCst);
        self.pool.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::resp::encode_command;
    use crate::testutil::{mock_server, Step};
    use crate::Value;

    fn no_reconnect() -> Options {
        Options {
            reconnect_after: None,
            ..Options::default()
        }
    }

    fn pool(addr: std::net::SocketAddr, size: usize) -> Pool {
        Pool::spawn(addr.ip().to_string(), addr.port(), no_reconnect(), size)
    }

    #[tokio::test]
    async fn test_commands_route_through_pool() {
        let ping = encode_command(&["PING"]);
        // Scripts are handed out in accept order, which need not match
        // pool index order, so both members serve the same script.
        let addr = mock_server(vec![
            vec![Step::new(&ping, b"+PONG\r\n")],
            vec![Step::new(&ping, b"+PONG\r\n")],
        ])
        .await;
        let pool = pool(addr, 2);
        pool.wait_connected().await.unwrap();
        let reply = pool.raw_command(Command::new(&["PING"])).await.unwrap();
        assert_eq!(reply, Value::Simple("PONG".into()));
        pool.disconnect().await;
    }

    #[tokio::test]
    async fn test_third_submit_waits_for_an_idle_member() {
        crate::testutil::init_logging();
        let ping = encode_command(&["PING"]);
        let delay = Duration::from_millis(60);
        let script = || {
            vec![
                Step::delayed(&ping, b"+PONG\r\n", delay),
                Step::delayed(&ping, b"+PONG\r\n", delay),
            ]
        };
        let addr = mock_server(vec![script(), script()]).await;
        let pool = pool(addr, 2);
        pool.wait_connected().await.unwrap();
        // Give both members time to come up so two commands can overlap.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        let tasks: Vec<_> = (0..3)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move {
                    pool.raw_command(Command::new(&["PING"])).await.unwrap();
                    started.elapsed()
                })
            })
            .collect();
        let mut finished = Vec::new();
        for task in tasks {
            finished.push(task.await.unwrap());
        }
        finished.sort();
        // Two commands run concurrently; the third has to wait for a
        // member to come free, so it finishes roughly one delay later.
        assert!(finished[2] >= finished[0] + delay / 2);
        pool.disconnect().await;
    }

    #[tokio::test]
    async fn test_acquire_blocks_until_release() {
        let addr = mock_server(vec![vec![]]).await;
        let pool = pool(addr, 1);
        pool.wait_connected().await.unwrap();

        let guard = pool.acquire().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake after release")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_multi_with_no_idle_member_is_usage_error() {
        let addr = mock_server(vec![vec![]]).await;
        let pool = pool(addr, 1);
        pool.wait_connected().await.unwrap();
        let _guard = pool.acquire().await.unwrap();
        match pool.multi().await {
            Err(Error::Usage(_)) => {}
            other => panic!("expected usage error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_multi_reserves_member_until_exec_and_drop() {
        let multi = encode_command(&["MULTI"]);
        let incr = encode_command(&["INCR", "x"]);
        let exec = encode_command(&["EXEC"]);
        let addr = mock_server(vec![vec![
            Step::new(&multi, b"+OK\r\n"),
            Step::new(&incr, b"+QUEUED\r\n"),
            Step::new(&exec, b"*1\r\n:1\r\n"),
        ]])
        .await;
        let pool = pool(addr, 1);
        pool.wait_connected().await.unwrap();

        let txn = pool.multi().await.unwrap();
        assert!(txn.flags().transaction_open.load(Ordering::SeqCst));
        // The sole member is reserved, so nothing else can claim it.
        assert!(pool.try_acquire().is_none());

        txn.send_raw(Command::new(&["INCR", "x"])).await.unwrap();
        let reply = txn.exec().await.unwrap();
        assert_eq!(reply, Value::Array(Some(vec![Value::Int(1)])));
        assert!(!txn.flags().transaction_open.load(Ordering::SeqCst));
        drop(txn);

        let guard = pool.acquire().await.unwrap();
        drop(guard);
        pool.disconnect().await;
    }

    #[tokio::test]
    async fn test_pool_events_carry_member_index() {
        let ping = encode_command(&["PING"]);
        let addr = mock_server(vec![vec![Step::new(&ping, b"+PONG\r\n")]]).await;
        let pool = pool(addr, 1);
        let mut events = pool.subscribe();
        pool.wait_connected().await.unwrap();
        pool.raw_command(Command::new(&["PING"])).await.unwrap();

        let mut saw_client_connected = false;
        let deadline = Instant::now() + Duration::from_secs(1);
        while Instant::now() < deadline && !saw_client_connected {
            match events.try_recv() {
                Ok(PoolEvent::ClientConnected(index)) => {
                    assert_eq!(index, 0);
                    saw_client_connected = true;
                }
                Ok(_) => {}
                Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
        assert!(saw_client_connected);
        pool.disconnect().await;
    }

    #[tokio::test]
    async fn test_acquire_fails_when_every_member_is_gone() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let pool = pool(addr, 2);
        match tokio::time::timeout(Duration::from_secs(2), pool.acquire()).await {
            Ok(Err(Error::Transport(_))) => {}
            other => panic!("expected transport error, got {:?}", other.map(|r| r.map(|_| ()))),
        }
    }
}
