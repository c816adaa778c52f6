use bytes::{BufMut, BytesMut};
use log::debug;
use tokio::sync::oneshot;

use crate::commands::{
    decr_argv, hincr_argv, incr_argv, mset_argv, set_argv, spop_argv, Command, SetOptions, TxnMark,
};
use crate::connection::{Connection, Slot};
use crate::pool::Pool;
use crate::resp::Value;
use crate::{Error, RedisResult};

enum Target {
    Connection(Connection),
    /// Acquired at send time so a MULTI block rides one reservation.
    Pool(Pool),
}

/// A deferred batch of commands bound to one submit target.
///
/// Append commands with the chainable verb methods, then
/// [`send`](Pipeline::send) the whole batch: everything is written in a
/// single socket write and the replies are read back in submission order.
/// A pipeline is consumed by sending; it cannot touch the lifecycle of its
/// connection.
///
/// A pipeline whose first command is MULTI is a transaction: EXEC is
/// appended automatically (unless
/// [`auto_close_transaction`](crate::Options::auto_close_transaction) is
/// off) and the aggregate result becomes the EXEC reply array instead of
/// the QUEUED acknowledgements.
pub struct Pipeline {
    target: Target,
    commands: Vec<Command>,
    multi_start: bool,
    nested_multi: bool,
    auto_close_transaction: bool,
}

impl Pipeline {
    pub(crate) fn for_connection(conn: Connection) -> Pipeline {
        let auto_close = conn.options().auto_close_transaction;
        Pipeline::new(Target::Connection(conn), auto_close)
    }

    pub(crate) fn for_pool(pool: Pool, auto_close_transaction: bool) -> Pipeline {
        Pipeline::new(Target::Pool(pool), auto_close_transaction)
    }

    fn new(target: Target, auto_close_transaction: bool) -> Pipeline {
        Pipeline {
            target,
            commands: Vec::new(),
            multi_start: false,
            nested_multi: false,
            auto_close_transaction,
        }
    }

    /// Appends an arbitrary command.
    pub fn cmd<S: AsRef<str>>(self, argv: &[S]) -> Pipeline {
        self.append(Command::new(argv))
    }

    pub(crate) fn append(mut self, cmd: Command) -> Pipeline {
        self.commands.push(cmd);
        self
    }

    /// Opens a transaction. Only valid once per pipeline, and only counts
    /// as a transaction pipeline when it is the first command.
    pub fn multi(mut self) -> Pipeline {
        if self.commands.iter().any(|c| c.txn == TxnMark::Multi) {
            self.nested_multi = true;
            return self;
        }
        if self.commands.is_empty() {
            self.multi_start = true;
        }
        self.append(Command::new(&["MULTI"]))
    }

    pub fn exec(self) -> Pipeline {
        self.append(Command::new(&["EXEC"]))
    }

    pub fn discard(self) -> Pipeline {
        self.append(Command::new(&["DISCARD"]))
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Flushes the batch and returns all replies in submission order. An
    /// empty pipeline is a no-op returning an empty list. Per-command
    /// server errors appear in the list as [`Value::Error`] entries; for a
    /// transaction pipeline the result is the EXEC reply array.
    pub async fn send(self) -> RedisResult<Vec<Value>> {
        self.flush().await
    }

    /// Like [`send`](Pipeline::send) but returns only the reply at
    /// `index`; negative indexes count from the end, and for a transaction
    /// pipeline they index inside the EXEC reply array.
    pub async fn send_nth(self, index: isize) -> RedisResult<Value> {
        let mut replies = self.flush().await?;
        let len = replies.len() as isize;
        let at = if index < 0 { len + index } else { index };
        if at < 0 || at >= len {
            return Err(Error::usage(format!(
                "reply index {} out of range for {} replies",
                index, len
            )));
        }
        Ok(replies.swap_remove(at as usize))
    }

    async fn flush(mut self) -> RedisResult<Vec<Value>> {
        if self.nested_multi {
            return Err(Error::usage("MULTI calls cannot be nested in a pipeline"));
        }
        if self.commands.is_empty() {
            return Ok(Vec::new());
        }
        // DISCARD closes the transaction just like EXEC; appending EXEC
        // after it would earn an "EXEC without MULTI" from the server.
        let closes_transaction = matches!(
            self.commands.last(),
            Some(c) if c.txn == TxnMark::Exec || c.txn == TxnMark::Discard
        );
        if self.multi_start && self.auto_close_transaction && !closes_transaction {
            self.commands.push(Command::new(&["EXEC"]));
        }
        // Substitution only applies when the batch actually ends in EXEC;
        // a discarded transaction keeps its raw reply list.
        let substitute_exec = self.multi_start
            && matches!(self.commands.last(), Some(c) if c.txn == TxnMark::Exec);

        let mut buffer = BytesMut::with_capacity(
            self.commands.iter().map(|c| c.bytes.len()).sum::<usize>(),
        );
        let mut slots = Vec::with_capacity(self.commands.len());
        let mut receivers = Vec::with_capacity(self.commands.len());
        for cmd in &self.commands {
            buffer.put_slice(&cmd.bytes);
            let (reply, rx) = oneshot::channel();
            slots.push(Slot {
                expects_map: cmd.expects_map,
                txn: cmd.txn,
                reply,
            });
            receivers.push(rx);
        }
        debug!("flushing pipeline of {} commands", self.commands.len());

        // For a pool target the reservation guard must outlive the reply
        // collection so the whole batch stays on one connection.
        let _guard = match &self.target {
            Target::Connection(conn) => {
                conn.dispatch(buffer.freeze(), slots).await?;
                None
            }
            Target::Pool(pool) => {
                let guard = pool.acquire().await?;
                guard.dispatch(buffer.freeze(), slots).await?;
                Some(guard)
            }
        };

        let mut replies = Vec::with_capacity(receivers.len());
        for rx in receivers {
            match rx.await {
                Ok(Ok(value)) => replies.push(value),
                Ok(Err(Error::Server(msg))) => replies.push(Value::Error(msg)),
                Ok(Err(err)) => return Err(err),
                Err(_) => return Err(Error::transport("connection is closed")),
            }
        }

        if substitute_exec {
            match replies.pop() {
                Some(Value::Array(Some(items))) => Ok(items),
                // Null multi-bulk: a WATCHed key changed and the
                // transaction was aborted.
                Some(Value::Array(None)) => {
                    Err(Error::server("transaction aborted by the server"))
                }
                Some(Value::Error(msg)) => Err(Error::server(msg)),
                other => Err(Error::protocol(format!(
                    "unexpected EXEC reply: {:?}",
                    other
                ))),
            }
        } else {
            Ok(replies)
        }
    }

    // Verb helpers, mirroring the command surface.

    pub fn get(self, key: &str) -> Pipeline {
        self.cmd(&["GET", key])
    }

    pub fn set(self, key: &str, value: &str) -> Pipeline {
        self.append(Command::new(&set_argv(key, value, &SetOptions::default())))
    }

    pub fn set_with(self, key: &str, value: &str, options: &SetOptions) -> Pipeline {
        self.append(Command::new(&set_argv(key, value, options)))
    }

    pub fn getset(self, key: &str, value: &str) -> Pipeline {
        self.cmd(&["GETSET", key, value])
    }

    pub fn del(self, keys: &[&str]) -> Pipeline {
        self.append(Command::variadic("DEL", keys))
    }

    pub fn exists(self, key: &str) -> Pipeline {
        self.cmd(&["EXISTS", key])
    }

    pub fn expire(self, key: &str, seconds: u64) -> Pipeline {
        self.cmd(&["EXPIRE", key, &seconds.to_string()])
    }

    pub fn persist(self, key: &str) -> Pipeline {
        self.cmd(&["PERSIST", key])
    }

    pub fn ttl(self, key: &str) -> Pipeline {
        self.cmd(&["TTL", key])
    }

    pub fn keys(self, pattern: &str) -> Pipeline {
        self.cmd(&["KEYS", pattern])
    }

    pub fn rename(self, key: &str, new_key: &str) -> Pipeline {
        self.cmd(&["RENAME", key, new_key])
    }

    pub fn incr(self, key: &str) -> Pipeline {
        self.append(Command::new(&incr_argv(key, None)))
    }

    pub fn incr_by(self, key: &str, by: f64) -> Pipeline {
        self.append(Command::new(&incr_argv(key, Some(by))))
    }

    pub fn decr(self, key: &str) -> Pipeline {
        self.append(Command::new(&decr_argv(key, None)))
    }

    pub fn decr_by(self, key: &str, by: f64) -> Pipeline {
        self.append(Command::new(&decr_argv(key, Some(by))))
    }

    pub fn mset(self, pairs: &[(&str, &str)]) -> Pipeline {
        self.append(Command::new(&mset_argv(pairs)))
    }

    pub fn mget(self, keys: &[&str]) -> Pipeline {
        self.append(Command::variadic("MGET", keys))
    }

    pub fn hset(self, key: &str, field: &str, value: &str) -> Pipeline {
        self.cmd(&["HSET", key, field, value])
    }

    pub fn hget(self, key: &str, field: &str) -> Pipeline {
        self.cmd(&["HGET", key, field])
    }

    pub fn hdel(self, key: &str, fields: &[&str]) -> Pipeline {
        self.append(Command::variadic_key("HDEL", key, fields))
    }

    pub fn hexists(self, key: &str, field: &str) -> Pipeline {
        self.cmd(&["HEXISTS", key, field])
    }

    pub fn hgetall(self, key: &str) -> Pipeline {
        self.append(Command::new(&["HGETALL", key]).expects_map())
    }

    pub fn hkeys(self, key: &str) -> Pipeline {
        self.cmd(&["HKEYS", key])
    }

    pub fn hvals(self, key: &str) -> Pipeline {
        self.cmd(&["HVALS", key])
    }

    pub fn hlen(self, key: &str) -> Pipeline {
        self.cmd(&["HLEN", key])
    }

    pub fn hmset(self, key: &str, pairs: &[(&str, &str)]) -> Pipeline {
        self.append(Command::new(&crate::commands::hmset_argv(key, pairs)))
    }

    pub fn hincr_by(self, key: &str, field: &str, by: f64) -> Pipeline {
        self.append(Command::new(&hincr_argv(key, field, by)))
    }

    pub fn lpush(self, key: &str, values: &[&str]) -> Pipeline {
        self.append(Command::variadic_key("LPUSH", key, values))
    }

    pub fn rpush(self, key: &str, values: &[&str]) -> Pipeline {
        self.append(Command::variadic_key("RPUSH", key, values))
    }

    pub fn lpop(self, key: &str) -> Pipeline {
        self.cmd(&["LPOP", key])
    }

    pub fn rpop(self, key: &str) -> Pipeline {
        self.cmd(&["RPOP", key])
    }

    pub fn llen(self, key: &str) -> Pipeline {
        self.cmd(&["LLEN", key])
    }

    pub fn lrange(self, key: &str, start: i64, stop: i64) -> Pipeline {
        self.cmd(&["LRANGE", key, &start.to_string(), &stop.to_string()])
    }

    pub fn lrem(self, key: &str, count: i64, value: &str) -> Pipeline {
        self.cmd(&["LREM", key, &count.to_string(), value])
    }

    pub fn sadd(self, key: &str, members: &[&str]) -> Pipeline {
        self.append(Command::variadic_key("SADD", key, members))
    }

    pub fn srem(self, key: &str, members: &[&str]) -> Pipeline {
        self.append(Command::variadic_key("SREM", key, members))
    }

    pub fn smembers(self, key: &str) -> Pipeline {
        self.cmd(&["SMEMBERS", key])
    }

    pub fn sismember(self, key: &str, member: &str) -> Pipeline {
        self.cmd(&["SISMEMBER", key, member])
    }

    pub fn scard(self, key: &str) -> Pipeline {
        self.cmd(&["SCARD", key])
    }

    pub fn spop(self, key: &str, count: Option<i64>) -> Pipeline {
        self.append(Command::new(&spop_argv(key, count)))
    }

    pub fn srandmember(self, key: &str) -> Pipeline {
        self.cmd(&["SRANDMEMBER", key])
    }

    pub fn zadd(self, key: &str, entries: &[(f64, &str)]) -> Pipeline {
        self.append(Command::new(&crate::commands::zadd_argv(key, entries)))
    }

    pub fn zrem(self, key: &str, members: &[&str]) -> Pipeline {
        self.append(Command::variadic_key("ZREM", key, members))
    }

    pub fn zrange(self, key: &str, start: i64, stop: i64, with_scores: bool) -> Pipeline {
        self.append(Command::new(&crate::commands::zrange_argv(
            key,
            start,
            stop,
            with_scores,
        )))
    }

    pub fn zscore(self, key: &str, member: &str) -> Pipeline {
        self.cmd(&["ZSCORE", key, member])
    }

    pub fn zcard(self, key: &str) -> Pipeline {
        self.cmd(&["ZCARD", key])
    }

    pub fn ping(self) -> Pipeline {
        self.cmd(&["PING"])
    }

    pub fn echo(self, message: &str) -> Pipeline {
        self.cmd(&["ECHO", message])
    }

    pub fn select(self, db: u32) -> Pipeline {
        self.cmd(&["SELECT", &db.to_string()])
    }

    pub fn dbsize(self) -> Pipeline {
        self.cmd(&["DBSIZE"])
    }

    pub fn flushdb(self) -> Pipeline {
        self.cmd(&["FLUSHDB"])
    }
}
