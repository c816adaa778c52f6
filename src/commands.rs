use bytes::Bytes;

use crate::connection::Connection;
use crate::pool::Pool;
use crate::resp::{encode_command, Value};
use crate::RedisResult;

/// Whether a command opens or closes a server-side transaction. Recognized
/// from the verb at build time so the connection can track the
/// transaction-open flag from the replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TxnMark {
    None,
    Multi,
    Exec,
    Discard,
}

/// A serialized command plus the flags the reply reader needs.
#[derive(Debug, Clone)]
pub struct Command {
    pub(crate) bytes: Bytes,
    pub(crate) expects_map: bool,
    pub(crate) txn: TxnMark,
}

impl Command {
    pub fn new<S: AsRef<str>>(argv: &[S]) -> Command {
        let txn = match argv.first().map(|a| a.as_ref()) {
            Some(verb) if verb.eq_ignore_ascii_case("MULTI") => TxnMark::Multi,
            Some(verb) if verb.eq_ignore_ascii_case("EXEC") => TxnMark::Exec,
            Some(verb) if verb.eq_ignore_ascii_case("DISCARD") => TxnMark::Discard,
            _ => TxnMark::None,
        };
        Command {
            bytes: encode_command(argv),
            expects_map: false,
            txn,
        }
    }

    /// Asks for a top-level array reply to be folded into a key/value map.
    pub fn expects_map(mut self) -> Command {
        self.expects_map = true;
        self
    }

    pub(crate) fn variadic(verb: &str, items: &[&str]) -> Command {
        let mut argv = Vec::with_capacity(1 + items.len());
        argv.push(verb.to_string());
        argv.extend(items.iter().map(|item| item.to_string()));
        Command::new(&argv)
    }

    pub(crate) fn variadic_key(verb: &str, key: &str, items: &[&str]) -> Command {
        let mut argv = Vec::with_capacity(2 + items.len());
        argv.push(verb.to_string());
        argv.push(key.to_string());
        argv.extend(items.iter().map(|item| item.to_string()));
        Command::new(&argv)
    }
}

/// Optional SET modifiers, appended in the order `EX`, `PX`, `NX`, `XX`.
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    pub ex: Option<u64>,
    pub px: Option<u64>,
    pub nx: bool,
    pub xx: bool,
}

pub(crate) fn set_argv(key: &str, value: &str, options: &SetOptions) -> Vec<String> {
    let mut argv = vec!["SET".to_string(), key.to_string(), value.to_string()];
    if let Some(ex) = options.ex {
        argv.push("EX".to_string());
        argv.push(ex.to_string());
    }
    if let Some(px) = options.px {
        argv.push("PX".to_string());
        argv.push(px.to_string());
    }
    if options.nx {
        argv.push("NX".to_string());
    }
    if options.xx {
        argv.push("XX".to_string());
    }
    argv
}

/// No delta selects INCR, an integral delta INCRBY, a fractional delta
/// INCRBYFLOAT.
pub(crate) fn incr_argv(key: &str, by: Option<f64>) -> Vec<String> {
    match by {
        None => vec!["INCR".to_string(), key.to_string()],
        Some(by) if by.fract() == 0.0 => vec![
            "INCRBY".to_string(),
            key.to_string(),
            (by as i64).to_string(),
        ],
        Some(by) => vec!["INCRBYFLOAT".to_string(), key.to_string(), by.to_string()],
    }
}

/// Integral deltas go out as `DECRBY <by>`; fractional ones have no DECR
/// counterpart and go out as `INCRBYFLOAT -<by>`.
pub(crate) fn decr_argv(key: &str, by: Option<f64>) -> Vec<String> {
    match by {
        None => vec!["DECR".to_string(), key.to_string()],
        Some(by) if by.fract() == 0.0 => vec![
            "DECRBY".to_string(),
            key.to_string(),
            (by as i64).to_string(),
        ],
        Some(by) => vec![
            "INCRBYFLOAT".to_string(),
            key.to_string(),
            (-by).to_string(),
        ],
    }
}

pub(crate) fn hincr_argv(key: &str, field: &str, by: f64) -> Vec<String> {
    if by.fract() == 0.0 {
        vec![
            "HINCRBY".to_string(),
            key.to_string(),
            field.to_string(),
            (by as i64).to_string(),
        ]
    } else {
        vec![
            "HINCRBYFLOAT".to_string(),
            key.to_string(),
            field.to_string(),
            by.to_string(),
        ]
    }
}

/// The count argument is omitted entirely when absent.
pub(crate) fn spop_argv(key: &str, count: Option<i64>) -> Vec<String> {
    match count {
        None => vec!["SPOP".to_string(), key.to_string()],
        Some(count) => vec!["SPOP".to_string(), key.to_string(), count.to_string()],
    }
}

pub(crate) fn mset_argv(pairs: &[(&str, &str)]) -> Vec<String> {
    let mut argv = Vec::with_capacity(1 + pairs.len() * 2);
    argv.push("MSET".to_string());
    for (key, value) in pairs {
        argv.push(key.to_string());
        argv.push(value.to_string());
    }
    argv
}

pub(crate) fn hmset_argv(key: &str, pairs: &[(&str, &str)]) -> Vec<String> {
    let mut argv = Vec::with_capacity(2 + pairs.len() * 2);
    argv.push("HMSET".to_string());
    argv.push(key.to_string());
    for (field, value) in pairs {
        argv.push(field.to_string());
        argv.push(value.to_string());
    }
    argv
}

pub(crate) fn zadd_argv(key: &str, entries: &[(f64, &str)]) -> Vec<String> {
    let mut argv = Vec::with_capacity(2 + entries.len() * 2);
    argv.push("ZADD".to_string());
    argv.push(key.to_string());
    for (score, member) in entries {
        argv.push(score.to_string());
        argv.push(member.to_string());
    }
    argv
}

pub(crate) fn zrange_argv(key: &str, start: i64, stop: i64, with_scores: bool) -> Vec<String> {
    let mut argv = vec![
        "ZRANGE".to_string(),
        key.to_string(),
        start.to_string(),
        stop.to_string(),
    ];
    if with_scores {
        argv.push("WITHSCORES".to_string());
    }
    argv
}

/// The flat verb surface. Everything funnels through
/// [`raw_command`](Commands::raw_command); the helpers only build an argv.
#[allow(async_fn_in_trait)]
pub trait Commands {
    async fn raw_command(&self, cmd: Command) -> RedisResult<Value>;

    async fn get(&self, key: &str) -> RedisResult<Value> {
        self.raw_command(Command::new(&["GET", key])).await
    }

    async fn set(&self, key: &str, value: &str) -> RedisResult<Value> {
        self.raw_command(Command::new(&set_argv(key, value, &SetOptions::default())))
            .await
    }

    async fn set_with(&self, key: &str, value: &str, options: &SetOptions) -> RedisResult<Value> {
        self.raw_command(Command::new(&set_argv(key, value, options)))
            .await
    }

    async fn getset(&self, key: &str, value: &str) -> RedisResult<Value> {
        self.raw_command(Command::new(&["GETSET", key, value])).await
    }

    async fn del(&self, keys: &[&str]) -> RedisResult<Value> {
        self.raw_command(Command::variadic("DEL", keys)).await
    }

    async fn exists(&self, key: &str) -> RedisResult<Value> {
        self.raw_command(Command::new(&["EXISTS", key])).await
    }

    async fn expire(&self, key: &str, seconds: u64) -> RedisResult<Value> {
        self.raw_command(Command::new(&["EXPIRE", key, &seconds.to_string()]))
            .await
    }

    async fn persist(&self, key: &str) -> RedisResult<Value> {
        self.raw_command(Command::new(&["PERSIST", key])).await
    }

    async fn ttl(&self, key: &str) -> RedisResult<Value> {
        self.raw_command(Command::new(&["TTL", key])).await
    }

    async fn keys(&self, pattern: &str) -> RedisResult<Value> {
        self.raw_command(Command::new(&["KEYS", pattern])).await
    }

    async fn rename(&self, key: &str, new_key: &str) -> RedisResult<Value> {
        self.raw_command(Command::new(&["RENAME", key, new_key])).await
    }

    async fn incr(&self, key: &str) -> RedisResult<Value> {
        self.raw_command(Command::new(&incr_argv(key, None))).await
    }

    async fn incr_by(&self, key: &str, by: f64) -> RedisResult<Value> {
        self.raw_command(Command::new(&incr_argv(key, Some(by)))).await
    }

    async fn decr(&self, key: &str) -> RedisResult<Value> {
        self.raw_command(Command::new(&decr_argv(key, None))).await
    }

    async fn decr_by(&self, key: &str, by: f64) -> RedisResult<Value> {
        self.raw_command(Command::new(&decr_argv(key, Some(by)))).await
    }

    async fn mset(&self, pairs: &[(&str, &str)]) -> RedisResult<Value> {
        self.raw_command(Command::new(&mset_argv(pairs))).await
    }

    async fn mget(&self, keys: &[&str]) -> RedisResult<Value> {
        self.raw_command(Command::variadic("MGET", keys)).await
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> RedisResult<Value> {
        self.raw_command(Command::new(&["HSET", key, field, value]))
            .await
    }

    async fn hget(&self, key: &str, field: &str) -> RedisResult<Value> {
        self.raw_command(Command::new(&["HGET", key, field])).await
    }

    async fn hdel(&self, key: &str, fields: &[&str]) -> RedisResult<Value> {
        self.raw_command(Command::variadic_key("HDEL", key, fields))
            .await
    }

    async fn hexists(&self, key: &str, field: &str) -> RedisResult<Value> {
        self.raw_command(Command::new(&["HEXISTS", key, field])).await
    }

    /// The array reply comes back folded into a field/value map.
    async fn hgetall(&self, key: &str) -> RedisResult<Value> {
        self.raw_command(Command::new(&["HGETALL", key]).expects_map())
            .await
    }

    async fn hkeys(&self, key: &str) -> RedisResult<Value> {
        self.raw_command(Command::new(&["HKEYS", key])).await
    }

    async fn hvals(&self, key: &str) -> RedisResult<Value> {
        self.raw_command(Command::new(&["HVALS", key])).await
    }

    async fn hlen(&self, key: &str) -> RedisResult<Value> {
        self.raw_command(Command::new(&["HLEN", key])).await
    }

    async fn hmset(&self, key: &str, pairs: &[(&str, &str)]) -> RedisResult<Value> {
        self.raw_command(Command::new(&hmset_argv(key, pairs))).await
    }

    async fn hincr_by(&self, key: &str, field: &str, by: f64) -> RedisResult<Value> {
        self.raw_command(Command::new(&hincr_argv(key, field, by)))
            .await
    }

    async fn lpush(&self, key: &str, values: &[&str]) -> RedisResult<Value> {
        self.raw_command(Command::variadic_key("LPUSH", key, values))
            .await
    }

    async fn rpush(&self, key: &str, values: &[&str]) -> RedisResult<Value> {
        self.raw_command(Command::variadic_key("RPUSH", key, values))
            .await
    }

    async fn lpop(&self, key: &str) -> RedisResult<Value> {
        self.raw_command(Command::new(&["LPOP", key])).await
    }

    async fn rpop(&self, key: &str) -> RedisResult<Value> {
        self.raw_command(Command::new(&["RPOP", key])).await
    }

    async fn llen(&self, key: &str) -> RedisResult<Value> {
        self.raw_command(Command::new(&["LLEN", key])).await
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> RedisResult<Value> {
        self.raw_command(Command::new(&[
            "LRANGE",
            key,
            &start.to_string(),
            &stop.to_string(),
        ]))
        .await
    }

    async fn lrem(&self, key: &str, count: i64, value: &str) -> RedisResult<Value> {
        self.raw_command(Command::new(&["LREM", key, &count.to_string(), value]))
            .await
    }

    async fn sadd(&self, key: &str, members: &[&str]) -> RedisResult<Value> {
        self.raw_command(Command::variadic_key("SADD", key, members))
            .await
    }

    async fn srem(&self, key: &str, members: &[&str]) -> RedisResult<Value> {
        self.raw_command(Command::variadic_key("SREM", key, members))
            .await
    }

    async fn smembers(&self, key: &str) -> RedisResult<Value> {
        self.raw_command(Command::new(&["SMEMBERS", key])).await
    }

    async fn sismember(&self, key: &str, member: &str) -> RedisResult<Value> {
        self.raw_command(Command::new(&["SISMEMBER", key, member]))
            .await
    }

    async fn scard(&self, key: &str) -> RedisResult<Value> {
        self.raw_command(Command::new(&["SCARD", key])).await
    }

    async fn spop(&self, key: &str, count: Option<i64>) -> RedisResult<Value> {
        self.raw_command(Command::new(&spop_argv(key, count))).await
    }

    async fn srandmember(&self, key: &str) -> RedisResult<Value> {
        self.raw_command(Command::new(&["SRANDMEMBER", key])).await
    }

    async fn zadd(&self, key: &str, entries: &[(f64, &str)]) -> RedisResult<Value> {
        self.raw_command(Command::new(&zadd_argv(key, entries))).await
    }

    async fn zrem(&self, key: &str, members: &[&str]) -> RedisResult<Value> {
        self.raw_command(Command::variadic_key("ZREM", key, members))
            .await
    }

    async fn zrange(
        &self,
        key: &str,
        start: i64,
        stop: i64,
        with_scores: bool,
    ) -> RedisResult<Value> {
        self.raw_command(Command::new(&zrange_argv(key, start, stop, with_scores)))
            .await
    }

    async fn zscore(&self, key: &str, member: &str) -> RedisResult<Value> {
        self.raw_command(Command::new(&["ZSCORE", key, member])).await
    }

    async fn zcard(&self, key: &str) -> RedisResult<Value> {
        self.raw_command(Command::new(&["ZCARD", key])).await
    }

    async fn ping(&self) -> RedisResult<Value> {
        self.raw_command(Command::new(&["PING"])).await
    }

    async fn echo(&self, message: &str) -> RedisResult<Value> {
        self.raw_command(Command::new(&["ECHO", message])).await
    }

    async fn select(&self, db: u32) -> RedisResult<Value> {
        self.raw_command(Command::new(&["SELECT", &db.to_string()]))
            .await
    }

    async fn dbsize(&self) -> RedisResult<Value> {
        self.raw_command(Command::new(&["DBSIZE"])).await
    }

    async fn flushdb(&self) -> RedisResult<Value> {
        self.raw_command(Command::new(&["FLUSHDB"])).await
    }
}

impl Commands for Connection {
    async fn raw_command(&self, cmd: Command) -> RedisResult<Value> {
        self.send_raw(cmd).await
    }
}

impl Commands for Pool {
    async fn raw_command(&self, cmd: Command) -> RedisResult<Value> {
        Pool::raw_command(self, cmd).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::config::Options;
    use crate::resp::encode_command;
    use crate::testutil::{mock_server, Step};

    fn argv_of(cmd: &Command) -> Bytes {
        cmd.bytes.clone()
    }

    #[test]
    fn test_set_option_order() {
        let argv = set_argv(
            "k",
            "v",
            &SetOptions {
                ex: Some(10),
                px: Some(10_000),
                nx: true,
                xx: true,
            },
        );
        assert_eq!(argv, vec!["SET", "k", "v", "EX", "10", "PX", "10000", "NX", "XX"]);

        let argv = set_argv(
            "k",
            "v",
            &SetOptions {
                nx: true,
                ..SetOptions::default()
            },
        );
        assert_eq!(argv, vec!["SET", "k", "v", "NX"]);
    }

    #[test]
    fn test_incr_routing() {
        assert_eq!(incr_argv("k", None), vec!["INCR", "k"]);
        assert_eq!(incr_argv("k", Some(2.0)), vec!["INCRBY", "k", "2"]);
        assert_eq!(incr_argv("k", Some(0.5)), vec!["INCRBYFLOAT", "k", "0.5"]);
    }

    #[test]
    fn test_decr_routing_negates_fractional_delta() {
        assert_eq!(decr_argv("k", None), vec!["DECR", "k"]);
        assert_eq!(decr_argv("k", Some(2.0)), vec!["DECRBY", "k", "2"]);
        assert_eq!(decr_argv("k", Some(0.5)), vec!["INCRBYFLOAT", "k", "-0.5"]);
    }

    #[test]
    fn test_hincr_routing() {
        assert_eq!(hincr_argv("h", "f", 2.0), vec!["HINCRBY", "h", "f", "2"]);
        assert_eq!(
            hincr_argv("h", "f", 0.5),
            vec!["HINCRBYFLOAT", "h", "f", "0.5"]
        );
    }

    #[test]
    fn test_spop_omits_absent_count() {
        assert_eq!(spop_argv("s", None), vec!["SPOP", "s"]);
        assert_eq!(spop_argv("s", Some(2)), vec!["SPOP", "s", "2"]);
    }

    #[test]
    fn test_mset_flattens_pairs_in_order() {
        assert_eq!(
            mset_argv(&[("a", "1"), ("b", "2")]),
            vec!["MSET", "a", "1", "b", "2"]
        );
    }

    #[test]
    fn test_variadic_set_commands_spread_members() {
        let sadd = Command::variadic_key("SADD", "s", &["a", "b"]);
        assert_eq!(
            argv_of(&sadd),
            encode_command(&["SADD", "s", "a", "b"])
        );
        let srem = Command::variadic_key("SREM", "s", &["a", "b"]);
        assert_eq!(
            argv_of(&srem),
            encode_command(&["SREM", "s", "a", "b"])
        );
    }

    #[test]
    fn test_transaction_marks() {
        assert_eq!(Command::new(&["MULTI"]).txn, TxnMark::Multi);
        assert_eq!(Command::new(&["exec"]).txn, TxnMark::Exec);
        assert_eq!(Command::new(&["Discard"]).txn, TxnMark::Discard);
        assert_eq!(Command::new(&["GET", "k"]).txn, TxnMark::None);
    }

    #[test]
    fn test_hgetall_requests_map_fold() {
        assert!(Command::new(&["HGETALL", "h"]).expects_map().expects_map);
        assert!(!Command::new(&["HGETALL", "h"]).expects_map);
    }

    fn no_reconnect() -> Options {
        Options {
            reconnect_after: None,
            ..Options::default()
        }
    }

    #[tokio::test]
    async fn test_string_command_scenario() {
        let addr = mock_server(vec![vec![
            Step::new(&encode_command(&["SET", "k", "v"]), b"+OK\r\n"),
            Step::new(&encode_command(&["GET", "k"]), b"$1\r\nv\r\n"),
            Step::new(&encode_command(&["DEL", "k"]), b":1\r\n"),
            Step::new(&encode_command(&["EXISTS", "k"]), b":0\r\n"),
        ]])
        .await;
        let conn = crate::Connection::spawn(
            addr.ip().to_string(),
            addr.port(),
            no_reconnect(),
            None,
        );
        assert_eq!(
            conn.set("k", "v").await.unwrap(),
            Value::Simple("OK".into())
        );
        assert_eq!(
            conn.get("k").await.unwrap(),
            Value::Bulk(Some("v".into()))
        );
        assert_eq!(conn.del(&["k"]).await.unwrap(), Value::Int(1));
        assert_eq!(conn.exists("k").await.unwrap(), Value::Int(0));
        conn.disconnect().await;
    }

    #[tokio::test]
    async fn test_hash_command_scenario() {
        let addr = mock_server(vec![vec![
            Step::new(&encode_command(&["HSET", "h", "f", "1"]), b":1\r\n"),
            Step::new(&encode_command(&["HINCRBY", "h", "f", "2"]), b":3\r\n"),
            Step::new(
                &encode_command(&["HINCRBYFLOAT", "h", "f", "0.5"]),
                b"$3\r\n3.5\r\n",
            ),
            Step::new(
                &encode_command(&["HGETALL", "h"]),
                b"*2\r\n$1\r\nf\r\n$3\r\n3.5\r\n",
            ),
        ]])
        .await;
        let conn = crate::Connection::spawn(
            addr.ip().to_string(),
            addr.port(),
            no_reconnect(),
            None,
        );
        assert_eq!(conn.hset("h", "f", "1").await.unwrap(), Value::Int(1));
        assert_eq!(conn.hincr_by("h", "f", 2.0).await.unwrap(), Value::Int(3));
        assert_eq!(
            conn.hincr_by("h", "f", 0.5).await.unwrap(),
            Value::Bulk(Some("3.5".into()))
        );
        let mut expected = HashMap::new();
        expected.insert("f".to_string(), "3.5".to_string());
        assert_eq!(conn.hgetall("h").await.unwrap(), Value::Map(expected));
        conn.disconnect().await;
    }
}
