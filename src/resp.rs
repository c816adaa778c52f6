use std::collections::HashMap;

use async_recursion::async_recursion;
use bytes::{BufMut, Bytes, BytesMut};
use nom::{
    character::complete::{char, digit1},
    combinator::{map_res, opt},
    sequence::tuple,
    IResult,
};
use tokio::io::AsyncRead;

use crate::framer::LineFramer;
use crate::{Error, RedisResult};

pub(crate) const CRLF: &[u8] = b"\r\n";

/// A single RESP reply value.
///
/// `Bulk(None)` and `Array(None)` are the wire-level nulls (`$-1` / `*-1`),
/// distinct from the empty bulk string and the empty array. `Map` never
/// appears on the wire; it is produced by folding an even-length array
/// reply when the command asked for it (HGETALL and friends).
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Simple(String),
    Error(String),
    Int(i64),
    Bulk(Option<String>),
    Array(Option<Vec<Value>>),
    Map(HashMap<String, String>),
}

impl Value {
    /// Text content of a simple or bulk string reply.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Simple(s) => Some(s),
            Value::Bulk(Some(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Bulk(None) | Value::Array(None))
    }

    // Map keys and values are always bulk strings in practice; integers
    // are accepted since servers may answer them for some commands.
    fn into_text(self) -> RedisResult<String> {
        match self {
            Value::Simple(s) => Ok(s),
            Value::Bulk(Some(s)) => Ok(s),
            Value::Int(i) => Ok(i.to_string()),
            _ => Err(Error::protocol("cannot convert to map")),
        }
    }
}

/// Serializes an argv into the RESP array-of-bulk-strings request form.
pub fn encode_command<S: AsRef<str>>(argv: &[S]) -> Bytes {
    let mut buf = BytesMut::with_capacity(16 + argv.iter().map(|a| a.as_ref().len() + 16).sum::<usize>());
    buf.put_u8(b'*');
    buf.put_slice(argv.len().to_string().as_bytes());
    buf.put_slice(CRLF);
    for arg in argv {
        let arg = arg.as_ref().as_bytes();
        buf.put_u8(b'$');
        buf.put_slice(arg.len().to_string().as_bytes());
        buf.put_slice(CRLF);
        buf.put_slice(arg);
        buf.put_slice(CRLF);
    }
    buf.freeze()
}

fn read_positive_decimal(bytes: &[u8]) -> IResult<&[u8], u64> {
    map_res(digit1, |digits: &[u8]| {
        std::str::from_utf8(digits)
            .map_err(|_| ())
            .and_then(|s| s.parse::<u64>().map_err(|_| ()))
    })(bytes)
}

fn read_decimal(bytes: &[u8]) -> IResult<&[u8], i64> {
    let (rem, (minus, int)) = tuple((opt(char('-')), read_positive_decimal))(bytes)?;
    Ok((
        rem,
        if minus.is_some() {
            -(int as i64)
        } else {
            int as i64
        },
    ))
}

/// Parses the numeric tail of a header line (`$<n>`, `*<n>`, `:<n>`).
fn parse_int(bytes: &[u8]) -> RedisResult<i64> {
    match read_decimal(bytes) {
        Ok((rem, n)) if rem.is_empty() => Ok(n),
        _ => Err(Error::protocol("protocol error")),
    }
}

fn text(bytes: &[u8]) -> RedisResult<String> {
    String::from_utf8(bytes.to_vec()).map_err(|_| Error::protocol("invalid utf-8 in reply"))
}

/// Reads exactly one RESP value from the framer. Recurses for arrays;
/// `fold_map` applies only to the array read at this level, never to
/// nested children.
#[async_recursion]
pub(crate) async fn read_value<R>(framer: &mut LineFramer<R>, fold_map: bool) -> RedisResult<Value>
where
    R: AsyncRead + Unpin + Send,
{
    let line = framer.read_line().await?;
    if line.is_empty() {
        return Err(Error::protocol("protocol error"));
    }
    let rest = &line[1..];
    match line[0] {
        b'+' => Ok(Value::Simple(text(rest)?)),
        b'-' => Ok(Value::Error(text(rest)?)),
        b':' => Ok(Value::Int(parse_int(rest)?)),
        b'$' => read_bulk(framer, parse_int(rest)?).await,
        b'*' => {
            let len = parse_int(rest)?;
            if len == -1 {
                return Ok(Value::Array(None));
            }
            if len < -1 {
                return Err(Error::protocol("protocol error"));
            }
            let mut items = Vec::with_capacity(len as usize);
            for _ in 0..len {
                items.push(read_value(framer, false).await?);
            }
            if fold_map {
                fold_into_map(items)
            } else {
                Ok(Value::Array(Some(items)))
            }
        }
        _ => Err(Error::protocol("protocol error")),
    }
}

/// Absorbs raw lines (CRLF included) until `len` payload bytes have been
/// collected, truncating the final partial line to the residual count.
async fn read_bulk<R>(framer: &mut LineFramer<R>, len: i64) -> RedisResult<Value>
where
    R: AsyncRead + Unpin + Send,
{
    if len == -1 {
        return Ok(Value::Bulk(None));
    }
    if len < -1 {
        return Err(Error::protocol("protocol error"));
    }
    if len == 0 {
        framer.read_raw_line().await?;
        return Ok(Value::Bulk(Some(String::new())));
    }
    let want = len as usize;
    let mut data = BytesMut::with_capacity(want);
    let mut truncated = false;
    while data.len() < want {
        let line = framer.read_raw_line().await?;
        let need = want - data.len();
        if line.len() > need {
            data.put_slice(&line[..need]);
            truncated = true;
        } else {
            data.put_slice(&line);
        }
    }
    if !truncated {
        // The payload ended exactly on a CRLF boundary, so the bulk
        // terminator is still on the wire as one more line.
        framer.read_raw_line().await?;
    }
    Ok(Value::Bulk(Some(text(&data)?)))
}

fn fold_into_map(items: Vec<Value>) -> RedisResult<Value> {
    if items.len() % 2 != 0 {
        return Err(Error::protocol("cannot convert to map"));
    }
    let mut map = HashMap::with_capacity(items.len() / 2);
    let mut iter = items.into_iter();
    while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
        map.insert(key.into_text()?, value.into_text()?);
    }
    Ok(Value::Map(map))
}
