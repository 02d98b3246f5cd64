//! Just enough of the Redis serialization protocol (RESP2) to talk to
//! checkpoint replicas.
//!
//! Commands are packed and replies parsed by the [`redis`] crate.  A
//! connection reads into a [`BytesMut`]; [`decode`] waits until the buffer
//! holds a whole reply before handing it to the parser, and keeps the
//! remainder for later.

use crate::error::StoreError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use redis::Value;

/// A decoded reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    Status(String),
    Error(String),
    Integer(i64),
    /// `None` is the nil bulk string.
    Bulk(Option<Bytes>),
    /// `None` is the nil array.
    Array(Option<Vec<Reply>>),
}

impl Reply {
    /// Whether the reply acknowledges a write command.
    ///
    /// `HSET`/`HDEL` answer with an integer, `HMSET` and `AUTH` with a
    /// status.
    pub fn is_ack(&self) -> bool {
        matches!(self, Reply::Status(_) | Reply::Integer(_))
    }

    pub fn ok() -> Self {
        Reply::Status("OK".to_string())
    }

    /// Serializes the reply.  Replicas do this; the client only decodes.
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Reply::Status(s) => {
                buf.put_u8(b'+');
                buf.put_slice(s.as_bytes());
                buf.put_slice(b"\r\n");
            }
            Reply::Error(s) => {
                buf.put_u8(b'-');
                buf.put_slice(s.as_bytes());
                buf.put_slice(b"\r\n");
            }
            Reply::Integer(n) => {
                buf.put_slice(format!(":{n}\r\n").as_bytes());
            }
            Reply::Bulk(None) => buf.put_slice(b"$-1\r\n"),
            Reply::Bulk(Some(data)) => {
                buf.put_slice(format!("${}\r\n", data.len()).as_bytes());
                buf.put_slice(data);
                buf.put_slice(b"\r\n");
            }
            Reply::Array(None) => buf.put_slice(b"*-1\r\n"),
            Reply::Array(Some(items)) => {
                buf.put_slice(format!("*{}\r\n", items.len()).as_bytes());
                for item in items {
                    item.encode(buf);
                }
            }
        }
    }

    /// Interprets an array of bulk strings as a command line, which is how
    /// clients send commands.
    pub fn into_command_line(self) -> Option<Vec<Bytes>> {
        match self {
            Reply::Array(Some(items)) => items
                .into_iter()
                .map(|item| match item {
                    Reply::Bulk(Some(arg)) => Some(arg),
                    _ => None,
                })
                .collect(),
            _ => None,
        }
    }
}

/// Decodes one reply from the front of `buf`.
///
/// Returns `Ok(None)` if `buf` does not yet hold a complete reply, in which
/// case `buf` is left untouched.  Complete frames are parsed by
/// [`redis::parse_redis_value`].
pub fn decode(buf: &mut BytesMut) -> Result<Option<Reply>, StoreError> {
    let Some(len) = frame_len(buf, 0)? else {
        return Ok(None);
    };
    let value = redis::parse_redis_value(&buf[..len])
        .map_err(|error| StoreError::Protocol(error.to_string()))?;
    buf.advance(len);
    Reply::try_from(value).map(Some)
}

impl TryFrom<Value> for Reply {
    type Error = StoreError;

    fn try_from(value: Value) -> Result<Self, StoreError> {
        Ok(match value {
            Value::Okay => Reply::ok(),
            Value::SimpleString(status) => Reply::Status(status),
            Value::Int(n) => Reply::Integer(n),
            Value::BulkString(data) => Reply::Bulk(Some(Bytes::from(data))),
            // RESP2 nil bulk strings and nil arrays parse to the same value.
            Value::Nil => Reply::Bulk(None),
            Value::Array(items) => Reply::Array(Some(
                items
                    .into_iter()
                    .map(Reply::try_from)
                    .collect::<Result<_, _>>()?,
            )),
            Value::ServerError(error) => Reply::Error(match error.details() {
                Some(details) => format!("{} {details}", error.code()),
                None => error.code().to_string(),
            }),
            other => {
                return Err(StoreError::Protocol(format!(
                    "unsupported reply {other:?}"
                )))
            }
        })
    }
}

/// Length of the RESP2 frame starting at `pos`, or `None` if `buf` ends
/// before the frame does.  Only headers are inspected.
fn frame_len(buf: &[u8], pos: usize) -> Result<Option<usize>, StoreError> {
    let Some((line, next)) = read_line(buf, pos) else {
        return Ok(None);
    };
    let Some((&tag, rest)) = line.split_first() else {
        return Err(StoreError::Protocol("empty reply line".to_string()));
    };

    match tag {
        b'+' | b'-' | b':' => Ok(Some(next)),
        b'$' => {
            let len = to_integer(rest)?;
            if len < 0 {
                return Ok(Some(next));
            }
            let end = next + len as usize + 2;
            Ok((buf.len() >= end).then_some(end))
        }
        b'*' => {
            let len = to_integer(rest)?;
            let mut pos = next;
            for _ in 0..len.max(0) {
                match frame_len(buf, pos)? {
                    Some(after) => pos = after,
                    None => return Ok(None),
                }
            }
            Ok(Some(pos))
        }
        other => Err(StoreError::Protocol(format!(
            "unexpected reply type byte 0x{other:02x}"
        ))),
    }
}

fn read_line(buf: &[u8], pos: usize) -> Option<(&[u8], usize)> {
    let rest = buf.get(pos..)?;
    let end = rest.windows(2).position(|w| w == b"\r\n")?;
    Some((&rest[..end], pos + end + 2))
}

fn to_integer(bytes: &[u8]) -> Result<i64, StoreError> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|line| line.parse().ok())
        .ok_or_else(|| StoreError::Protocol("malformed length in reply".to_string()))
}

/// A store command addressed to one replica.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Command {
    name: &'static str,
    args: Vec<Bytes>,
}

impl Command {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            args: Vec::new(),
        }
    }

    fn arg(mut self, arg: impl Into<Bytes>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn hset(hash: &str, field: &str, value: Bytes) -> Self {
        Self::new("HSET")
            .arg(Bytes::copy_from_slice(hash.as_bytes()))
            .arg(Bytes::copy_from_slice(field.as_bytes()))
            .arg(value)
    }

    pub fn hdel(hash: &str, field: &str) -> Self {
        Self::new("HDEL")
            .arg(Bytes::copy_from_slice(hash.as_bytes()))
            .arg(Bytes::copy_from_slice(field.as_bytes()))
    }

    pub fn hmset<'a>(hash: &str, entries: impl IntoIterator<Item = (&'a str, Bytes)>) -> Self {
        entries.into_iter().fold(
            Self::new("HMSET").arg(Bytes::copy_from_slice(hash.as_bytes())),
            |command, (field, value)| {
                command
                    .arg(Bytes::copy_from_slice(field.as_bytes()))
                    .arg(value)
            },
        )
    }

    pub fn hget(hash: &str, field: &str) -> Self {
        Self::new("HGET")
            .arg(Bytes::copy_from_slice(hash.as_bytes()))
            .arg(Bytes::copy_from_slice(field.as_bytes()))
    }

    pub fn auth(password: &str) -> Self {
        Self::new("AUTH").arg(Bytes::copy_from_slice(password.as_bytes()))
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    /// Appends the wire form of the command to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        let mut cmd = redis::cmd(self.name);
        for arg in self.args.iter() {
            cmd.arg(&arg[..]);
        }
        buf.put_slice(&cmd.get_packed_command());
    }
}

#[cfg(test)]
mod test {
    use super::{decode, Command, Reply};
    use bytes::{Bytes, BytesMut};
    use pretty_assertions::assert_eq;

    #[test]
    fn packed_command_is_an_array_of_bulk_strings() {
        let mut buf = BytesMut::new();
        Command::hset("Dckpt", "k", Bytes::from_static(b"v\r\n")).encode(&mut buf);
        assert_eq!(
            &buf[..],
            b"*4\r\n$4\r\nHSET\r\n$5\r\nDckpt\r\n$1\r\nk\r\n$3\r\nv\r\n\r\n"
        );

        let line = decode(&mut buf).unwrap().unwrap().into_command_line().unwrap();
        assert_eq!(line.len(), 4);
        assert_eq!(&line[3][..], b"v\r\n");
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_replies_wait_for_more_input() {
        let mut buf = BytesMut::from(&b"$5\r\nhel"[..]);
        assert_eq!(decode(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 7);

        buf.extend_from_slice(b"lo\r\n:3\r\n");
        assert_eq!(
            decode(&mut buf).unwrap(),
            Some(Reply::Bulk(Some(Bytes::from_static(b"hello"))))
        );
        assert_eq!(decode(&mut buf).unwrap(), Some(Reply::Integer(3)));
        assert_eq!(decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn reply_kinds() {
        let replies = vec![
            Reply::ok(),
            Reply::Error("ERR wrong".to_string()),
            Reply::Integer(-2),
            Reply::Bulk(None),
            Reply::Array(Some(vec![Reply::Integer(1), Reply::Bulk(None)])),
        ];
        let mut buf = BytesMut::new();
        for reply in replies.iter() {
            reply.encode(&mut buf);
        }
        for reply in replies.iter() {
            assert_eq!(decode(&mut buf).unwrap().as_ref(), Some(reply));
        }
        assert!(Reply::ok().is_ack());
        assert!(Reply::Integer(0).is_ack());
        assert!(!Reply::Error(String::new()).is_ack());
        assert!(!Reply::Bulk(None).is_ack());
    }

    #[test]
    fn nested_arrays_wait_for_their_last_element() {
        let mut buf = BytesMut::from(&b"*2\r\n*1\r\n:1\r\n$3\r\nab"[..]);
        assert_eq!(decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"c\r\n*-1\r\n");
        assert_eq!(
            decode(&mut buf).unwrap(),
            Some(Reply::Array(Some(vec![
                Reply::Array(Some(vec![Reply::Integer(1)])),
                Reply::Bulk(Some(Bytes::from_static(b"abc"))),
            ])))
        );
        // A nil array reads as a nil value.
        assert_eq!(decode(&mut buf).unwrap(), Some(Reply::Bulk(None)));
        assert!(buf.is_empty());
    }

    #[test]
    fn server_errors_keep_code_and_message() {
        let mut buf = BytesMut::new();
        Reply::Error("NOAUTH Authentication required.".to_string()).encode(&mut buf);
        Reply::Error("ERR unknown command 'X'".to_string()).encode(&mut buf);
        assert_eq!(
            decode(&mut buf).unwrap(),
            Some(Reply::Error("NOAUTH Authentication required.".to_string()))
        );
        assert_eq!(
            decode(&mut buf).unwrap(),
            Some(Reply::Error("ERR unknown command 'X'".to_string()))
        );
    }

    #[test]
    fn garbage_is_a_protocol_error() {
        let mut buf = BytesMut::from(&b"?what\r\n"[..]);
        assert!(decode(&mut buf).is_err());
    }
}
