//! Control markers that travel inline with the tuple stream.

use bytes::{Buf, BufMut};
use cregion_types::{ResetAttempt, SequenceId};
use serde::Serialize;
use std::fmt::{self, Display};
use thiserror::Error;

/// A control marker.
///
/// Every upstream connection of an input port carries one copy of each
/// logical marker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum Marker {
    /// The upstream connection will not produce any more tuples.
    Final,
    /// No more tuples of cycle `seq` follow on this connection.
    Drain { seq: SequenceId },
    /// Roll back to the state checkpointed for `seq`.
    Reset {
        seq: SequenceId,
        attempt: ResetAttempt,
    },
    /// Processing continues with cycle `seq`; checkpoint `retired` is no
    /// longer needed.
    Resume {
        seq: SequenceId,
        retired: SequenceId,
    },
    /// Event-time progress.
    Watermark { timestamp: i64 },
}

/// The kind of a [`Marker`], without its payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum MarkerKind {
    Final,
    Drain,
    Reset,
    Resume,
    Watermark,
}

impl MarkerKind {
    const fn tag(self) -> u8 {
        match self {
            MarkerKind::Final => 0,
            MarkerKind::Drain => 1,
            MarkerKind::Reset => 2,
            MarkerKind::Resume => 3,
            MarkerKind::Watermark => 4,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(MarkerKind::Final),
            1 => Some(MarkerKind::Drain),
            2 => Some(MarkerKind::Reset),
            3 => Some(MarkerKind::Resume),
            4 => Some(MarkerKind::Watermark),
            _ => None,
        }
    }
}

impl Display for MarkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MarkerKind::Final => "Final",
            MarkerKind::Drain => "Drain",
            MarkerKind::Reset => "Reset",
            MarkerKind::Resume => "Resume",
            MarkerKind::Watermark => "Watermark",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize)]
pub enum DecodeError {
    #[error("empty marker")]
    Empty,

    #[error("unknown marker tag {0}")]
    UnknownTag(u8),

    #[error("{kind} marker needs {expected} payload bytes but has {actual}")]
    Truncated {
        kind: MarkerKind,
        expected: usize,
        actual: usize,
    },

    #[error("{0} trailing bytes after marker")]
    TrailingBytes(usize),
}

impl Marker {
    pub fn kind(&self) -> MarkerKind {
        match self {
            Marker::Final => MarkerKind::Final,
            Marker::Drain { .. } => MarkerKind::Drain,
            Marker::Reset { .. } => MarkerKind::Reset,
            Marker::Resume { .. } => MarkerKind::Resume,
            Marker::Watermark { .. } => MarkerKind::Watermark,
        }
    }

    /// The sequence id carried by the marker, if any.
    pub fn seq(&self) -> Option<SequenceId> {
        match self {
            Marker::Drain { seq } | Marker::Reset { seq, .. } | Marker::Resume { seq, .. } => {
                Some(*seq)
            }
            Marker::Final | Marker::Watermark { .. } => None,
        }
    }

    fn payload_len(kind: MarkerKind) -> usize {
        match kind {
            MarkerKind::Final => 0,
            MarkerKind::Drain | MarkerKind::Watermark => 8,
            MarkerKind::Reset => 12,
            MarkerKind::Resume => 16,
        }
    }

    /// Appends the wire form: a one-byte kind tag followed by the payload
    /// fields in big-endian order.
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.kind().tag());
        match *self {
            Marker::Final => {}
            Marker::Drain { seq } => buf.put_i64(seq),
            Marker::Reset { seq, attempt } => {
                buf.put_i64(seq);
                buf.put_i32(attempt);
            }
            Marker::Resume { seq, retired } => {
                buf.put_i64(seq);
                buf.put_i64(retired);
            }
            Marker::Watermark { timestamp } => buf.put_i64(timestamp),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + Self::payload_len(self.kind()));
        self.encode(&mut buf);
        buf
    }

    /// Decodes a marker that occupies all of `buf`.
    pub fn decode(mut buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.is_empty() {
            return Err(DecodeError::Empty);
        }
        let tag = buf.get_u8();
        let kind = MarkerKind::from_tag(tag).ok_or(DecodeError::UnknownTag(tag))?;
        let expected = Self::payload_len(kind);
        if buf.len() < expected {
            return Err(DecodeError::Truncated {
                kind,
                expected,
                actual: buf.len(),
            });
        }
        if buf.len() > expected {
            return Err(DecodeError::TrailingBytes(buf.len() - expected));
        }

        Ok(match kind {
            MarkerKind::Final => Marker::Final,
            MarkerKind::Drain => Marker::Drain { seq: buf.get_i64() },
            MarkerKind::Reset => Marker::Reset {
                seq: buf.get_i64(),
                attempt: buf.get_i32(),
            },
            MarkerKind::Resume => Marker::Resume {
                seq: buf.get_i64(),
                retired: buf.get_i64(),
            },
            MarkerKind::Watermark => Marker::Watermark {
                timestamp: buf.get_i64(),
            },
        })
    }
}

impl Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Marker::Final => write!(f, "Final"),
            Marker::Drain { seq } => write!(f, "Drain({seq})"),
            Marker::Reset { seq, attempt } => write!(f, "Reset({seq}, attempt {attempt})"),
            Marker::Resume { seq, retired } => write!(f, "Resume({seq}, retired {retired})"),
            Marker::Watermark { timestamp } => write!(f, "Watermark({timestamp})"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::{DecodeError, Marker, MarkerKind};
    use pretty_assertions::assert_eq;

    #[test]
    fn wire_layout() {
        assert_eq!(Marker::Final.to_bytes(), vec![0]);
        assert_eq!(
            Marker::Reset {
                seq: 7,
                attempt: 1
            }
            .to_bytes(),
            vec![2, 0, 0, 0, 0, 0, 0, 0, 7, 0, 0, 0, 1]
        );
        assert_eq!(
            Marker::decode(&[3, 0, 0, 0, 0, 0, 0, 0, 9, 0, 0, 0, 0, 0, 0, 0, 8]).unwrap(),
            Marker::Resume { seq: 9, retired: 8 }
        );
        assert_eq!(
            Marker::decode(&Marker::Watermark { timestamp: -5 }.to_bytes()).unwrap(),
            Marker::Watermark { timestamp: -5 }
        );
    }

    #[test]
    fn malformed_markers() {
        assert_eq!(Marker::decode(&[]), Err(DecodeError::Empty));
        assert_eq!(Marker::decode(&[9]), Err(DecodeError::UnknownTag(9)));
        assert_eq!(
            Marker::decode(&[1, 0, 0]),
            Err(DecodeError::Truncated {
                kind: MarkerKind::Drain,
                expected: 8,
                actual: 2
            })
        );
        assert_eq!(Marker::decode(&[0, 1]), Err(DecodeError::TrailingBytes(1)));
    }
}
