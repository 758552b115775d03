//! Wire-protocol parser.
//!
//! A resumable byte-level state machine fed arbitrary slices straight from
//! socket reads. One byte of dispatch at a time makes the parser immune to
//! TCP fragmentation: an operation may arrive split at any point — inside
//! the verb, the arguments, or the payload — and parsing resumes exactly
//! where it stopped. Emitted operations own their bytes, so callers are
//! free to reuse the read buffer.
//!
//! Fast path: arguments wholly inside one slice are borrowed until the
//! terminator and copied once on emit. Slow path: a partial argument at
//! the end of a feed is carried over in an overflow buffer owned by the
//! parser.

use bytes::{Bytes, BytesMut};
use smallvec::SmallVec;
use thiserror::Error;

/// Field budget for any single control line.
const MAX_ARGS: usize = 3;

/// Parser errors.
///
/// Any of these terminates the connection; `wire_reason` gives the text
/// sent to the client first.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("unknown protocol operation at byte {0:#04x}")]
    UnknownOp(u8),

    #[error("malformed {0} arguments")]
    BadArgs(&'static str),

    #[error("bad or missing message size")]
    BadSize,

    #[error("maximum payload exceeded: {size} bytes (max: {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("expected CRLF after message payload")]
    MissingTerminator,
}

impl ParseError {
    /// The `-ERR` reason wired back to the client before closing.
    #[must_use]
    pub const fn wire_reason(&self) -> &'static str {
        match self {
            Self::PayloadTooLarge { .. } => "Maximum Payload Exceeded",
            _ => "Parser Error",
        }
    }
}

/// A complete protocol operation with owned arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    /// `CONNECT <json>` — the raw options object text
    Connect(Bytes),
    /// `PUB <subject> [reply] <size>\r\n<payload>\r\n`
    Pub(PubOp),
    /// `SUB <subject> [queue] <sid>`
    Sub {
        subject: Bytes,
        queue: Option<Bytes>,
        sid: Bytes,
    },
    /// `UNSUB <sid> [max]`
    Unsub { sid: Bytes, max: Option<usize> },
    Ping,
    Pong,
}

/// Arguments and payload of a publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubOp {
    pub subject: Bytes,
    pub reply: Option<Bytes>,
    /// Raw size field, reused verbatim when building `MSG` headers.
    pub szb: Bytes,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    OpStart,
    OpC,
    OpCo,
    OpCon,
    OpConn,
    OpConne,
    OpConnec,
    OpConnect,
    ConnectSpc,
    ConnectArg,
    ConnectArgEnd,
    OpP,
    OpPu,
    OpPub,
    PubSpc,
    PubArg,
    PubArgEnd,
    MsgPayload,
    MsgEndCr,
    MsgEndLf,
    OpS,
    OpSu,
    OpSub,
    SubSpc,
    SubArg,
    SubArgEnd,
    OpU,
    OpUn,
    OpUns,
    OpUnsu,
    OpUnsub,
    UnsubSpc,
    UnsubArg,
    UnsubArgEnd,
    OpPi,
    OpPin,
    OpPing,
    OpPingEnd,
    OpPo,
    OpPon,
    OpPong,
    OpPongEnd,
}

#[derive(Debug, Default)]
struct PubState {
    subject: Bytes,
    reply: Option<Bytes>,
    szb: Bytes,
    size: usize,
}

/// Resumable protocol parser. One per session; state survives across
/// arbitrarily fragmented reads.
#[derive(Debug)]
pub struct Parser {
    state: State,
    /// Start of the in-progress argument within the current slice.
    arg_start: usize,
    /// Trailing CR bytes to strip when the argument terminates.
    drop: usize,
    /// Overflow for an argument split across feeds.
    arg_buf: Option<BytesMut>,
    /// Payload accumulator for the publish being captured.
    msg_buf: Option<BytesMut>,
    pa: PubState,
    max_payload: usize,
}

impl Parser {
    #[must_use]
    pub fn new(max_payload: usize) -> Self {
        Self {
            state: State::OpStart,
            arg_start: 0,
            drop: 0,
            arg_buf: None,
            msg_buf: None,
            pa: PubState::default(),
            max_payload,
        }
    }

    /// Feed one slice of inbound bytes, appending completed operations to
    /// `out`. Partial state at the end of the slice is preserved for the
    /// next call; no particular chunking is ever required.
    pub fn parse(&mut self, buf: &[u8], out: &mut Vec<Op>) -> Result<(), ParseError> {
        let mut i = 0usize;
        while i < buf.len() {
            let b = buf[i];
            match self.state {
                State::OpStart => match b {
                    b'C' | b'c' => self.state = State::OpC,
                    b'P' | b'p' => self.state = State::OpP,
                    b'S' | b's' => self.state = State::OpS,
                    b'U' | b'u' => self.state = State::OpU,
                    _ => return Err(ParseError::UnknownOp(b)),
                },

                // CONNECT
                State::OpC => match b {
                    b'O' | b'o' => self.state = State::OpCo,
                    _ => return Err(ParseError::UnknownOp(b)),
                },
                State::OpCo => match b {
                    b'N' | b'n' => self.state = State::OpCon,
                    _ => return Err(ParseError::UnknownOp(b)),
                },
                State::OpCon => match b {
                    b'N' | b'n' => self.state = State::OpConn,
                    _ => return Err(ParseError::UnknownOp(b)),
                },
                State::OpConn => match b {
                    b'E' | b'e' => self.state = State::OpConne,
                    _ => return Err(ParseError::UnknownOp(b)),
                },
                State::OpConne => match b {
                    b'C' | b'c' => self.state = State::OpConnec,
                    _ => return Err(ParseError::UnknownOp(b)),
                },
                State::OpConnec => match b {
                    b'T' | b't' => self.state = State::OpConnect,
                    _ => return Err(ParseError::UnknownOp(b)),
                },
                State::OpConnect => match b {
                    b' ' | b'\t' => self.state = State::ConnectSpc,
                    _ => return Err(ParseError::UnknownOp(b)),
                },
                State::ConnectSpc => match b {
                    b' ' | b'\t' => {}
                    _ => {
                        self.state = State::ConnectArg;
                        self.arg_start = i;
                    }
                },
                State::ConnectArg => match b {
                    b'\r' => {
                        self.drop = 1;
                        self.state = State::ConnectArgEnd;
                    }
                    b'\n' => {
                        let arg = self.take_arg(buf, i);
                        out.push(Op::Connect(arg));
                        self.op_done(i);
                    }
                    _ => {
                        if let Some(ab) = self.arg_buf.as_mut() {
                            ab.extend_from_slice(&[b]);
                        }
                    }
                },
                State::ConnectArgEnd => match b {
                    b'\n' => {
                        let arg = self.take_arg(buf, i);
                        out.push(Op::Connect(arg));
                        self.op_done(i);
                    }
                    _ => return Err(ParseError::BadArgs("CONNECT")),
                },

                // PUB / PING / PONG share the leading P
                State::OpP => match b {
                    b'U' | b'u' => self.state = State::OpPu,
                    b'I' | b'i' => self.state = State::OpPi,
                    b'O' | b'o' => self.state = State::OpPo,
                    _ => return Err(ParseError::UnknownOp(b)),
                },
                State::OpPu => match b {
                    b'B' | b'b' => self.state = State::OpPub,
                    _ => return Err(ParseError::UnknownOp(b)),
                },
                State::OpPub => match b {
                    b' ' | b'\t' => self.state = State::PubSpc,
                    _ => return Err(ParseError::UnknownOp(b)),
                },
                State::PubSpc => match b {
                    b' ' | b'\t' => {}
                    _ => {
                        self.state = State::PubArg;
                        self.arg_start = i;
                    }
                },
                State::PubArg => match b {
                    b'\r' => {
                        self.drop = 1;
                        self.state = State::PubArgEnd;
                    }
                    b'\n' => {
                        let arg = self.take_arg(buf, i);
                        self.start_payload(&arg)?;
                        self.drop = 0;
                        self.arg_start = i + 1;
                    }
                    _ => {
                        if let Some(ab) = self.arg_buf.as_mut() {
                            ab.extend_from_slice(&[b]);
                        }
                    }
                },
                State::PubArgEnd => match b {
                    b'\n' => {
                        let arg = self.take_arg(buf, i);
                        self.start_payload(&arg)?;
                        self.drop = 0;
                        self.arg_start = i + 1;
                    }
                    _ => return Err(ParseError::BadArgs("PUB")),
                },
                State::MsgPayload => {
                    let mb = self
                        .msg_buf
                        .as_mut()
                        .expect("payload buffer exists while capturing");
                    let need = self.pa.size - mb.len();
                    let take = need.min(buf.len() - i);
                    mb.extend_from_slice(&buf[i..i + take]);
                    i += take;
                    if mb.len() >= self.pa.size {
                        self.state = State::MsgEndCr;
                    }
                    continue;
                }
                State::MsgEndCr => match b {
                    b'\r' => self.state = State::MsgEndLf,
                    _ => return Err(ParseError::MissingTerminator),
                },
                State::MsgEndLf => match b {
                    b'\n' => {
                        let payload = self
                            .msg_buf
                            .take()
                            .expect("payload buffer exists until emit")
                            .freeze();
                        let pa = std::mem::take(&mut self.pa);
                        out.push(Op::Pub(PubOp {
                            subject: pa.subject,
                            reply: pa.reply,
                            szb: pa.szb,
                            payload,
                        }));
                        self.op_done(i);
                    }
                    _ => return Err(ParseError::MissingTerminator),
                },

                // SUB
                State::OpS => match b {
                    b'U' | b'u' => self.state = State::OpSu,
                    _ => return Err(ParseError::UnknownOp(b)),
                },
                State::OpSu => match b {
                    b'B' | b'b' => self.state = State::OpSub,
                    _ => return Err(ParseError::UnknownOp(b)),
                },
                State::OpSub => match b {
                    b' ' | b'\t' => self.state = State::SubSpc,
                    _ => return Err(ParseError::UnknownOp(b)),
                },
                State::SubSpc => match b {
                    b' ' | b'\t' => {}
                    _ => {
                        self.state = State::SubArg;
                        self.arg_start = i;
                    }
                },
                State::SubArg => match b {
                    b'\r' => {
                        self.drop = 1;
                        self.state = State::SubArgEnd;
                    }
                    b'\n' => {
                        let arg = self.take_arg(buf, i);
                        out.push(parse_sub(&arg)?);
                        self.op_done(i);
                    }
                    _ => {
                        if let Some(ab) = self.arg_buf.as_mut() {
                            ab.extend_from_slice(&[b]);
                        }
                    }
                },
                State::SubArgEnd => match b {
                    b'\n' => {
                        let arg = self.take_arg(buf, i);
                        out.push(parse_sub(&arg)?);
                        self.op_done(i);
                    }
                    _ => return Err(ParseError::BadArgs("SUB")),
                },

                // UNSUB
                State::OpU => match b {
                    b'N' | b'n' => self.state = State::OpUn,
                    _ => return Err(ParseError::UnknownOp(b)),
                },
                State::OpUn => match b {
                    b'S' | b's' => self.state = State::OpUns,
                    _ => return Err(ParseError::UnknownOp(b)),
                },
                State::OpUns => match b {
                    b'U' | b'u' => self.state = State::OpUnsu,
                    _ => return Err(ParseError::UnknownOp(b)),
                },
                State::OpUnsu => match b {
                    b'B' | b'b' => self.state = State::OpUnsub,
                    _ => return Err(ParseError::UnknownOp(b)),
                },
                State::OpUnsub => match b {
                    b' ' | b'\t' => self.state = State::UnsubSpc,
                    _ => return Err(ParseError::UnknownOp(b)),
                },
                State::UnsubSpc => match b {
                    b' ' | b'\t' => {}
                    _ => {
                        self.state = State::UnsubArg;
                        self.arg_start = i;
                    }
                },
                State::UnsubArg => match b {
                    b'\r' => {
                        self.drop = 1;
                        self.state = State::UnsubArgEnd;
                    }
                    b'\n' => {
                        let arg = self.take_arg(buf, i);
                        out.push(parse_unsub(&arg)?);
                        self.op_done(i);
                    }
                    _ => {
                        if let Some(ab) = self.arg_buf.as_mut() {
                            ab.extend_from_slice(&[b]);
                        }
                    }
                },
                State::UnsubArgEnd => match b {
                    b'\n' => {
                        let arg = self.take_arg(buf, i);
                        out.push(parse_unsub(&arg)?);
                        self.op_done(i);
                    }
                    _ => return Err(ParseError::BadArgs("UNSUB")),
                },

                // PING
                State::OpPi => match b {
                    b'N' | b'n' => self.state = State::OpPin,
                    _ => return Err(ParseError::UnknownOp(b)),
                },
                State::OpPin => match b {
                    b'G' | b'g' => self.state = State::OpPing,
                    _ => return Err(ParseError::UnknownOp(b)),
                },
                State::OpPing => match b {
                    b'\r' => self.state = State::OpPingEnd,
                    _ => return Err(ParseError::UnknownOp(b)),
                },
                State::OpPingEnd => match b {
                    b'\n' => {
                        out.push(Op::Ping);
                        self.op_done(i);
                    }
                    _ => return Err(ParseError::UnknownOp(b)),
                },

                // PONG
                State::OpPo => match b {
                    b'N' | b'n' => self.state = State::OpPon,
                    _ => return Err(ParseError::UnknownOp(b)),
                },
                State::OpPon => match b {
                    b'G' | b'g' => self.state = State::OpPong,
                    _ => return Err(ParseError::UnknownOp(b)),
                },
                State::OpPong => match b {
                    b'\r' => self.state = State::OpPongEnd,
                    _ => return Err(ParseError::UnknownOp(b)),
                },
                State::OpPongEnd => match b {
                    b'\n' => {
                        out.push(Op::Pong);
                        self.op_done(i);
                    }
                    _ => return Err(ParseError::UnknownOp(b)),
                },
            }
            i += 1;
        }

        // Preserve a partially received argument across reads.
        if self.arg_buf.is_none()
            && matches!(
                self.state,
                State::ConnectArg
                    | State::ConnectArgEnd
                    | State::PubArg
                    | State::PubArgEnd
                    | State::SubArg
                    | State::SubArgEnd
                    | State::UnsubArg
                    | State::UnsubArgEnd
            )
        {
            let end = (buf.len() - self.drop).max(self.arg_start);
            self.arg_buf = Some(BytesMut::from(&buf[self.arg_start..end]));
        }
        Ok(())
    }

    /// The completed argument: either the overflow buffer or a slice of
    /// the current feed.
    fn take_arg(&mut self, buf: &[u8], i: usize) -> Bytes {
        match self.arg_buf.take() {
            Some(ab) => ab.freeze(),
            None => Bytes::copy_from_slice(&buf[self.arg_start..i - self.drop]),
        }
    }

    /// Reset per-operation scratch after an emit at index `i`.
    fn op_done(&mut self, i: usize) {
        self.state = State::OpStart;
        self.drop = 0;
        self.arg_start = i + 1;
        self.arg_buf = None;
    }

    /// Validate publish arguments and switch to payload capture.
    fn start_payload(&mut self, arg: &Bytes) -> Result<(), ParseError> {
        let args = split_args(arg).ok_or(ParseError::BadArgs("PUB"))?;
        let (subject, reply, szb) = match args.as_slice() {
            [subject, szb] => (*subject, None, *szb),
            [subject, reply, szb] => (*subject, Some(*reply), *szb),
            _ => return Err(ParseError::BadArgs("PUB")),
        };
        let size = parse_size(szb).ok_or(ParseError::BadSize)?;
        if size > self.max_payload {
            return Err(ParseError::PayloadTooLarge {
                size,
                max: self.max_payload,
            });
        }
        self.pa = PubState {
            subject: arg.slice_ref(subject),
            reply: reply.map(|r| arg.slice_ref(r)),
            szb: arg.slice_ref(szb),
            size,
        };
        self.msg_buf = Some(BytesMut::with_capacity(size));
        self.state = if size == 0 {
            State::MsgEndCr
        } else {
            State::MsgPayload
        };
        Ok(())
    }
}

fn parse_sub(arg: &Bytes) -> Result<Op, ParseError> {
    let args = split_args(arg).ok_or(ParseError::BadArgs("SUB"))?;
    match args.as_slice() {
        [subject, sid] => Ok(Op::Sub {
            subject: arg.slice_ref(subject),
            queue: None,
            sid: arg.slice_ref(sid),
        }),
        [subject, queue, sid] => Ok(Op::Sub {
            subject: arg.slice_ref(subject),
            queue: Some(arg.slice_ref(queue)),
            sid: arg.slice_ref(sid),
        }),
        _ => Err(ParseError::BadArgs("SUB")),
    }
}

fn parse_unsub(arg: &Bytes) -> Result<Op, ParseError> {
    let args = split_args(arg).ok_or(ParseError::BadArgs("UNSUB"))?;
    match args.as_slice() {
        [sid] => Ok(Op::Unsub {
            sid: arg.slice_ref(sid),
            max: None,
        }),
        [sid, max] => Ok(Op::Unsub {
            sid: arg.slice_ref(sid),
            max: Some(parse_size(max).ok_or(ParseError::BadArgs("UNSUB"))?),
        }),
        _ => Err(ParseError::BadArgs("UNSUB")),
    }
}

/// Split on whitespace, collapsing runs. Returns `None` when the field
/// budget is exceeded.
fn split_args(arg: &[u8]) -> Option<SmallVec<[&[u8]; MAX_ARGS]>> {
    let mut out: SmallVec<[&[u8]; MAX_ARGS]> = SmallVec::new();
    let mut start: Option<usize> = None;
    for (i, b) in arg.iter().enumerate() {
        match b {
            b' ' | b'\t' | b'\r' | b'\n' => {
                if let Some(s) = start.take() {
                    if out.len() == MAX_ARGS {
                        return None;
                    }
                    out.push(&arg[s..i]);
                }
            }
            _ => {
                if start.is_none() {
                    start = Some(i);
                }
            }
        }
    }
    if let Some(s) = start {
        if out.len() == MAX_ARGS {
            return None;
        }
        out.push(&arg[s..]);
    }
    Some(out)
}

/// Parse a non-negative ASCII size field. Anything else is rejected.
fn parse_size(b: &[u8]) -> Option<usize> {
    if b.is_empty() {
        return None;
    }
    let mut n: usize = 0;
    for &d in b {
        if !d.is_ascii_digit() {
            return None;
        }
        n = n.checked_mul(10)?.checked_add(usize::from(d - b'0'))?;
    }
    Some(n)
}
