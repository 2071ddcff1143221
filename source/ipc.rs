// The privilege-separation wire protocol (spec §4.6, §6, C1). A full-duplex, length-framed
// channel over a pre-existing file descriptor: each frame is a fixed `Record` (bincode-encoded,
// length-prefixed) followed by zero or more length-prefixed opaque payload segments (tag blob,
// optional mail bytes), mirroring the teacher's own length-prefixed IMAP literal framing.
//
// Any unexpected message kind or I/O error here is protocol-fatal (spec §7 tier 3): the caller
// aborts immediately, without attempting the EXIT handshake.

use crate::mail::Tags;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Kind {
  Action,
  Done,
  Exit,
}

/// The fixed-size portion of a frame (spec §6: "data: fixed record"). `account_ptr`/`action_ptr`
/// are opaque tokens the child assigns when it sends an ACTION and expects the parent to echo back
/// unchanged on the matching DONE; the child validates only that echo, never their meaning.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
struct Record {
  kind: Kind,
  account_ptr: u64,
  action_ptr: u64,
  uid: u32,
  error: bool,
  /// -1 (i64::MIN as sentinel is avoided; we use -1 literally) until known.
  body: i64,
  size: u64,
  mail_present: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
  #[error("IPC I/O error: {0}")]
  Io(#[from] std::io::Error),
  #[error("IPC encoding error: {0}")]
  Encoding(#[from] bincode::Error),
  #[error("unexpected message kind: expected {expected:?}, got {got:?}")]
  UnexpectedKind { expected: Kind, got: Kind },
  #[error("DONE reply carried no tag blob (protocol violation)")]
  MissingTags,
  #[error("DONE reply's account/action token did not match the outstanding request")]
  TokenMismatch,
}

pub struct ActionRequest {
  pub account_ptr: u64,
  pub action_ptr: u64,
  pub uid: u32,
  pub tags: Tags,
  pub mail_bytes: Vec<u8>,
  pub size: usize,
  pub body: Option<usize>,
}

pub struct ReplacementMail {
  pub bytes: Vec<u8>,
  pub size: usize,
  pub body: Option<usize>,
}

pub struct DoneReply {
  pub error: bool,
  pub tags: Tags,
  /// The parent's echoed `size`/`body`, straight off the DONE record — present regardless of
  /// whether a replacement mail followed, so a non-write-back caller can assert them against its
  /// pre-delivery values (spec §4.5 step 8).
  pub size: usize,
  pub body: Option<usize>,
  pub replacement: Option<ReplacementMail>,
}

/// The child's view of the IPC channel (spec §4.6). Implementations of `action` block
/// indefinitely awaiting the parent's reply, by contract (spec §5 "infinite timeout").
pub trait Channel {
  fn action(&mut self, request: ActionRequest) -> Result<DoneReply, ProtocolError>;
  fn exit(&mut self) -> Result<(), ProtocolError>;
}

fn write_segment(writer: &mut impl Write, bytes: &[u8]) -> Result<(), ProtocolError> {
  writer.write_all(&(bytes.len() as u64).to_be_bytes())?;
  writer.write_all(bytes)?;
  Ok(())
}

fn read_segment(reader: &mut impl Read) -> Result<Vec<u8>, ProtocolError> {
  let mut len_buf = [0u8; 8];
  reader.read_exact(&mut len_buf)?;
  let len = u64::from_be_bytes(len_buf) as usize;
  let mut buf = vec![0u8; len];
  reader.read_exact(&mut buf)?;
  Ok(buf)
}

fn encode_tags(tags: &Tags) -> Result<Vec<u8>, ProtocolError> {
  let pairs: Vec<(String, String)> = tags
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
  Ok(bincode::serialize(&pairs)?)
}

fn decode_tags(bytes: &[u8]) -> Result<Tags, ProtocolError> {
  let pairs: Vec<(String, String)> = bincode::deserialize(bytes)?;
  let mut tags = Tags::new();
  for (k, v) in pairs {
    tags.set(k, v);
  }
  Ok(tags)
}

/// A `Channel` implementation driving the wire protocol over any full-duplex byte stream (a
/// `UnixStream` in production, an in-memory pipe in tests).
pub struct StreamChannel<S> {
  stream: S,
  next_token: u64,
}

impl<S: Read + Write> StreamChannel<S> {
  pub fn new(stream: S) -> Self {
    Self {
      stream,
      next_token: 0,
    }
  }

  fn send_record(&mut self, record: &Record) -> Result<(), ProtocolError> {
    write_segment(&mut self.stream, &bincode::serialize(record)?)
  }

  fn read_record(&mut self) -> Result<Record, ProtocolError> {
    let bytes = read_segment(&mut self.stream)?;
    Ok(bincode::deserialize(&bytes)?)
  }
}

impl<S: Read + Write> Channel for StreamChannel<S> {
  fn action(&mut self, request: ActionRequest) -> Result<DoneReply, ProtocolError> {
    let token = self.next_token;
    self.next_token += 1;
    let body = request.body.map(|b| b as i64).unwrap_or(-1);
    let record = Record {
      kind: Kind::Action,
      account_ptr: request.account_ptr.wrapping_add(token),
      action_ptr: request.action_ptr,
      uid: request.uid,
      error: false,
      body,
      size: request.size as u64,
      mail_present: true,
    };
    self.send_record(&record)?;
    write_segment(&mut self.stream, &encode_tags(&request.tags)?)?;
    write_segment(&mut self.stream, &request.mail_bytes)?;

    let reply = self.read_record()?;
    if reply.kind != Kind::Done {
      return Err(ProtocolError::UnexpectedKind {
        expected: Kind::Done,
        got: reply.kind,
      });
    }
    if reply.account_ptr != record.account_ptr {
      return Err(ProtocolError::TokenMismatch);
    }
    let tag_bytes = read_segment(&mut self.stream)?;
    if tag_bytes.is_empty() {
      return Err(ProtocolError::MissingTags);
    }
    let tags = decode_tags(&tag_bytes)?;
    let replacement = if reply.mail_present {
      let bytes = read_segment(&mut self.stream)?;
      Some(ReplacementMail {
        size: bytes.len(),
        body: if reply.body < 0 {
          None
        } else {
          Some(reply.body as usize)
        },
        bytes,
      })
    } else {
      None
    };
    Ok(DoneReply {
      error: reply.error,
      tags,
      size: reply.size as usize,
      body: if reply.body < 0 {
        None
      } else {
        Some(reply.body as usize)
      },
      replacement,
    })
  }

  fn exit(&mut self) -> Result<(), ProtocolError> {
    let record = Record {
      kind: Kind::Exit,
      account_ptr: 0,
      action_ptr: 0,
      uid: 0,
      error: false,
      body: -1,
      size: 0,
      mail_present: false,
    };
    self.send_record(&record)?;
    let reply = self.read_record()?;
    if reply.kind != Kind::Exit {
      return Err(ProtocolError::UnexpectedKind {
        expected: Kind::Exit,
        got: reply.kind,
      });
    }
    Ok(())
  }
}

/// A `Channel` that always errors; used where a `MatchCtx` must be constructed for tests that
/// never actually dispatch a remote action.
pub struct NullChannel;

impl Channel for NullChannel {
  fn action(&mut self, _request: ActionRequest) -> Result<DoneReply, ProtocolError> {
    Err(ProtocolError::UnexpectedKind {
      expected: Kind::Done,
      got: Kind::Action,
    })
  }

  fn exit(&mut self) -> Result<(), ProtocolError> {
    Ok(())
  }
}
