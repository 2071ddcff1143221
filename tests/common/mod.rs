// Test fixtures shared by the integration tests: a maildir-backed deliver action standing in for
// a real WRITE-BACK/Stateful action, and a background thread playing the privileged parent's side
// of the wire protocol (mirroring the teacher's `common::dovecot::server` background process).

use mailchild::ipc::Kind;
use serde::{Deserialize, Serialize};
use std::{
  io::{Read, Write},
  os::unix::net::UnixStream,
  thread,
};

pub mod maildir;

/// Bit-for-bit the same shape as `ipc::Record` (private to that module); bincode only cares about
/// field order and type, so this serializes/deserializes wire-compatibly.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
struct WireRecord {
  kind: Kind,
  account_ptr: u64,
  action_ptr: u64,
  uid: u32,
  error: bool,
  body: i64,
  size: u64,
  mail_present: bool,
}

fn write_segment(writer: &mut impl Write, bytes: &[u8]) {
  writer.write_all(&(bytes.len() as u64).to_be_bytes()).unwrap();
  writer.write_all(bytes).unwrap();
}

fn read_segment(reader: &mut impl Read) -> Vec<u8> {
  let mut len_buf = [0u8; 8];
  reader.read_exact(&mut len_buf).unwrap();
  let len = u64::from_be_bytes(len_buf) as usize;
  let mut buf = vec![0u8; len];
  reader.read_exact(&mut buf).unwrap();
  buf
}

/// What the mock parent should do with each ACTION it receives.
pub enum ParentBehavior {
  /// Acknowledge unchanged: echo size/body, no replacement mail.
  Ack,
  /// Reply as a WRITE-BACK action would: replace the mail wholesale.
  Replace(Vec<u8>),
  /// Reply with the error flag set.
  Fail,
}

/// Spawns a thread speaking the parent side of the wire protocol over `stream`, applying
/// `behavior` to every ACTION it sees and acking EXIT once observed. Joins on drop via the
/// returned `JoinHandle` being awaited by the caller (tests call `.join()` explicitly).
pub fn mock_parent(mut stream: UnixStream, behavior: ParentBehavior) -> thread::JoinHandle<()> {
  thread::spawn(move || loop {
    let record_bytes = read_segment(&mut stream);
    let record: WireRecord = bincode::deserialize(&record_bytes).unwrap();
    match record.kind {
      Kind::Exit => {
        let reply = WireRecord {
          kind: Kind::Exit,
          account_ptr: 0,
          action_ptr: 0,
          uid: 0,
          error: false,
          body: -1,
          size: 0,
          mail_present: false,
        };
        write_segment(&mut stream, &bincode::serialize(&reply).unwrap());
        return;
      }
      Kind::Action => {
        let tag_bytes = read_segment(&mut stream);
        let _mail_bytes = read_segment(&mut stream);
        let tags: Vec<(String, String)> = bincode::deserialize(&tag_bytes).unwrap();

        let (error, mail_present, body, size, replacement) = match &behavior {
          ParentBehavior::Ack => (false, false, record.body, record.size, None),
          ParentBehavior::Replace(bytes) => (false, true, 0i64, bytes.len() as u64, Some(bytes.clone())),
          ParentBehavior::Fail => (true, false, record.body, record.size, None),
        };
        let reply = WireRecord {
          kind: Kind::Done,
          account_ptr: record.account_ptr,
          action_ptr: record.action_ptr,
          uid: record.uid,
          error,
          body,
          size,
          mail_present,
        };
        write_segment(&mut stream, &bincode::serialize(&reply).unwrap());
        write_segment(&mut stream, &bincode::serialize(&tags).unwrap());
        if let Some(bytes) = replacement {
          write_segment(&mut stream, &bytes);
        }
      }
      Kind::Done => panic!("parent never receives DONE"),
    }
  })
}
