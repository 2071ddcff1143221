// The fetch-backend adapter (spec §4.1, C2). A backend is polymorphic over an optional capability
// set; absence of a capability is reported by the corresponding `has_*` flag rather than inferred
// from an error, following the teacher's `sync::Open` pattern of probing a small trait rather than
// matching on error kinds.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
  Success,
  Error,
  Oversize,
  Complete,
}

/// One fetched message, handed to the orchestrator as raw bytes plus the status that produced it.
pub struct Fetched {
  pub status: Status,
  pub bytes: Vec<u8>,
}

/// A concrete fetch backend. Every method is optional at the capability level (`has_*`); calling a
/// method whose `has_*` flag is false is a programmer error in the orchestrator, not a recoverable
/// condition, so the default bodies simply panic — in practice `child.rs` never calls them without
/// checking first.
pub trait FetchBackend: Send + Sync {
  fn has_poll(&self) -> bool {
    false
  }
  fn has_fetch(&self) -> bool {
    false
  }
  fn has_done(&self) -> bool {
    false
  }
  fn has_purge(&self) -> bool {
    false
  }

  /// Runs once before any `fetch`/`poll` (spec §4.1). Default: no-op success.
  fn start(&self) -> anyhow::Result<Status> {
    Ok(Status::Success)
  }

  fn poll(&self) -> anyhow::Result<(Status, usize)> {
    unimplemented!("poll called on a backend without has_poll()")
  }

  fn fetch(&self) -> anyhow::Result<Fetched> {
    unimplemented!("fetch called on a backend without has_fetch()")
  }

  fn done(&self, decision: crate::mail::Decision) -> anyhow::Result<Status> {
    let _ = decision;
    unimplemented!("done called on a backend without has_done()")
  }

  fn purge(&self) -> anyhow::Result<Status> {
    unimplemented!("purge called on a backend without has_purge()")
  }

  /// Runs once on every exit path. May upgrade success to failure but never the reverse (spec
  /// §4.1). Default: no-op success.
  fn finish(&self) -> anyhow::Result<Status> {
    Ok(Status::Success)
  }
}

/// Folds a `finish` result into the loop's already-decided outcome, honoring the
/// "upgrade-only" rule (spec §4.1, §4.4 shutdown).
pub fn fold_finish(loop_ok: bool, finish_status: Status) -> bool {
  loop_ok && finish_status == Status::Success
}
