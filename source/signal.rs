// Signal handling and cleanup (spec §4.7, C7). The child ignores interrupt signals (they belong to
// the foreground parent) and treats a termination signal as a request to purge partial state and
// exit non-zero.

use nix::sys::signal::{self, SigHandler, Signal};
use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicBool, Ordering};

static TERMINATED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_term(_signal: nix::libc::c_int) {
  TERMINATED.store(true, Ordering::SeqCst);
}

/// Installs the child's signal disposition: SIGINT ignored, SIGTERM caught and recorded. Must run
/// before the fetch loop starts (spec §4.4 startup step 1).
pub fn install() -> anyhow::Result<()> {
  unsafe {
    signal::sigaction(
      Signal::SIGINT,
      &signal::SigAction::new(
        SigHandler::SigIgn,
        signal::SaFlags::empty(),
        signal::SigSet::empty(),
      ),
    )?;
    signal::sigaction(
      Signal::SIGTERM,
      &signal::SigAction::new(
        SigHandler::Handler(on_term),
        signal::SaFlags::empty(),
        signal::SigSet::empty(),
      ),
    )?;
  }
  Ok(())
}

/// True once a termination signal has been delivered since `install()`. Tests can't raise a real
/// SIGTERM at themselves without affecting the whole (parallel) test binary, so under `cfg(test)`
/// this checks a per-thread override first — keyed the same way the teacher keys its own
/// test-scoped interruption state, since `cargo test` runs each test on its own thread.
pub fn terminated() -> bool {
  #[cfg(test)]
  {
    if let Some(&value) = TEST_OVERRIDE
      .lock()
      .unwrap()
      .get(&std::thread::current().id())
    {
      return value;
    }
  }
  TERMINATED.load(Ordering::SeqCst)
}

#[cfg(test)]
static TEST_OVERRIDE: Lazy<std::sync::Mutex<std::collections::HashMap<std::thread::ThreadId, bool>>> =
  Lazy::new(|| std::sync::Mutex::new(std::collections::HashMap::new()));

/// Simulates signal-driven termination for the calling test's thread only.
#[cfg(test)]
pub(crate) fn set_terminated_for_test(value: bool) {
  TEST_OVERRIDE
    .lock()
    .unwrap()
    .insert(std::thread::current().id(), value);
}

#[cfg(test)]
pub(crate) fn clear_terminated_for_test() {
  TEST_OVERRIDE
    .lock()
    .unwrap()
    .remove(&std::thread::current().id());
}

/// A piece of partial state that must be torn down on abnormal termination (e.g. a half-written
/// maildrop temp file). `cleanup()` is called either as a destructive purge (signal-driven exit)
/// or as a no-op check (normal exit, where no partials are expected) — see `run_cleanup`.
pub trait Partial {
  fn purge(&self) -> anyhow::Result<()>;
  fn is_empty(&self) -> bool;
}

/// Runs the cleanup pass appropriate to how the child is exiting (spec §4.7). On a signal-driven
/// exit every partial is purged; on a normal exit we only assert none were left behind, logging a
/// warning (not a hard failure) if that assumption is violated.
pub fn run_cleanup(partials: &[Box<dyn Partial>], signal_driven: bool) -> anyhow::Result<()> {
  for partial in partials {
    if signal_driven {
      partial.purge()?;
    } else if !partial.is_empty() {
      log::warn!("cleanup check found unexpected partial state on normal exit");
    }
  }
  Ok(())
}

static SIGNAL_INSTALLED: Lazy<AtomicBool> = Lazy::new(|| AtomicBool::new(false));

/// Idempotent wrapper so tests and `lib::run` can call `install()` more than once safely.
pub fn install_once() -> anyhow::Result<()> {
  if SIGNAL_INSTALLED.swap(true, Ordering::SeqCst) {
    return Ok(());
  }
  install()
}
