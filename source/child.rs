// The child orchestrator (spec §4.4, C6): the per-account loop tying together the fetch backend,
// the rule evaluator, and the IPC channel. Owns startup, the FETCH/POLL loop, and shutdown.

use crate::{
  account::Account,
  action::{Action, DispatchError, UidResolver},
  fetch::{self, FetchBackend},
  ipc::Channel,
  mail::{Decision, ImplicitDecision, Mail},
  match_pred::MatchCtx,
  rule::{self, Rule},
};
use nix::unistd::{self, Uid};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum Op {
  Poll,
  Fetch,
}

/// The phase label threaded through account-fatal errors so one log line at abort time tells the
/// operator which phase failed (spec §7).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cause {
  Fetching,
  Matching,
  Delivery,
  Deleting,
  Keeping,
  Purging,
}

impl fmt::Display for Cause {
  fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
    let s = match self {
      Cause::Fetching => "fetching",
      Cause::Matching => "matching",
      Cause::Delivery => "delivery",
      Cause::Deleting => "deleting",
      Cause::Keeping => "keeping",
      Cause::Purging => "purging",
    };
    write!(formatter, "{s}")
  }
}

#[derive(Default, Debug)]
pub struct Counters {
  pub fetched: u64,
  pub kept: u64,
  pub dropped: u64,
}

/// Everything one account's run needs, built from `config::Config` by the binary (spec glossary:
/// "ChildState").
pub struct ChildState<'a> {
  pub account: &'a Account,
  pub rules: &'a [Rule],
  pub actions: &'a [Action],
  pub default_uid: u32,
  pub keep_all: bool,
  pub implicit_decision: ImplicitDecision,
  pub purge_after: u64,
  pub resolver: &'a dyn UidResolver,
}

/// A protocol-fatal condition was hit; the caller must abort without the EXIT handshake.
struct ProtocolAbort(String);

enum LoopError {
  AccountFatal(Cause, anyhow::Error),
  ProtocolFatal(String),
}

impl From<DispatchError> for LoopError {
  fn from(error: DispatchError) -> Self {
    match error {
      DispatchError::AccountFatal(e) => LoopError::AccountFatal(Cause::Delivery, e),
      DispatchError::ProtocolFatal(msg) => LoopError::ProtocolFatal(msg),
    }
  }
}

/// Drops privileges to `uid` if currently running as root (spec §4.4 startup step 2).
fn drop_privileges(uid: u32) -> anyhow::Result<()> {
  if unistd::getuid() == Uid::from_raw(0) {
    unistd::setuid(Uid::from_raw(uid))?;
  }
  Ok(())
}

/// Renames the process for observability (spec §4.4 startup step 3). Best-effort only; the actual
/// `prctl`/`setproctitle` call is platform-specific enough that it's left to the binary crate to
/// wire up if it wants it. Here this just records the intended title.
fn rename_process(account_name: &str) {
  log::debug!("running as account {account_name:?}");
}

/// Runs one account to completion and returns its exit code (spec §4.4, §6 "Exit codes").
pub fn run_child(state: &ChildState, op: Op, channel: &mut dyn Channel) -> i32 {
  if let Err(error) = crate::signal::install_once() {
    log::error!("installing signal handlers: {error:#}");
    return 1;
  }
  if let Err(error) = drop_privileges(state.default_uid) {
    log::error!("dropping privileges: {error:#}");
    return 1;
  }
  rename_process(&state.account.name);

  let op_supported = match op {
    Op::Poll => state.account.backend.has_poll(),
    Op::Fetch => state.account.backend.has_fetch(),
  };
  if !op_supported {
    log::error!(
      "account {:?} does not support {:?}; nothing to do",
      state.account.name,
      op
    );
    return 1;
  }

  let start = std::time::Instant::now();

  let mut ok = match state.account.backend.start() {
    Ok(fetch::Status::Success) => true,
    Ok(_) => {
      log::error!(
        "cause=\"fetching\" account {:?}: fetch backend start did not report SUCCESS",
        state.account.name
      );
      false
    }
    Err(error) => {
      log::error!(
        "cause=\"fetching\" account {:?}: fetch backend start failed: {error:#}",
        state.account.name
      );
      false
    }
  };

  let mut protocol_fatal = None;
  if ok {
    ok = match op {
      Op::Poll => run_poll(state),
      Op::Fetch => match run_fetch(state, channel) {
        Ok(success) => success,
        Err(ProtocolAbort(msg)) => {
          protocol_fatal = Some(msg);
          false
        }
      },
    };
  }
  log::debug!(
    "account {:?} processing took {:?}",
    state.account.name,
    start.elapsed()
  );

  let finish_status = match state.account.backend.finish() {
    Ok(status) => status,
    Err(error) => {
      log::error!("account {:?}: finish failed: {error:#}", state.account.name);
      fetch::Status::Error
    }
  };
  ok = fetch::fold_finish(ok, finish_status);

  // Signal-driven exits purge partial state; normal exits only check none was left behind (spec
  // §4.7). This core has no concrete `Partial` implementations of its own (partial temp state is
  // a property of a concrete fetch/deliver backend), so the cleanup pass runs over an empty list,
  // but the call site exists either way rather than being left unreferenced.
  let signal_driven = crate::signal::terminated();
  if let Err(error) = crate::signal::run_cleanup(&[], signal_driven) {
    log::error!("account {:?}: cleanup pass failed: {error:#}", state.account.name);
    return 1;
  }
  if signal_driven {
    log::warn!(
      "account {:?}: terminated by signal, exiting non-zero",
      state.account.name
    );
    ok = false;
  }

  if let Some(msg) = protocol_fatal {
    log::error!(
      "account {:?}: protocol-fatal error, aborting without EXIT handshake: {msg}",
      state.account.name
    );
    return 1;
  }

  if let Err(error) = channel.exit() {
    log::error!("account {:?}: EXIT handshake failed: {error}", state.account.name);
    return 1;
  }

  if ok {
    0
  } else {
    1
  }
}

fn run_poll(state: &ChildState) -> bool {
  match state.account.backend.poll() {
    Ok((fetch::Status::Success, count)) => {
      log::info!("account {:?}: {count} message(s) pending", state.account.name);
      true
    }
    Ok((status, _)) => {
      log::error!(
        "cause=\"fetching\" account {:?}: poll reported {status:?}",
        state.account.name
      );
      false
    }
    Err(error) => {
      log::error!(
        "cause=\"fetching\" account {:?}: poll failed: {error:#}",
        state.account.name
      );
      false
    }
  }
}

fn run_fetch(state: &ChildState, channel: &mut dyn Channel) -> Result<bool, ProtocolAbort> {
  let mut counters = Counters::default();
  let mut purge_counter: u64 = 0;

  loop {
    if crate::signal::terminated() {
      log::warn!(
        "account {:?}: termination signal received, abandoning in-flight work",
        state.account.name
      );
      break;
    }

    let fetched = match state.account.backend.fetch() {
      Ok(f) => f,
      Err(error) => {
        log::error!(
          "cause=\"fetching\" account {:?}: {error:#}",
          state.account.name
        );
        return Ok(false);
      }
    };

    match fetched.status {
      fetch::Status::Error => {
        log::error!(
          "cause=\"fetching\" account {:?}: fetch reported ERROR",
          state.account.name
        );
        return Ok(false);
      }
      fetch::Status::Complete => break,
      fetch::Status::Oversize => {
        if !state.account.del_big {
          log::error!(
            "cause=\"fetching\" account {:?}: OVERSIZE and del_big is not set",
            state.account.name
          );
          return Ok(false);
        }
        match done_block(state, channel, Decision::Drop, &mut counters, &mut purge_counter) {
          Ok(()) => continue,
          Err(LoopError::AccountFatal(cause, error)) => {
            log::error!(
              "cause={cause:?} account {:?}: {error:#}",
              state.account.name
            );
            return Ok(false);
          }
          Err(LoopError::ProtocolFatal(msg)) => return Err(ProtocolAbort(msg)),
        }
      }
      fetch::Status::Success => {}
    }

    counters.fetched += 1;
    let mut mail = Mail::new(fetched.bytes);
    mail.trim_from();
    if mail.size() == 0 {
      log::warn!("account {:?}: empty message after trim_from, discarding", state.account.name);
      continue;
    }

    match fetch_got(state, &mut mail, channel) {
      Ok(()) => {}
      Err(LoopError::AccountFatal(cause, error)) => {
        log::error!("cause={cause} account {:?}: {error:#}", state.account.name);
        return Ok(false);
      }
      Err(LoopError::ProtocolFatal(msg)) => return Err(ProtocolAbort(msg)),
    }

    match done_block(state, channel, mail.decision, &mut counters, &mut purge_counter) {
      Ok(()) => {}
      Err(LoopError::AccountFatal(cause, error)) => {
        log::error!("cause={cause} account {:?}: {error:#}", state.account.name);
        return Ok(false);
      }
      Err(LoopError::ProtocolFatal(msg)) => return Err(ProtocolAbort(msg)),
    }
  }

  log::debug!(
    "account {:?}: fetched={} kept={} dropped={}",
    state.account.name,
    counters.fetched,
    counters.kept,
    counters.dropped
  );
  Ok(true)
}

/// The FETCH loop's "done-block" (spec §4.4): acknowledges the mail to the backend and runs
/// periodic purge.
fn done_block(
  state: &ChildState,
  _channel: &mut dyn Channel,
  decision: Decision,
  counters: &mut Counters,
  purge_counter: &mut u64,
) -> Result<(), LoopError> {
  if state.account.backend.has_done() {
    let cause = match decision {
      Decision::Drop => Cause::Deleting,
      Decision::Keep => Cause::Keeping,
    };
    match decision {
      Decision::Drop => counters.dropped += 1,
      Decision::Keep => counters.kept += 1,
    }
    match state.account.backend.done(decision) {
      Ok(fetch::Status::Success) => {}
      Ok(status) => {
        return Err(LoopError::AccountFatal(
          cause,
          anyhow::anyhow!("done reported {status:?}"),
        ))
      }
      Err(error) => return Err(LoopError::AccountFatal(cause, error)),
    }
  }

  if state.purge_after > 0 && state.account.backend.has_purge() {
    *purge_counter += 1;
    if *purge_counter >= state.purge_after {
      match state.account.backend.purge() {
        Ok(fetch::Status::Success) => {}
        Ok(status) => {
          return Err(LoopError::AccountFatal(
            Cause::Purging,
            anyhow::anyhow!("purge reported {status:?}"),
          ))
        }
        Err(error) => return Err(LoopError::AccountFatal(Cause::Purging, error)),
      }
      *purge_counter = 0;
    }
  }

  Ok(())
}

const MAX_FIELD_LEN: usize = 450;
const BUILD: &str = env!("CARGO_PKG_VERSION");

/// Per-mail orchestration (spec §4.4.1, `fetch_got`).
fn fetch_got(state: &ChildState, mail: &mut Mail, channel: &mut dyn Channel) -> Result<(), LoopError> {
  if let Some(id) = mail.find_header("message-id", true) {
    if !id.is_empty() {
      mail.tags.set("message_id", id);
    }
  }

  if !state.account.no_received {
    if let Err(error) = insert_received(mail, &state.account.name) {
      log::warn!("couldn't insert Received header: {error:#}");
    }
  }

  mail.fill_wrapped();

  let mut ctx = MatchCtx::new(mail, state.account, channel);
  rule::evaluate_rules(
    state.rules,
    &mut ctx,
    state.actions,
    state.default_uid,
    state.resolver,
  )?;
  if !ctx.stopped {
    rule::apply_implicit_decision(&mut ctx.mail.decision, state.implicit_decision);
  }
  rule::apply_keep_all(&mut ctx.mail.decision, state.account.keep, state.keep_all);

  Ok(())
}

fn insert_received(mail: &mut Mail, account_name: &str) -> anyhow::Result<()> {
  let hostname = hostname();
  let truncated_host = crate::mail::truncate_field(&hostname, MAX_FIELD_LEN);
  let truncated_account = crate::mail::truncate_field(account_name, MAX_FIELD_LEN);
  let now = chrono::Local::now().to_rfc2822();
  let line = crate::mail::format_header(
    "Received",
    &format!(
      "by {truncated_host} (mailchild {BUILD}, account {truncated_account:?});\r\n\t{now}"
    ),
  )?;
  mail.insert_header(&line)
}

fn hostname() -> String {
  std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    account::Account,
    fetch::{Fetched, Status},
    ipc::NullChannel,
    mail::ImplicitDecision,
    rule::Rule,
  };
  use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
  };

  struct CannedBackend {
    messages: Mutex<Vec<Vec<u8>>>,
    done_calls: AtomicUsize,
  }

  impl FetchBackend for CannedBackend {
    fn has_fetch(&self) -> bool {
      true
    }
    fn has_done(&self) -> bool {
      true
    }
    fn fetch(&self) -> anyhow::Result<Fetched> {
      let mut messages = self.messages.lock().unwrap();
      if let Some(bytes) = messages.pop() {
        Ok(Fetched {
          status: Status::Success,
          bytes,
        })
      } else {
        Ok(Fetched {
          status: Status::Complete,
          bytes: Vec::new(),
        })
      }
    }
    fn done(&self, _decision: Decision) -> anyhow::Result<Status> {
      self.done_calls.fetch_add(1, Ordering::SeqCst);
      Ok(Status::Success)
    }
  }

  struct NoResolver;
  impl UidResolver for NoResolver {
    fn find_uid(&self, _mail: &Mail) -> anyhow::Result<Vec<u32>> {
      anyhow::bail!("not configured")
    }
  }

  #[test]
  fn empty_message_is_discarded_without_rule_evaluation() {
    // spec §8 scenario 1.
    let backend = Arc::new(CannedBackend {
      messages: Mutex::new(vec![b"\r\n".to_vec()]),
      done_calls: AtomicUsize::new(0),
    });
    let account = Account::new("acct", backend.clone());
    let rules: Vec<Rule> = Vec::new();
    let actions: Vec<Action> = Vec::new();
    let state = ChildState {
      account: &account,
      rules: &rules,
      actions: &actions,
      default_uid: 1000,
      keep_all: false,
      implicit_decision: ImplicitDecision::Drop,
      purge_after: 0,
      resolver: &NoResolver,
    };
    let mut channel = NullChannel;
    let ok = run_fetch(&state, &mut channel).unwrap();
    assert!(ok);
    assert_eq!(0, backend.done_calls.load(Ordering::SeqCst));
  }

  #[test]
  fn all_rule_stop_keeps_initial_drop_decision() {
    // spec §8 scenario 2, driven end to end through fetch_got.
    let backend = Arc::new(CannedBackend {
      messages: Mutex::new(vec![vec![0u8; 100]]),
      done_calls: AtomicUsize::new(0),
    });
    let account = Account::new("acct", backend);
    let rules = vec![Rule {
      stop: true,
      ..Rule::all(1)
    }];
    let actions: Vec<Action> = Vec::new();
    let state = ChildState {
      account: &account,
      rules: &rules,
      actions: &actions,
      default_uid: 1000,
      keep_all: false,
      implicit_decision: ImplicitDecision::Drop,
      purge_after: 0,
      resolver: &NoResolver,
    };
    let mut mail = Mail::new(b"Subject: hi\r\n\r\nbody".to_vec());
    let mut channel = NullChannel;
    fetch_got(&state, &mut mail, &mut channel).unwrap();
    assert_eq!(Decision::Drop, mail.decision);
  }

  #[test]
  fn keep_all_override_wins_even_after_stop() {
    let backend = Arc::new(CannedBackend {
      messages: Mutex::new(vec![]),
      done_calls: AtomicUsize::new(0),
    });
    let account = Account::new("acct", backend);
    let rules = vec![Rule {
      stop: true,
      ..Rule::all(1)
    }];
    let actions: Vec<Action> = Vec::new();
    let state = ChildState {
      account: &account,
      rules: &rules,
      actions: &actions,
      default_uid: 1000,
      keep_all: true,
      implicit_decision: ImplicitDecision::Drop,
      purge_after: 0,
      resolver: &NoResolver,
    };
    let mut mail = Mail::new(b"Subject: hi\r\n\r\nbody".to_vec());
    let mut channel = NullChannel;
    fetch_got(&state, &mut mail, &mut channel).unwrap();
    assert_eq!(Decision::Keep, mail.decision);
  }

  #[test]
  fn oversize_without_del_big_aborts_account() {
    // spec §8 scenario 5.
    struct OversizeBackend;
    impl FetchBackend for OversizeBackend {
      fn has_fetch(&self) -> bool {
        true
      }
      fn fetch(&self) -> anyhow::Result<Fetched> {
        Ok(Fetched {
          status: Status::Oversize,
          bytes: Vec::new(),
        })
      }
    }
    let account = Account::new("acct", Arc::new(OversizeBackend));
    let rules: Vec<Rule> = Vec::new();
    let actions: Vec<Action> = Vec::new();
    let state = ChildState {
      account: &account,
      rules: &rules,
      actions: &actions,
      default_uid: 1000,
      keep_all: false,
      implicit_decision: ImplicitDecision::Drop,
      purge_after: 0,
      resolver: &NoResolver,
    };
    let mut channel = NullChannel;
    let ok = run_fetch(&state, &mut channel).unwrap();
    assert!(!ok);
  }

  #[test]
  fn terminated_signal_abandons_fetch_loop_before_next_message() {
    // spec §4.4 shutdown / §5 cancellation: a termination signal must stop the loop from pulling
    // any further mail, not just be checked at the very end.
    let backend = Arc::new(CannedBackend {
      messages: Mutex::new(vec![b"Subject: hi\r\n\r\nbody".to_vec(), b"\r\n".to_vec()]),
      done_calls: AtomicUsize::new(0),
    });
    let account = Account::new("acct", backend.clone());
    let rules: Vec<Rule> = Vec::new();
    let actions: Vec<Action> = Vec::new();
    let state = ChildState {
      account: &account,
      rules: &rules,
      actions: &actions,
      default_uid: 1000,
      keep_all: false,
      implicit_decision: ImplicitDecision::Drop,
      purge_after: 0,
      resolver: &NoResolver,
    };
    let mut channel = NullChannel;
    crate::signal::set_terminated_for_test(true);
    let result = run_fetch(&state, &mut channel);
    crate::signal::clear_terminated_for_test();
    let ok = result.unwrap();
    assert!(ok);
    assert_eq!(0, backend.done_calls.load(Ordering::SeqCst));
  }
}
