// The child worker described in this crate hands off every privileged delivery to a trusted
// parent process over a pre-established IPC channel (see `ipc`); it never delivers mail itself
// except through `DeliverKind::InChild` actions.

use std::{os::unix::io::FromRawFd as _, os::unix::net::UnixStream, path};

pub mod account;
pub mod action;
pub mod child;
pub mod config;
pub mod deliver;
pub mod fetch;
pub mod glob;
pub mod interp;
pub mod ipc;
pub mod mail;
pub mod match_pred;
pub mod rule;
pub mod signal;

#[derive(clap::Args)]
#[group(skip)]
pub struct Arguments {
  #[arg(long = "config", help = "Path to the account configuration file")]
  pub config: path::PathBuf,
  #[arg(long = "account", help = "Account name to process")]
  pub account: String,
  #[arg(help = "Operation: poll | fetch")]
  pub op: child::Op,
  #[arg(
    long = "default-uid",
    help = "Fallback delivery uid used when no rule/action/account uid policy applies"
  )]
  pub default_uid: u32,
  #[arg(
    long = "ipc-fd",
    help = "File descriptor of the IPC socket inherited from the parent",
    default_value_t = 3
  )]
  pub ipc_fd: i32,
}

/// A `config::Registry` that refuses every lookup. Concrete fetch backends, match predicates and
/// deliver actions are out of scope for this core; a real deployment links its own
/// implementations and registers them in place of this one.
struct UnimplementedRegistry;

impl config::Registry for UnimplementedRegistry {
  fn fetch_backend(&self, name: &str) -> anyhow::Result<std::sync::Arc<dyn fetch::FetchBackend>> {
    anyhow::bail!("no fetch backend named {name:?} is linked into this build")
  }

  fn deliver_action(
    &self,
    name: &str,
  ) -> anyhow::Result<std::sync::Arc<dyn deliver::DeliverAction>> {
    anyhow::bail!("no deliver action named {name:?} is linked into this build")
  }

  fn predicate(
    &self,
    name: &str,
    _args: &[String],
  ) -> anyhow::Result<Box<dyn match_pred::MatchPredicate>> {
    anyhow::bail!("no match predicate named {name:?} is linked into this build")
  }
}

/// A `UidResolver` that refuses to derive a uid from mail headers. Address-to-uid mapping is out
/// of scope; a real deployment supplies its own.
struct UnimplementedUidResolver;

impl action::UidResolver for UnimplementedUidResolver {
  fn find_uid(&self, _mail: &mail::Mail) -> anyhow::Result<Vec<u32>> {
    anyhow::bail!("find_uid is not implemented by this build")
  }
}

/// Loads the configuration, finds `arguments.account`, and runs it to completion. Returns the
/// process exit code (spec §6 "Exit codes"): 0 on clean completion, 1 on any reported failure,
/// including configuration errors that never reach `child::run_child`.
pub fn run(arguments: &Arguments) -> i32 {
  let registry = UnimplementedRegistry;
  let config = match config::load(&arguments.config, &registry) {
    Ok(config) => config,
    Err(error) => {
      log::error!("loading configuration {:?}: {error:#}", arguments.config);
      return 1;
    }
  };

  let Some(idx) = config
    .accounts
    .iter()
    .position(|account| account.name == arguments.account)
  else {
    log::error!(
      "no account named {:?} in {:?}",
      arguments.account,
      arguments.config
    );
    return 1;
  };

  let stream = unsafe { UnixStream::from_raw_fd(arguments.ipc_fd) };
  let mut channel = ipc::StreamChannel::new(stream);
  let resolver = UnimplementedUidResolver;

  let state = child::ChildState {
    account: &config.accounts[idx],
    rules: &config.account_rules[idx],
    actions: &config.actions,
    default_uid: arguments.default_uid,
    keep_all: config.keep_all,
    implicit_decision: config.implicit_decision,
    purge_after: config.purge_after,
    resolver: &resolver,
  };

  child::run_child(&state, arguments.op, &mut channel)
}
