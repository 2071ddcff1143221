// Account descriptor (spec §3). Immutable for the lifetime of the child that owns it.

use crate::fetch::FetchBackend;
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UidPolicy {
  /// Derive the delivery uid from the mail's headers.
  FindUid,
  /// Use this explicit, ordered list of uids.
  Users(Vec<u32>),
  /// No policy configured at this scope; fall through to the next scope in the precedence chain
  /// (spec §4.5 step 3).
  Unset,
}

impl Default for UidPolicy {
  fn default() -> Self {
    UidPolicy::Unset
  }
}

pub struct Account {
  pub name: String,
  pub backend: Arc<dyn FetchBackend>,
  /// Overrides the implicit decision to always KEEP, account-wide (spec §4.3 "global override").
  pub keep: bool,
  pub uid_policy: UidPolicy,
  /// Accepted into the done-block as DROP rather than failing the account when a message exceeds
  /// the backend's size limit (spec §4.4 FETCH loop, OVERSIZE handling).
  pub del_big: bool,
  /// Suppresses the `Received:` header insertion (spec §4.4.1 step 2).
  pub no_received: bool,
}

impl Account {
  pub fn new(name: impl Into<String>, backend: Arc<dyn FetchBackend>) -> Self {
    Self {
      name: name.into(),
      backend,
      keep: false,
      uid_policy: UidPolicy::Unset,
      del_big: false,
      no_received: false,
    }
  }
}

impl std::fmt::Debug for Account {
  fn fmt(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
    formatter
      .debug_struct("Account")
      .field("name", &self.name)
      .field("keep", &self.keep)
      .field("uid_policy", &self.uid_policy)
      .field("del_big", &self.del_big)
      .field("no_received", &self.no_received)
      .finish_non_exhaustive()
  }
}
