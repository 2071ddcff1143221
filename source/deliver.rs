// The deliver-action interface (spec §6, §1: "concrete deliver actions... out of scope"). Only
// the interface the dispatcher calls through, and the in-child execution context, are in scope.

use crate::{account::Account, mail::Mail};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliverStatus {
  Success,
  Failure,
}

/// The three delivery shapes named in spec §3/§4.5.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliverKind {
  /// Executed directly in this process; never touches the IPC channel.
  InChild,
  /// Executed by the parent; its reply carries replacement mail bytes.
  WriteBack,
  /// Executed by the parent; its reply must echo `size`/`body` unchanged.
  Stateful,
}

/// Context handed to an in-child deliver function (spec §4.5 step 2: `{account, mail}`).
pub struct DeliverCtx<'a> {
  pub account: &'a Account,
  pub mail: &'a Mail,
}

pub trait DeliverAction: Send + Sync {
  fn kind(&self) -> DeliverKind;
  /// Only called when `kind() == DeliverKind::InChild`.
  fn deliver(&self, ctx: &DeliverCtx) -> anyhow::Result<DeliverStatus>;
}
