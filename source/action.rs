// The action dispatcher (spec §4.5, C5): resolves action-name templates to action definitions and
// routes each to in-child execution or, via IPC, to the privileged parent.

use crate::{
  account::{Account, UidPolicy},
  deliver::{DeliverAction, DeliverCtx, DeliverKind, DeliverStatus},
  ipc::{ActionRequest, Channel},
  mail::Mail,
};
use std::sync::Arc;

/// Derives a delivery uid list from a mail's headers (spec §4.5 step 3, "find_uid"). The concrete
/// derivation (address book lookup, `To:` parsing, etc.) is out of scope; only the interface the
/// dispatcher calls through is specified here.
pub trait UidResolver: Send + Sync {
  fn find_uid(&self, mail: &Mail) -> anyhow::Result<Vec<u32>>;
}

/// Refreshes any tag state derived from the mail's tag map after a DONE swaps it in wholesale
/// (spec §4.5 step 5, "call `update_tags` to refresh derived tag state"). This core has no
/// concrete predicates or rules that derive one tag's value from another's — the only tags it
/// ever writes are the literal `key`/`value` a rule interpolates (rule.rs) and the `action` tag
/// set above — so there's nothing to recompute here. Kept as an explicit call site, not folded
/// away, so a build that adds a derived-tag predicate has one place to hook into.
fn update_tags(_mail: &mut Mail) {}

pub struct Action {
  pub name: String,
  pub deliver: Arc<dyn DeliverAction>,
  pub uid_policy: UidPolicy,
}

/// Every failure mode distinguishes the two error tiers the orchestrator must tell apart: an
/// account-fatal condition unwinds normally (cause recorded, `finish` still runs, exit 1); a
/// protocol-fatal one must abort without the EXIT handshake (spec §7).
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
  #[error("{0}")]
  AccountFatal(anyhow::Error),
  #[error("protocol violation: {0}")]
  ProtocolFatal(String),
}

impl From<anyhow::Error> for DispatchError {
  fn from(error: anyhow::Error) -> Self {
    DispatchError::AccountFatal(error)
  }
}

/// Looks up every action whose name matches `name` exactly. An empty result is the caller's cue to
/// abort delivery with an account-fatal "name mismatch" (spec §4.5 step 2).
pub fn match_actions<'a>(table: &'a [Action], name: &str) -> Vec<&'a Action> {
  table.iter().filter(|a| a.name == name).collect()
}

/// Resolves the uid list for one (rule, action, account) triple per the spec §4.5 step 3
/// precedence chain, first match wins.
pub fn resolve_uids(
  rule_policy: &UidPolicy,
  action_policy: &UidPolicy,
  account_policy: &UidPolicy,
  default_uid: u32,
  mail: &Mail,
  resolver: &dyn UidResolver,
) -> anyhow::Result<Vec<u32>> {
  for policy in [rule_policy, action_policy, account_policy] {
    match policy {
      UidPolicy::FindUid => return resolver.find_uid(mail),
      UidPolicy::Users(users) if !users.is_empty() => return Ok(users.clone()),
      _ => continue,
    }
  }
  Ok(vec![default_uid])
}

/// Executes one resolved action against `mail` (spec §4.5 `do_action`). `channel`/`resolver` are
/// unused when the action is IN-CHILD.
pub fn do_action(
  action: &Action,
  rule_policy: &UidPolicy,
  account: &Account,
  default_uid: u32,
  mail: &mut Mail,
  channel: &mut dyn Channel,
  resolver: &dyn UidResolver,
) -> Result<(), DispatchError> {
  mail.tags.set("action", action.name.clone());

  if action.deliver.kind() == DeliverKind::InChild {
    let ctx = DeliverCtx { account, mail: &*mail };
    let status = action
      .deliver
      .deliver(&ctx)
      .map_err(DispatchError::AccountFatal)?;
    if status != DeliverStatus::Success {
      return Err(DispatchError::AccountFatal(anyhow::anyhow!(
        "in-child delivery for action {:?} failed",
        action.name
      )));
    }
    return Ok(());
  }

  let uids = resolve_uids(
    rule_policy,
    &action.uid_policy,
    &account.uid_policy,
    default_uid,
    mail,
    resolver,
  )?;

  for uid in uids {
    let write_back = action.deliver.kind() == DeliverKind::WriteBack;
    let pre_size = mail.size();
    let pre_body = mail.body();

    let request = ActionRequest {
      account_ptr: account as *const Account as u64,
      action_ptr: action as *const Action as u64,
      uid,
      tags: mail.tags.clone(),
      mail_bytes: mail.bytes().to_vec(),
      size: pre_size,
      body: pre_body,
    };
    let reply = channel
      .action(request)
      .map_err(|error| DispatchError::ProtocolFatal(error.to_string()))?;

    mail.tags = reply.tags;
    update_tags(mail);

    if reply.error {
      return Err(DispatchError::AccountFatal(anyhow::anyhow!(
        "remote delivery for action {:?} reported failure",
        action.name
      )));
    }

    if write_back {
      let replacement = reply.replacement.ok_or_else(|| {
        DispatchError::ProtocolFatal(format!(
          "WRITE-BACK action {:?} reply carried no replacement mail",
          action.name
        ))
      })?;
      *mail = Mail::new(replacement.bytes);
      mail.trim_from();
      mail.fill_wrapped();
    } else {
      if reply.replacement.is_some() {
        return Err(DispatchError::ProtocolFatal(format!(
          "non-write-back action {:?} reply carried a replacement mail",
          action.name
        )));
      }
      if reply.size != pre_size || reply.body != pre_body {
        return Err(DispatchError::ProtocolFatal(format!(
          "non-write-back action {:?} echoed size/body did not match pre-delivery values",
          action.name
        )));
      }
    }
  }

  Ok(())
}
