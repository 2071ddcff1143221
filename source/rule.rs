// The rule evaluator (spec §4.3, C4): walks an ordered tree of rules, evaluating each against the
// current `MatchCtx` and dispatching its actions in order.

use crate::{
  account::UidPolicy,
  action::{self, Action, DispatchError},
  glob,
  interp::interpolate,
  mail::{Decision, ImplicitDecision, View},
  match_pred::{evaluate_expr, ExprItem, MatchCtx},
};

pub enum RuleKind {
  Expression(Vec<ExprItem>),
  All,
}

pub struct Rule {
  pub idx: usize,
  pub accounts: Vec<String>,
  pub kind: RuleKind,
  pub key: Option<String>,
  pub value: Option<String>,
  pub actions: Option<Vec<String>>,
  pub rules: Vec<Rule>,
  pub stop: bool,
  pub uid_policy: UidPolicy,
}

impl Rule {
  pub fn all(idx: usize) -> Self {
    Self {
      idx,
      accounts: Vec::new(),
      kind: RuleKind::All,
      key: None,
      value: None,
      actions: None,
      rules: Vec::new(),
      stop: false,
      uid_policy: UidPolicy::Unset,
    }
  }
}

/// Walks `rules` in order against `ctx`, mutating `ctx.matched`/`ctx.stopped` and `ctx.mail` as it
/// goes. Returns once the list is exhausted or a `stop` fires anywhere in the (possibly nested)
/// walk (spec §4.3 steps 1-6).
pub fn evaluate_rules(
  rules: &[Rule],
  ctx: &mut MatchCtx,
  table: &[Action],
  default_uid: u32,
  resolver: &dyn action::UidResolver,
) -> Result<(), DispatchError> {
  for rule in rules {
    if !glob::matches_any(&rule.accounts, &ctx.account.name) {
      continue;
    }

    let matched = match &rule.kind {
      RuleKind::All => true,
      RuleKind::Expression(items) => {
        ctx.mail.set_wrapped(View::Unwrapped);
        let result = evaluate_expr(items, ctx);
        ctx.mail.set_wrapped(View::Wrapped);
        result.map_err(|error| {
          DispatchError::AccountFatal(error.context(format!("rule {} evaluation", rule.idx)))
        })?
      }
    };
    if !matched {
      continue;
    }
    ctx.matched = true;

    if let Some(key_template) = &rule.key {
      // Interpolation failures leave the tag unset; never fatal (spec §4.3 step 3).
      if let Ok(key) = interpolate(key_template, ctx.mail) {
        if !key.is_empty() {
          let value = rule
            .value
            .as_deref()
            .map(|template| interpolate(template, ctx.mail).unwrap_or_default())
            .unwrap_or_default();
          ctx.mail.tags.set(key, value);
        }
      }
    }

    if let Some(action_templates) = &rule.actions {
      for template in action_templates {
        let name = interpolate(template, ctx.mail).map_err(DispatchError::AccountFatal)?;
        let resolved = action::match_actions(table, &name);
        if resolved.is_empty() {
          return Err(DispatchError::AccountFatal(anyhow::anyhow!(
            "action name {name:?} (rule {}) matched no configured action",
            rule.idx
          )));
        }
        for resolved_action in resolved {
          action::do_action(
            resolved_action,
            &rule.uid_policy,
            ctx.account,
            default_uid,
            ctx.mail,
            ctx.channel,
            resolver,
          )?;
        }
      }
    }

    if !rule.rules.is_empty() {
      evaluate_rules(&rule.rules, ctx, table, default_uid, resolver)?;
      if ctx.stopped {
        return Ok(());
      }
    }

    if rule.stop {
      ctx.stopped = true;
      return Ok(());
    }
  }
  Ok(())
}

/// Applies the implicit decision (spec §4.3: "Reaching the end of the outermost rule list without
/// `stopped`"). Per scenario 2 (spec §8) and the open question in spec §9, this is only called
/// when `ctx.stopped` is false; a `stop` anywhere in the walk — even one that never reached an
/// explicit decision — leaves the mail's decision at whatever it already was (its initial DROP,
/// unless a WRITE-BACK or explicit tagging step changed it, which this spec's action set never
/// does). This is the literal, if surprising, source behavior; see DESIGN.md.
pub fn apply_implicit_decision(decision: &mut Decision, implicit: ImplicitDecision) {
  *decision = match implicit {
    ImplicitDecision::Keep => Decision::Keep,
    ImplicitDecision::Drop => Decision::Drop,
    ImplicitDecision::NoChoice => {
      log::warn!("no implicit decision configured; defaulting to KEEP");
      Decision::Keep
    }
  };
}

/// The global keep-all override (spec §4.3: "if either the account or the configuration requests
/// keep-all, `decision` is forced to KEEP"). Applied unconditionally, even when `stopped` fired.
pub fn apply_keep_all(decision: &mut Decision, account_keep: bool, config_keep_all: bool) {
  if account_keep || config_keep_all {
    *decision = Decision::Keep;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    account::Account,
    fetch::FetchBackend,
    ipc::NullChannel,
    mail::Mail,
    match_pred::{MatchPredicate, MatchResult, Operator},
  };

  struct NoResolver;
  impl action::UidResolver for NoResolver {
    fn find_uid(&self, _mail: &Mail) -> anyhow::Result<Vec<u32>> {
      anyhow::bail!("not configured")
    }
  }

  struct Noop;
  impl FetchBackend for Noop {}

  #[test]
  fn all_rule_with_stop_leaves_initial_decision() -> anyhow::Result<()> {
    // spec §8 scenario 2.
    let account = Account::new("acct", std::sync::Arc::new(Noop));
    let mut mail = Mail::new(vec![0u8; 100]);
    let mut channel = NullChannel;
    let mut ctx = MatchCtx::new(&mut mail, &account, &mut channel);
    let rules = vec![Rule {
      stop: true,
      ..Rule::all(1)
    }];
    evaluate_rules(&rules, &mut ctx, &[], 1000, &NoResolver)?;
    assert!(ctx.stopped);
    if !ctx.stopped {
      apply_implicit_decision(&mut ctx.mail.decision, ImplicitDecision::Drop);
    }
    apply_keep_all(&mut ctx.mail.decision, false, false);
    assert_eq!(Decision::Drop, ctx.mail.decision);
    Ok(())
  }

  #[test]
  fn account_gate_skips_non_matching_rule() -> anyhow::Result<()> {
    let account = Account::new("work", std::sync::Arc::new(Noop));
    let mut mail = Mail::new(b"\r\n".to_vec());
    let mut channel = NullChannel;
    let mut ctx = MatchCtx::new(&mut mail, &account, &mut channel);
    let rules = vec![Rule {
      accounts: vec!["personal".to_string()],
      stop: true,
      ..Rule::all(1)
    }];
    evaluate_rules(&rules, &mut ctx, &[], 1000, &NoResolver)?;
    assert!(!ctx.stopped);
    assert!(!ctx.matched);
    Ok(())
  }

  #[test]
  fn nested_stop_propagates_to_outer() -> anyhow::Result<()> {
    // spec §8 scenario 6.
    let account = Account::new("acct", std::sync::Arc::new(Noop));
    let mut mail = Mail::new(b"\r\n".to_vec());
    let mut channel = NullChannel;
    let mut ctx = MatchCtx::new(&mut mail, &account, &mut channel);
    let inner = Rule {
      stop: true,
      ..Rule::all(2)
    };
    let outer = Rule {
      rules: vec![inner],
      ..Rule::all(1)
    };
    let rules = vec![outer, Rule::all(3)];
    evaluate_rules(&rules, &mut ctx, &[], 1000, &NoResolver)?;
    assert!(ctx.stopped);
    // `rules[1]` (idx 3) is never reached once outer returns on the inner stop; nothing beyond
    // `matched`/`stopped` would distinguish that here, so this asserts only the propagation.
    Ok(())
  }

  struct AlwaysTrue;
  impl MatchPredicate for AlwaysTrue {
    fn eval(&self, _ctx: &mut MatchCtx) -> anyhow::Result<MatchResult> {
      Ok(MatchResult::True)
    }
    fn describe(&self) -> String {
      "always-true".to_string()
    }
  }

  #[test]
  fn expression_rule_tags_on_match() -> anyhow::Result<()> {
    let account = Account::new("acct", std::sync::Arc::new(Noop));
    let mut mail = Mail::new(b"Subject: hi\r\n\r\nbody".to_vec());
    let mut channel = NullChannel;
    let mut ctx = MatchCtx::new(&mut mail, &account, &mut channel);
    let rules = vec![Rule {
      kind: RuleKind::Expression(vec![ExprItem {
        predicate: Box::new(AlwaysTrue),
        inverted: false,
        operator: Operator::None,
      }]),
      key: Some("folder".to_string()),
      value: Some("inbox".to_string()),
      ..Rule::all(1)
    }];
    evaluate_rules(&rules, &mut ctx, &[], 1000, &NoResolver)?;
    assert!(ctx.matched);
    assert_eq!(Some("inbox"), ctx.mail.tags.get("folder"));
    Ok(())
  }
}
