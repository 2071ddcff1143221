// The rule evaluator's boolean core (spec §4.3.1, C4). `MatchPredicate` is the out-of-scope
// "concrete match predicate" interface (spec §1); everything else here — the per-message
// evaluation state and the left-associative, non-short-circuiting combination of expression items
// — is in scope and owned by this module.

use crate::{account::Account, ipc::Channel, mail::Mail};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchResult {
  True,
  False,
  Error,
}

/// A concrete match predicate (spec §6: "Match-predicate interface"). Implementations are out of
/// scope; only the interface they're evaluated through is specified here.
pub trait MatchPredicate {
  fn eval(&self, ctx: &mut MatchCtx) -> anyhow::Result<MatchResult>;
  fn describe(&self) -> String;
}

/// The per-message evaluation state threaded through one rule walk (spec §3). Stack-scoped to one
/// mail; never persisted.
pub struct MatchCtx<'a> {
  pub mail: &'a mut Mail,
  pub account: &'a Account,
  pub channel: &'a mut dyn Channel,
  pub matched: bool,
  pub stopped: bool,
}

impl<'a> MatchCtx<'a> {
  pub fn new(mail: &'a mut Mail, account: &'a Account, channel: &'a mut dyn Channel) -> Self {
    Self {
      mail,
      account,
      channel,
      matched: false,
      stopped: false,
    }
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operator {
  None,
  Or,
  And,
}

pub struct ExprItem {
  pub predicate: Box<dyn MatchPredicate>,
  pub inverted: bool,
  pub operator: Operator,
}

/// Evaluates an ordered expression against `ctx` per spec §4.3.1: strictly left-to-right, every
/// item evaluated regardless of whether the accumulator is already decided, because predicates may
/// have observable side effects (e.g. caching capture groups into `ctx.mail.rml`). This is a
/// behavioral contract, not an optimization opportunity.
pub fn evaluate_expr(items: &[ExprItem], ctx: &mut MatchCtx) -> anyhow::Result<bool> {
  let mut acc = false;
  for item in items {
    let raw = match item.predicate.eval(ctx)? {
      MatchResult::True => true,
      MatchResult::False => false,
      MatchResult::Error => anyhow::bail!("predicate error: {}", item.predicate.describe()),
    };
    let cres = raw ^ item.inverted;
    // NONE is treated as OR for every item, first or not: `acc` starts `false`, so the first
    // item's NONE already reduces to `false || cres == cres`.
    acc = match item.operator {
      Operator::None | Operator::Or => acc || cres,
      Operator::And => acc && cres,
    };
  }
  Ok(acc)
}
