// Configuration loading (ambient scaffolding, SPEC_FULL.md §9 "Config loading"). Mirrors the
// Account/Rule/Action data model 1:1 as `serde::Deserialize` structs loaded from TOML, then builds
// the in-memory tree the rule evaluator and dispatcher actually run against. The rule evaluator,
// dispatcher and IPC layer never see TOML — only the validated tree this module produces.
//
// Concrete match predicates, fetch backends and deliver actions stay out of scope as *types*; this
// module only needs to *name* them, so construction is delegated to a small `Registry` the binary
// populates with whatever concrete implementations it links in.
//
// Deliberately avoids `#[serde(flatten)]` on top of internally-tagged enums: toml's deserializer
// has never played well with that combination, so uid-policy and rule-kind fields are plain,
// unflattened fields instead.

use crate::{
  account::{Account, UidPolicy},
  action::Action,
  deliver::DeliverAction,
  fetch::FetchBackend,
  match_pred::{ExprItem, MatchPredicate, Operator},
  rule::{Rule, RuleKind},
};
use anyhow::Context as _;
use serde::Deserialize;
use std::{path::Path, sync::Arc};

fn uid_policy(find_uid: bool, users: Vec<u32>) -> UidPolicy {
  if find_uid {
    UidPolicy::FindUid
  } else if !users.is_empty() {
    UidPolicy::Users(users)
  } else {
    UidPolicy::Unset
  }
}

#[derive(Debug, Deserialize)]
struct RawExprItem {
  predicate: String,
  #[serde(default)]
  args: Vec<String>,
  #[serde(default)]
  invert: bool,
  #[serde(default = "default_op")]
  op: String,
}

fn default_op() -> String {
  "none".to_string()
}

#[derive(Debug, Deserialize)]
struct RawRule {
  #[serde(default)]
  accounts: Vec<String>,
  /// "all" or "expression"; anything else is rejected at build time.
  r#type: String,
  #[serde(default)]
  expr: Vec<RawExprItem>,
  key: Option<String>,
  value: Option<String>,
  actions: Option<Vec<String>>,
  #[serde(default)]
  rules: Vec<RawRule>,
  #[serde(default)]
  stop: bool,
  #[serde(default)]
  find_uid: bool,
  #[serde(default)]
  users: Vec<u32>,
}

#[derive(Debug, Deserialize)]
struct RawAction {
  name: String,
  backend: String,
  #[serde(default)]
  find_uid: bool,
  #[serde(default)]
  users: Vec<u32>,
}

#[derive(Debug, Deserialize)]
struct RawAccount {
  name: String,
  backend: String,
  #[serde(default)]
  keep: bool,
  #[serde(default)]
  del_big: bool,
  #[serde(default)]
  no_received: bool,
  #[serde(default)]
  find_uid: bool,
  #[serde(default)]
  users: Vec<u32>,
  #[serde(default)]
  rules: Vec<RawRule>,
}

fn default_implicit_decision() -> String {
  "none".to_string()
}

#[derive(Debug, Deserialize)]
pub struct RawConfig {
  #[serde(default)]
  pub keep_all: bool,
  pub default_uid: u32,
  #[serde(default)]
  pub log_dir: Option<String>,
  #[serde(default)]
  pub purge_after: u64,
  #[serde(default = "default_implicit_decision")]
  pub implicit_decision: String,
  #[serde(default)]
  accounts: Vec<RawAccount>,
  #[serde(default)]
  actions: Vec<RawAction>,
}

/// Builds concrete implementations of the out-of-scope interfaces by name. The binary links in
/// whatever predicates/backends/deliver-actions it supports and registers them here; config.rs
/// itself knows nothing about IMAP, maildir, regex header matching, etc.
pub trait Registry {
  fn fetch_backend(&self, name: &str) -> anyhow::Result<Arc<dyn FetchBackend>>;
  fn deliver_action(&self, name: &str) -> anyhow::Result<Arc<dyn DeliverAction>>;
  fn predicate(&self, name: &str, args: &[String]) -> anyhow::Result<Box<dyn MatchPredicate>>;
}

pub struct Config {
  pub keep_all: bool,
  pub default_uid: u32,
  pub purge_after: u64,
  pub implicit_decision: crate::mail::ImplicitDecision,
  pub accounts: Vec<Account>,
  pub account_rules: Vec<Vec<Rule>>,
  pub actions: Vec<Action>,
}

pub fn load(path: &Path, registry: &dyn Registry) -> anyhow::Result<Config> {
  let text = std::fs::read_to_string(path)
    .with_context(|| format!("couldn't read config file {path:?}"))?;
  let raw: RawConfig =
    toml::from_str(&text).with_context(|| format!("couldn't parse config file {path:?}"))?;
  build(raw, registry)
}

fn build(raw: RawConfig, registry: &dyn Registry) -> anyhow::Result<Config> {
  let actions = raw
    .actions
    .into_iter()
    .map(|a| {
      Ok(Action {
        deliver: registry
          .deliver_action(&a.backend)
          .with_context(|| format!("action {:?} deliver backend {:?}", a.name, a.backend))?,
        uid_policy: uid_policy(a.find_uid, a.users),
        name: a.name,
      })
    })
    .collect::<anyhow::Result<Vec<_>>>()?;

  let mut accounts = Vec::with_capacity(raw.accounts.len());
  let mut account_rules = Vec::with_capacity(raw.accounts.len());
  for raw_account in raw.accounts {
    let backend = registry
      .fetch_backend(&raw_account.backend)
      .with_context(|| format!("account {:?} fetch backend", raw_account.name))?;
    let mut account = Account::new(raw_account.name.clone(), backend);
    account.keep = raw_account.keep;
    account.del_big = raw_account.del_big;
    account.no_received = raw_account.no_received;
    account.uid_policy = uid_policy(raw_account.find_uid, raw_account.users);

    let mut next_idx = 1;
    let rules = build_rules(raw_account.rules, registry, &mut next_idx)?;
    accounts.push(account);
    account_rules.push(rules);
  }

  let implicit_decision = match raw.implicit_decision.as_str() {
    "keep" => crate::mail::ImplicitDecision::Keep,
    "drop" => crate::mail::ImplicitDecision::Drop,
    _ => crate::mail::ImplicitDecision::NoChoice,
  };

  Ok(Config {
    keep_all: raw.keep_all,
    default_uid: raw.default_uid,
    purge_after: raw.purge_after,
    implicit_decision,
    accounts,
    account_rules,
    actions,
  })
}

fn build_rules(
  raw_rules: Vec<RawRule>,
  registry: &dyn Registry,
  next_idx: &mut usize,
) -> anyhow::Result<Vec<Rule>> {
  raw_rules
    .into_iter()
    .map(|raw_rule| {
      let idx = *next_idx;
      *next_idx += 1;
      let kind = match raw_rule.r#type.as_str() {
        "all" => RuleKind::All,
        "expression" => {
          let items = raw_rule
            .expr
            .into_iter()
            .map(|item| {
              Ok(ExprItem {
                predicate: registry
                  .predicate(&item.predicate, &item.args)
                  .with_context(|| format!("rule {idx} predicate {:?}", item.predicate))?,
                inverted: item.invert,
                operator: match item.op.as_str() {
                  "or" => Operator::Or,
                  "and" => Operator::And,
                  _ => Operator::None,
                },
              })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
          RuleKind::Expression(items)
        }
        other => anyhow::bail!("rule {idx} has unknown type {other:?}"),
      };
      Ok(Rule {
        idx,
        accounts: raw_rule.accounts,
        kind,
        key: raw_rule.key,
        value: raw_rule.value,
        actions: raw_rule.actions,
        rules: build_rules(raw_rule.rules, registry, next_idx)?,
        stop: raw_rule.stop,
        uid_policy: uid_policy(raw_rule.find_uid, raw_rule.users),
      })
    })
    .collect()
}
