// Restricted glob matching for account names (`*`, `?`, case-insensitive). Translates the glob
// into an anchored regex rather than hand-rolling backtracking, since `regex` is already a
// dependency for the rule engine's own predicates.

use once_cell::sync::Lazy;
use std::{collections::HashMap, sync::Mutex};

static COMPILED: Lazy<Mutex<HashMap<String, regex::Regex>>> =
  Lazy::new(|| Mutex::new(HashMap::new()));

fn translate(pattern: &str) -> String {
  let mut out = String::with_capacity(pattern.len() * 2 + 2);
  out.push('^');
  for c in pattern.chars() {
    match c {
      '*' => out.push_str(".*"),
      '?' => out.push('.'),
      '.' | '+' | '(' | ')' | '|' | '[' | ']' | '{' | '}' | '^' | '$' | '\\' => {
        out.push('\\');
        out.push(c);
      }
      _ => out.push(c),
    }
  }
  out.push('$');
  out
}

/// Matches `name` against `pattern` case-insensitively. Compiled regexes are cached by pattern
/// text since the same account-glob list is evaluated against every rule, for every mail.
pub fn matches(pattern: &str, name: &str) -> bool {
  let mut cache = COMPILED.lock().expect("glob cache poisoned");
  let regex = cache.entry(pattern.to_string()).or_insert_with(|| {
    regex::RegexBuilder::new(&translate(pattern))
      .case_insensitive(true)
      .build()
      .unwrap_or_else(|_| regex::Regex::new("$^").expect("unreachable fallback regex"))
  });
  regex.is_match(name)
}

/// True if `patterns` is empty (matches any account) or any pattern matches `name` (spec §4.3
/// step 1).
pub fn matches_any(patterns: &[String], name: &str) -> bool {
  patterns.is_empty() || patterns.iter().any(|p| matches(p, name))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn star_and_question() {
    assert!(matches("work-*", "work-imap"));
    assert!(matches("w?rk", "work"));
    assert!(!matches("w?rk", "wrk"));
  }

  #[test]
  fn case_insensitive() {
    assert!(matches("Work-*", "WORK-imap"));
  }

  #[test]
  fn empty_matches_any() {
    assert!(matches_any(&[], "anything"));
    assert!(!matches_any(&["foo".to_string()], "bar"));
  }

  #[test]
  fn literal_dots_are_escaped() {
    assert!(!matches("a.b", "axb"));
    assert!(matches("a.b", "a.b"));
  }
}
