// Template interpolation (spec §1: "string interpolation... consumed as pure utilities"). Rule
// `key`/`value` templates, action-name templates, and the `Received:` header template are all
// interpolated through this one small function; it is deliberately not a general templating
// engine.
//
// Recognized placeholders:
//   %{tag:NAME}     the current value of tag NAME, or empty if unset
//   %{hdr:NAME}     the first value of header NAME (untrimmed), or empty if absent
//   %{1}..%{9}      the Nth capture group of the mail's most recent regex match (`rml`)
//   %%              a literal `%`

use crate::mail::Mail;

/// Interpolates `template` against `mail`'s tags, headers and `rml` cache. Returns `Ok(None)` only
/// when the caller should treat the empty result as "no value" (used by rule tagging, spec §4.3
/// step 3); all other callers use `Ok(Some(_))`'s string directly, empty or not.
pub fn interpolate(template: &str, mail: &Mail) -> anyhow::Result<String> {
  let mut out = String::with_capacity(template.len());
  let mut chars = template.chars().peekable();
  while let Some(c) = chars.next() {
    if c != '%' {
      out.push(c);
      continue;
    }
    match chars.peek() {
      Some('%') => {
        chars.next();
        out.push('%');
      }
      Some('{') => {
        chars.next();
        let mut key = String::new();
        let mut closed = false;
        for c in chars.by_ref() {
          if c == '}' {
            closed = true;
            break;
          }
          key.push(c);
        }
        anyhow::ensure!(closed, "unterminated %{{...}} in template {template:?}");
        out.push_str(&resolve(&key, mail)?);
      }
      _ => anyhow::bail!("bare '%' in template {template:?}"),
    }
  }
  Ok(out)
}

fn resolve(key: &str, mail: &Mail) -> anyhow::Result<String> {
  if let Some(name) = key.strip_prefix("tag:") {
    return Ok(mail.tags.get(name).unwrap_or("").to_string());
  }
  if let Some(name) = key.strip_prefix("hdr:") {
    return Ok(mail.find_header(name, false).unwrap_or_default());
  }
  if let Ok(n) = key.parse::<usize>() {
    anyhow::ensure!(n >= 1 && n <= 9, "capture index {n} out of range 1..=9");
    return Ok(mail
      .rml
      .get(n - 1)
      .cloned()
      .flatten()
      .unwrap_or_default());
  }
  anyhow::bail!("unknown placeholder %{{{key}}}")
}
