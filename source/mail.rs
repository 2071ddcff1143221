// The per-message record (spec §3, §4.2). Owns the raw bytes, a tag map, the wrapped-line offsets
// and the keep/drop decision. One Mail exists per fetched message and is always destroyed before
// the next fetch or on any error exit (the orchestrator in child.rs enforces this by scope).

use anyhow::Context as _;
use std::fmt;

/// An ordered name -> value map with unique keys and stable insertion order. Tag counts per
/// message are tiny (a handful), so a `Vec` scanned linearly is both simpler and faster here than
/// a hash map.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Tags(Vec<(String, String)>);

impl Tags {
  pub fn new() -> Self {
    Self(Vec::new())
  }

  pub fn get(&self, key: &str) -> Option<&str> {
    self
      .0
      .iter()
      .find(|(k, _)| k == key)
      .map(|(_, v)| v.as_str())
  }

  /// Inserts or replaces `key`, preserving the key's original position on replace and appending on
  /// insert, matching the "keys unique, stable insertion order" invariant (spec §3).
  pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
    let key = key.into();
    match self.0.iter_mut().find(|(k, _)| *k == key) {
      Some((_, v)) => *v = value.into(),
      None => self.0.push((key, value.into())),
    }
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }
}

/// One of {DROP, KEEP}; the mail's decision always starts DROP (spec §3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
  Drop,
  Keep,
}

impl fmt::Display for Decision {
  fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
    match self {
      Decision::Drop => write!(formatter, "drop"),
      Decision::Keep => write!(formatter, "keep"),
    }
  }
}

/// What the implicit-decision configuration value resolves to when rule evaluation runs to
/// completion without `stop`ping (spec §4.3, design note "Decision as a tagged value").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImplicitDecision {
  Keep,
  Drop,
  /// No explicit configuration: resolves to KEEP, with a warning (spec §4.3).
  NoChoice,
}

/// A byte offset at which a soft line-wrap was replaced by `unwrapped_char`, paired with the
/// original byte so `set_wrapped` can restore either view (spec §4.2, "wrapped view / unwrapped
/// view" in the glossary).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Wrap {
  offset: usize,
  original: u8,
}

/// View the body is currently rendered in. Switching to `Unwrapped` is only legal during
/// expression evaluation (spec §3 invariant); the mail is always restored to `Wrapped` before
/// delivery or IPC transmit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum View {
  Wrapped,
  Unwrapped,
}

const MAX_LINE: usize = 998;

#[derive(Debug)]
pub struct Mail {
  bytes: Vec<u8>,
  size: usize,
  /// -1 (represented as `None`) until known; otherwise `0 <= body <= size` (spec §3 invariant).
  body: Option<usize>,
  pub tags: Tags,
  wraps: Vec<Wrap>,
  view: View,
  pub decision: Decision,
  /// The most recent regex match's capture groups, reused by successive tag/action-name
  /// interpolations within one rule evaluation (spec §3, "rml").
  pub rml: Vec<Option<String>>,
}

impl Mail {
  pub fn new(bytes: Vec<u8>) -> Self {
    let size = bytes.len();
    Self {
      bytes,
      size,
      body: None,
      tags: Tags::new(),
      wraps: Vec::new(),
      view: View::Wrapped,
      decision: Decision::Drop,
      rml: Vec::new(),
    }
  }

  pub fn bytes(&self) -> &[u8] {
    &self.bytes[..self.size]
  }

  pub fn size(&self) -> usize {
    self.size
  }

  pub fn body(&self) -> Option<usize> {
    self.body
  }

  fn header_end(&self) -> usize {
    let bytes = self.bytes();
    bytes
      .windows(4)
      .position(|w| w == b"\r\n\r\n")
      .map(|p| p + 4)
      .or_else(|| bytes.windows(2).position(|w| w == b"\n\n").map(|p| p + 2))
      .unwrap_or(bytes.len())
  }

  /// Strips a leading `From ` envelope line, if any (spec §4.2). Reduces `size` accordingly.
  pub fn trim_from(&mut self) {
    let bytes = self.bytes();
    if !bytes.starts_with(b"From ") {
      return;
    }
    let eol = bytes
      .iter()
      .position(|&b| b == b'\n')
      .map(|p| p + 1)
      .unwrap_or(bytes.len());
    self.bytes.copy_within(eol..self.size, 0);
    self.size -= eol;
    self.bytes.truncate(self.size);
  }

  /// Returns the first value of header `name`, case-insensitive, optionally trimmed of
  /// surrounding whitespace (spec §4.2).
  pub fn find_header(&self, name: &str, trim: bool) -> Option<String> {
    let header_end = self.header_end();
    let header_bytes = &self.bytes()[..header_end];
    let header = String::from_utf8_lossy(header_bytes);
    let name_lower = name.to_ascii_lowercase();
    let mut lines = header.split("\r\n").flat_map(|l| l.split('\n'));
    while let Some(line) = lines.next() {
      let Some((key, mut value)) = line.split_once(':') else {
        continue;
      };
      if key.trim().to_ascii_lowercase() != name_lower {
        continue;
      }
      let mut value = value.to_string();
      // Unfold continuation lines (leading whitespace) the way an unwrapped view would see them.
      loop {
        match lines.clone().next() {
          Some(next) if next.starts_with(' ') || next.starts_with('\t') => {
            value.push(' ');
            value.push_str(next.trim_start());
            lines.next();
          }
          _ => break,
        }
      }
      if trim {
        value = value.trim().to_string();
      }
      return Some(value);
    }
    None
  }

  /// Prepends a header line built from `line` (already formatted, sans CRLF). Fails if the
  /// resulting line would exceed 998 bytes (spec §4.2, §4.4.1).
  pub fn insert_header(&mut self, line: &str) -> anyhow::Result<()> {
    anyhow::ensure!(
      line.len() <= MAX_LINE,
      "header line ({} bytes) exceeds {MAX_LINE} bytes",
      line.len()
    );
    let mut prefixed = Vec::with_capacity(line.len() + 2 + self.size);
    prefixed.extend_from_slice(line.as_bytes());
    prefixed.extend_from_slice(b"\r\n");
    prefixed.extend_from_slice(self.bytes());
    let inserted = prefixed.len() - self.size;
    self.bytes = prefixed;
    self.size += inserted;
    if let Some(body) = &mut self.body {
      *body += inserted;
    }
    Ok(())
  }

  /// Scans the body for physical line-wraps (a line ending in a non-blank continuation) and
  /// records their positions. Returns the number found (spec §4.2).
  pub fn fill_wrapped(&mut self) -> usize {
    self.wraps.clear();
    let header_end = self.header_end();
    self.body = Some(header_end);
    let bytes = self.bytes();
    let mut i = header_end;
    while i + 1 < bytes.len() {
      if bytes[i] == b'\n' {
        let next = bytes[i + 1];
        if next != b'\n' && next != b'\r' && i > header_end {
          // A soft wrap: the preceding newline is the splice point.
          if bytes.get(i.wrapping_sub(1)) == Some(&b'\r') {
            self.wraps.push(Wrap {
              offset: i - 1,
              original: b'\r',
            });
          } else {
            self.wraps.push(Wrap {
              offset: i,
              original: b'\n',
            });
          }
        }
      }
      i += 1;
    }
    self.wraps.len()
  }

  /// Rewrites the recorded wrap points to `c` (space for evaluation, `\n`/original for transport).
  pub fn set_wrapped(&mut self, view: View) {
    let c = match view {
      View::Unwrapped => b' ',
      View::Wrapped => 0, // restored per-wrap below
    };
    for wrap in &self.wraps {
      self.bytes[wrap.offset] = if view == View::Unwrapped { c } else { wrap.original };
    }
    self.view = view;
  }

  pub fn view(&self) -> View {
    self.view
  }
}

impl Drop for Mail {
  fn drop(&mut self) {
    // Nothing beyond the Vec's own deallocation is owned here; this exists to document the
    // lifecycle invariant from spec §3 ("must be destroyed on every exit path") at the type level.
  }
}

pub fn format_header(name: &str, value: &str) -> anyhow::Result<String> {
  let line = format!("{name}: {value}");
  anyhow::ensure!(
    line.len() <= MAX_LINE,
    "header {name} ({} bytes) exceeds {MAX_LINE} bytes",
    line.len()
  );
  Ok(line)
}

pub fn truncate_field(value: &str, max: usize) -> String {
  if value.len() <= max {
    value.to_string()
  } else {
    value
      .char_indices()
      .take_while(|(i, _)| *i < max)
      .map(|(_, c)| c)
      .collect()
  }
}
