// https://cr.yp.to/proto/maildir.html - Maildir
//
// A minimal maildir writer used by the integration tests as a stand-in "deliver" backend: the
// concrete deliver actions are out of scope for the core (they live behind `DeliverAction`), this
// is just enough to drive `do_action` end to end in tests.

use anyhow::Context as _;
use std::{
  fs,
  io::Write as _,
  path, sync,
};

static COUNTER: sync::atomic::AtomicU64 = sync::atomic::AtomicU64::new(0);

#[derive(Debug)]
pub struct Maildir {
  path: path::PathBuf,
}

impl Maildir {
  pub fn new(path: &path::Path) -> anyhow::Result<Self> {
    for directory in &["cur", "new", "tmp"] {
      fs::create_dir_all(path.join(directory))
        .with_context(|| format!("couldn't create {path:?}/{directory}"))?;
    }
    Ok(Self {
      path: path.to_path_buf(),
    })
  }

  pub fn path(&self) -> &path::Path {
    self.path.as_path()
  }

  pub fn deliver(&self, bytes: &[u8]) -> anyhow::Result<path::PathBuf> {
    let name = format!(
      "{}.mailchild_test",
      COUNTER.fetch_add(1, sync::atomic::Ordering::Relaxed)
    );
    let tmp = self.path.join("tmp").join(&name);
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    let new = self.path.join("new").join(&name);
    fs::rename(&tmp, &new)?;
    Ok(new)
  }

  pub fn count(&self) -> anyhow::Result<(usize, usize)> {
    let count = |sub: &str| -> anyhow::Result<usize> {
      Ok(fs::read_dir(self.path.join(sub))?.count())
    };
    Ok((count("cur")?, count("new")?))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn deliver() -> anyhow::Result<()> {
    let directory = tempfile::tempdir()?;
    let maildir = Maildir::new(directory.path())?;
    maildir.deliver(b"hello")?;
    assert_eq!((0, 1), maildir.count()?);
    Ok(())
  }
}
