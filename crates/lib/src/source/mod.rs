//! Document source resolution: mapping SLS references to file content.
//!
//! A [`SourceResolver`] owns an ordered list of source locations (local
//! directories) and resolves dotted references against them. When a reference
//! hits a real file, that file's parent directory is registered as an implicit
//! source so the document can `include` siblings without fully-qualified
//! source lists.

pub mod refpath;

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

/// File extension for SLS documents.
pub const SLS_EXT: &str = "sls";

#[derive(Debug, Error)]
pub enum SourceError {
  #[error("sls ref '{0}' matched no source location")]
  NotFound(String),

  #[error("sls ref '{refr}' is ambiguous under {location}: both {file} and {init} exist")]
  Ambiguous {
    refr: String,
    location: PathBuf,
    file: PathBuf,
    init: PathBuf,
  },

  #[error("failed to read {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

/// A successfully resolved document reference.
#[derive(Debug, Clone)]
pub struct ResolvedSource {
  /// Canonical dotted reference.
  pub refr: String,

  /// File the content was read from.
  pub path: PathBuf,

  /// Raw document bytes.
  pub content: Vec<u8>,
}

/// Resolves SLS references against an ordered list of source directories.
#[derive(Debug, Clone)]
pub struct SourceResolver {
  locations: Vec<PathBuf>,
}

impl SourceResolver {
  pub fn new(locations: Vec<PathBuf>) -> Self {
    Self { locations }
  }

  pub fn locations(&self) -> &[PathBuf] {
    &self.locations
  }

  /// Register an additional source location. No-op if already present.
  pub fn add_location(&mut self, dir: PathBuf) {
    if !self.locations.contains(&dir) {
      debug!(dir = %dir.display(), "registered implicit sls source");
      self.locations.push(dir);
    }
  }

  /// Resolve a dotted reference to its canonical name and raw content.
  ///
  /// For each location, two candidates are considered: `<ref-path>.sls` and
  /// `<ref-path>/init.sls` (the trailing-`init` package form). Both existing
  /// under one location is an error; the first location with a hit wins.
  pub fn resolve(&mut self, refr: &str) -> Result<ResolvedSource, SourceError> {
    let rel = refpath::de_normalize(refr);

    for location in self.locations.clone() {
      let file = location.join(format!("{rel}.{SLS_EXT}"));
      let init = location.join(&rel).join(format!("init.{SLS_EXT}"));

      match (file.is_file(), init.is_file()) {
        (true, true) => {
          return Err(SourceError::Ambiguous {
            refr: refr.to_string(),
            location,
            file,
            init,
          });
        }
        (true, false) => return self.read_hit(refr, file),
        (false, true) => return self.read_hit(refr, init),
        (false, false) => {}
      }
    }

    Err(SourceError::NotFound(refr.to_string()))
  }

  fn read_hit(&mut self, refr: &str, path: PathBuf) -> Result<ResolvedSource, SourceError> {
    let content = std::fs::read(&path).map_err(|source| SourceError::Read {
      path: path.clone(),
      source,
    })?;

    if let Some(parent) = path.parent() {
      self.add_location(parent.to_path_buf());
    }

    debug!(refr, path = %path.display(), bytes = content.len(), "resolved sls source");
    Ok(ResolvedSource {
      refr: refr.to_string(),
      path,
      content,
    })
  }
}

/// Convenience for tests and callers holding string paths.
pub fn locations_from<I, P>(paths: I) -> Vec<PathBuf>
where
  I: IntoIterator<Item = P>,
  P: AsRef<Path>,
{
  paths.into_iter().map(|p| p.as_ref().to_path_buf()).collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  fn write(dir: &Path, rel: &str, content: &str) {
    let path = dir.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
  }

  #[test]
  fn resolves_plain_file() {
    let tmp = TempDir::new().unwrap();
    write(tmp.path(), "web.sls", "web: {}");

    let mut resolver = SourceResolver::new(vec![tmp.path().to_path_buf()]);
    let hit = resolver.resolve("web").unwrap();
    assert_eq!(hit.refr, "web");
    assert_eq!(hit.content, b"web: {}");
  }

  #[test]
  fn resolves_dotted_ref_to_nested_path() {
    let tmp = TempDir::new().unwrap();
    write(tmp.path(), "infra/network.sls", "net: {}");

    let mut resolver = SourceResolver::new(vec![tmp.path().to_path_buf()]);
    let hit = resolver.resolve("infra.network").unwrap();
    assert!(hit.path.ends_with("infra/network.sls"));
  }

  #[test]
  fn resolves_init_package_form() {
    let tmp = TempDir::new().unwrap();
    write(tmp.path(), "app/init.sls", "app: {}");

    let mut resolver = SourceResolver::new(vec![tmp.path().to_path_buf()]);
    let hit = resolver.resolve("app").unwrap();
    assert!(hit.path.ends_with("app/init.sls"));
  }

  #[test]
  fn ambiguous_when_both_forms_exist() {
    let tmp = TempDir::new().unwrap();
    write(tmp.path(), "app.sls", "a: {}");
    write(tmp.path(), "app/init.sls", "b: {}");

    let mut resolver = SourceResolver::new(vec![tmp.path().to_path_buf()]);
    assert!(matches!(resolver.resolve("app"), Err(SourceError::Ambiguous { .. })));
  }

  #[test]
  fn missing_ref_is_not_found() {
    let tmp = TempDir::new().unwrap();
    let mut resolver = SourceResolver::new(vec![tmp.path().to_path_buf()]);
    assert!(matches!(resolver.resolve("ghost"), Err(SourceError::NotFound(_))));
  }

  #[test]
  fn hit_registers_parent_as_implicit_source() {
    let tmp = TempDir::new().unwrap();
    write(tmp.path(), "deep/nested/base.sls", "base: {}");
    write(tmp.path(), "deep/nested/sibling.sls", "sib: {}");

    let mut resolver = SourceResolver::new(vec![tmp.path().to_path_buf()]);
    resolver.resolve("deep.nested.base").unwrap();

    // Sibling is now reachable by short name through the implicit source.
    let hit = resolver.resolve("sibling").unwrap();
    assert!(hit.path.ends_with("deep/nested/sibling.sls"));
  }

  #[test]
  fn first_location_wins() {
    let a = TempDir::new().unwrap();
    let b = TempDir::new().unwrap();
    write(a.path(), "dup.sls", "from: a");
    write(b.path(), "dup.sls", "from: b");

    let mut resolver = SourceResolver::new(vec![a.path().to_path_buf(), b.path().to_path_buf()]);
    let hit = resolver.resolve("dup").unwrap();
    assert_eq!(hit.content, b"from: a");
  }
}
