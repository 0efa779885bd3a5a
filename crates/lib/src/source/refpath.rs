//! SLS reference path normalization (dotted refs vs slash paths).
//!
//! References are written dotted (`infra.network`) while files live at slash
//! paths (`infra/network.sls`). Literal dots inside a path segment are escaped
//! with a private-use placeholder character while slashes and dots swap roles,
//! so the transformation round-trips. Leading `../` segments map to leading
//! dots in the reference form.

/// Private-use placeholder standing in for a literal dot during transformation.
const DOT_MARK: char = '\u{f8ff}';

/// Convert a filesystem-style reference (`dir/file`) into the dotted canonical
/// form (`dir.file`). Literal dots in the path survive as [`DOT_MARK`] so
/// [`de_normalize`] can restore them.
pub fn normalize(path: &str) -> String {
  let mut rest = path;
  let mut lead = String::new();
  while let Some(stripped) = rest.strip_prefix("../") {
    lead.push('.');
    rest = stripped;
  }

  let escaped: String = rest.chars().map(|c| if c == '.' { DOT_MARK } else { c }).collect();
  format!("{lead}{}", escaped.replace('/', "."))
}

/// Inverse of [`normalize`]: dotted reference back to a slash path. Leading
/// dots become `../` segments and placeholder characters become literal dots.
pub fn de_normalize(refr: &str) -> String {
  let mut rest = refr;
  let mut lead = String::new();
  while let Some(stripped) = rest.strip_prefix('.') {
    lead.push_str("../");
    rest = stripped;
  }

  let path = rest.replace('.', "/");
  format!("{lead}{}", path.replace(DOT_MARK, "."))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn normalize_swaps_slashes_for_dots() {
    assert_eq!(normalize("infra/network"), "infra.network");
    assert_eq!(normalize("single"), "single");
  }

  #[test]
  fn de_normalize_swaps_dots_for_slashes() {
    assert_eq!(de_normalize("infra.network"), "infra/network");
    assert_eq!(de_normalize("single"), "single");
  }

  #[test]
  fn literal_dots_round_trip() {
    let path = "conf/app.d/main";
    assert_eq!(de_normalize(&normalize(path)), path);
  }

  #[test]
  fn parent_segments_round_trip() {
    let path = "../../shared/base";
    let refr = normalize(path);
    assert_eq!(refr, "..shared.base");
    assert_eq!(de_normalize(&refr), path);
  }

  #[test]
  fn round_trip_holds_for_plain_paths() {
    for path in ["a", "a/b", "a/b/c", "../x", "dir.with.dots/file", "a/b.c"] {
      assert_eq!(de_normalize(&normalize(path)), path, "round-trip failed for {path}");
    }
  }
}
