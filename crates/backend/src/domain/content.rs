//! Content types and file URIs
//!
//! Content types are guessed from the path (never sniffed from disk here) and
//! normalized before matching against backend patterns.

use std::{
  fmt,
  path::{Path, PathBuf},
  time::SystemTime,
};

use chrono::{DateTime, SecondsFormat, Utc};
use url::Url;

/// Content type reported for directories
pub const DIRECTORY_MIME: &str = "inode/directory";

/// Fallback when nothing better is known
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Lowercase a content type and strip any parameters (`; charset=...`).
pub fn normalize(content_type: &str) -> String {
  content_type
    .split(';')
    .next()
    .unwrap_or_default()
    .trim()
    .to_ascii_lowercase()
}

/// Guess the normalized content type of a path.
pub fn guess(path: &Path, is_dir: bool) -> String {
  if is_dir {
    return DIRECTORY_MIME.to_string();
  }

  mime_guess::from_path(path)
    .first()
    .map(|mime| normalize(mime.essence_str()))
    .unwrap_or_else(|| OCTET_STREAM.to_string())
}

// ============================================================================
// Patterns
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Malformed content type pattern: {0:?}")]
pub struct PatternError(pub String);

/// A content-type matcher from the backend table or a root filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MimePattern {
  /// `type/subtype`
  Exact(String),
  /// `type/*`
  Family(String),
  /// `*` or `*/*`
  Any,
}

impl MimePattern {
  pub fn parse(raw: &str) -> Result<Self, PatternError> {
    let pattern = normalize(raw);
    if pattern == "*" || pattern == "*/*" {
      return Ok(Self::Any);
    }

    let Some((family, subtype)) = pattern.split_once('/') else {
      return Err(PatternError(raw.to_string()));
    };

    let valid = |s: &str| !s.is_empty() && !s.contains(['/', ' ', '*']);
    match subtype {
      "*" if valid(family) => Ok(Self::Family(family.to_string())),
      _ if valid(family) && valid(subtype) => Ok(Self::Exact(pattern)),
      _ => Err(PatternError(raw.to_string())),
    }
  }

  /// Whether this pattern accepts an already-normalized content type
  pub fn matches(&self, content_type: &str) -> bool {
    match self {
      Self::Exact(exact) => exact == content_type,
      Self::Family(family) => content_type
        .split_once('/')
        .is_some_and(|(f, _)| f == family),
      Self::Any => true,
    }
  }

  /// Higher is more specific
  pub fn specificity(&self) -> u8 {
    match self {
      Self::Exact(_) => 2,
      Self::Family(_) => 1,
      Self::Any => 0,
    }
  }
}

impl fmt::Display for MimePattern {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Exact(exact) => write!(f, "{exact}"),
      Self::Family(family) => write!(f, "{family}/*"),
      Self::Any => write!(f, "*/*"),
    }
  }
}

// ============================================================================
// URIs and timestamps
// ============================================================================

/// `file://` URI for an absolute path, `None` for relative paths.
pub fn path_to_uri(path: &Path) -> Option<String> {
  Url::from_file_path(path).ok().map(String::from)
}

/// Accepts either a `file://` URI or an absolute path.
pub fn uri_to_path(uri: &str) -> Option<PathBuf> {
  if uri.starts_with("file:") {
    return Url::parse(uri).ok()?.to_file_path().ok();
  }

  let path = PathBuf::from(uri);
  path.is_absolute().then_some(path)
}

/// Stable textual form of a modification time, used for change detection.
pub fn format_mtime(mtime: SystemTime) -> String {
  DateTime::<Utc>::from(mtime).to_rfc3339_opts(SecondsFormat::Nanos, true)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_normalize_strips_parameters() {
    assert_eq!(normalize("Text/Plain; charset=UTF-8"), "text/plain");
    assert_eq!(normalize("image/JPEG"), "image/jpeg");
  }

  #[test]
  fn test_guess() {
    assert_eq!(guess(Path::new("/docs/a.txt"), false), "text/plain");
    assert_eq!(guess(Path::new("/docs/b.jpg"), false), "image/jpeg");
    assert_eq!(guess(Path::new("/docs/unknown.zzqx"), false), OCTET_STREAM);
    assert_eq!(guess(Path::new("/docs"), true), DIRECTORY_MIME);
  }

  #[test]
  fn test_pattern_parse_and_specificity() {
    assert_eq!(MimePattern::parse("text/plain"), Ok(MimePattern::Exact("text/plain".into())));
    assert_eq!(MimePattern::parse("image/*"), Ok(MimePattern::Family("image".into())));
    assert_eq!(MimePattern::parse("*/*"), Ok(MimePattern::Any));
    assert_eq!(MimePattern::parse("*"), Ok(MimePattern::Any));

    assert!(MimePattern::parse("text").is_err());
    assert!(MimePattern::parse("/plain").is_err());
    assert!(MimePattern::parse("text/").is_err());
    assert!(MimePattern::parse("*/plain").is_err());

    assert!(MimePattern::Exact("a/b".into()).specificity() > MimePattern::Family("a".into()).specificity());
    assert!(MimePattern::Family("a".into()).specificity() > MimePattern::Any.specificity());
  }

  #[test]
  fn test_pattern_matches() {
    let family = MimePattern::parse("text/*").expect("valid");
    assert!(family.matches("text/plain"));
    assert!(family.matches("text/markdown"));
    assert!(!family.matches("image/png"));
    assert!(!family.matches("textual/plain"));

    let exact = MimePattern::parse("text/plain").expect("valid");
    assert!(exact.matches("text/plain"));
    assert!(!exact.matches("text/html"));
  }

  #[test]
  fn test_uri_round_trip() {
    let uri = path_to_uri(Path::new("/docs/a file.txt")).expect("absolute path");
    assert_eq!(uri, "file:///docs/a%20file.txt");
    assert_eq!(uri_to_path(&uri), Some(PathBuf::from("/docs/a file.txt")));
    assert_eq!(uri_to_path("/docs/b.jpg"), Some(PathBuf::from("/docs/b.jpg")));
    assert_eq!(uri_to_path("relative/path"), None);
    assert_eq!(path_to_uri(Path::new("relative")), None);
  }
}
