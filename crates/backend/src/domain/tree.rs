//! IndexingTree - which directories are in scope for indexing
//!
//! Pure data plus matching. The tree holds the registered roots, each with a
//! recurse flag and an exclusion filter; nothing here touches the filesystem.
//!
//! A path is in scope when:
//! 1. Some registered root is an ancestor of (or equal to) the path
//! 2. The path is an immediate child of that root, or the root recurses
//! 3. The root's filter does not exclude any component of the relative path

use std::{
  collections::BTreeMap,
  path::{Path, PathBuf},
  sync::Arc,
};

use globset::{Glob, GlobSet, GlobSetBuilder};
use parking_lot::RwLock;

use super::content::{self, MimePattern, PatternError};

/// Errors raised while registering roots
#[derive(Debug, thiserror::Error)]
pub enum TreeError {
  #[error("Root must be an absolute path: {0}")]
  RelativePath(PathBuf),

  #[error("Invalid exclude glob: {0}")]
  Glob(#[from] globset::Error),

  #[error(transparent)]
  Pattern(#[from] PatternError),

  #[error("Root {path} (recurse={recurse}) conflicts with nested root {other} (recurse={other_recurse})")]
  ConflictingRecurse {
    path: PathBuf,
    recurse: bool,
    other: PathBuf,
    other_recurse: bool,
  },
}

// ============================================================================
// RootFilter
// ============================================================================

/// Exclusion rules attached to a root
#[derive(Debug, Clone)]
pub struct RootFilter {
  globs: Vec<String>,
  glob_set: GlobSet,
  mime: Vec<MimePattern>,
  ignore_hidden: bool,
}

impl RootFilter {
  /// Build a filter from glob strings and content-type patterns.
  ///
  /// Globs are matched against every component name of the path relative to
  /// the root and against the relative path as a whole, so both `*.tmp` and
  /// `build/**` behave as expected.
  pub fn new(globs: &[String], mime: &[String], ignore_hidden: bool) -> Result<Self, TreeError> {
    let mut builder = GlobSetBuilder::new();
    for glob in globs {
      builder.add(Glob::new(glob)?);
    }

    let mime = mime
      .iter()
      .map(|p| MimePattern::parse(p))
      .collect::<Result<Vec<_>, _>>()?;

    Ok(Self {
      globs: globs.to_vec(),
      glob_set: builder.build()?,
      mime,
      ignore_hidden,
    })
  }

  /// A filter that excludes nothing
  pub fn none() -> Self {
    Self {
      globs: Vec::new(),
      glob_set: GlobSet::empty(),
      mime: Vec::new(),
      ignore_hidden: false,
    }
  }

  pub fn globs(&self) -> &[String] {
    &self.globs
  }

  /// Whether `relative` (a path below the root) is excluded.
  pub fn excludes(&self, relative: &Path) -> bool {
    if self.glob_set.is_match(relative) {
      return true;
    }

    for component in relative.iter() {
      if self.ignore_hidden && component.to_string_lossy().starts_with('.') {
        return true;
      }
      if self.glob_set.is_match(Path::new(component)) {
        return true;
      }
    }

    if !self.mime.is_empty() {
      let content_type = content::guess(relative, false);
      if self.mime.iter().any(|p| p.matches(&content_type)) {
        return true;
      }
    }

    false
  }
}

// ============================================================================
// IndexingRoot / IndexingTree
// ============================================================================

/// Read-mostly handle shared by the scheduler, crawler and pipeline
pub type SharedTree = Arc<RwLock<IndexingTree>>;

/// A directory registered for indexing. Immutable once added.
#[derive(Debug, Clone)]
pub struct IndexingRoot {
  pub path: PathBuf,
  pub recurse: bool,
  pub filter: RootFilter,
}

/// The set of registered roots
#[derive(Debug, Clone, Default)]
pub struct IndexingTree {
  roots: BTreeMap<PathBuf, IndexingRoot>,
}

impl IndexingTree {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a root. Re-registering the exact same path replaces it.
  pub fn add_root(&mut self, path: PathBuf, recurse: bool, filter: RootFilter) -> Result<(), TreeError> {
    if !path.is_absolute() {
      return Err(TreeError::RelativePath(path));
    }

    let nested_conflict = self
      .roots
      .values()
      .filter(|other| other.path != path)
      .find(|other| (path.starts_with(&other.path) || other.path.starts_with(&path)) && other.recurse != recurse);

    if let Some(other) = nested_conflict {
      return Err(TreeError::ConflictingRecurse {
        path,
        recurse,
        other: other.path.clone(),
        other_recurse: other.recurse,
      });
    }

    self.roots.insert(path.clone(), IndexingRoot { path, recurse, filter });
    Ok(())
  }

  /// Remove a root by its exact path. Sub-paths of a root are not roots.
  pub fn remove_root(&mut self, path: &Path) -> bool {
    self.roots.remove(path).is_some()
  }

  /// The innermost root containing `path`, if any
  pub fn matching_root(&self, path: &Path) -> Option<&IndexingRoot> {
    path.ancestors().find_map(|ancestor| self.roots.get(ancestor))
  }

  pub fn is_in_scope(&self, path: &Path) -> bool {
    let Some(root) = self.matching_root(path) else {
      return false;
    };

    let Ok(relative) = path.strip_prefix(&root.path) else {
      return false;
    };

    if relative.as_os_str().is_empty() {
      return true;
    }

    if !root.recurse && relative.components().count() > 1 {
      return false;
    }

    !root.filter.excludes(relative)
  }

  pub fn is_root(&self, path: &Path) -> bool {
    self.roots.contains_key(path)
  }

  pub fn roots(&self) -> impl Iterator<Item = &IndexingRoot> {
    self.roots.values()
  }

  pub fn len(&self) -> usize {
    self.roots.len()
  }

  pub fn is_empty(&self) -> bool {
    self.roots.is_empty()
  }
}
