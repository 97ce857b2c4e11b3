//! Metadata store seam
//!
//! The pipeline only ever talks to the store through [`Store`]: submit facts
//! about a subject, delete or move a subject, and run one of a small set of
//! queries. The daemon ships with [`MemoryStore`].

mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use memory::MemoryStore;

/// Predicate names used by the pipeline and built-in backends
pub mod predicate {
  pub const URL: &str = "nie:url";
  pub const MIME_TYPE: &str = "nie:mimeType";
  pub const FILE_SIZE: &str = "nfo:fileSize";
  pub const LAST_MODIFIED: &str = "nfo:fileLastModified";
  pub const CONTAINER: &str = "nfo:belongsToContainer";
  pub const TITLE: &str = "nie:title";
  pub const PLAIN_TEXT: &str = "nie:plainTextContent";
  pub const LINE_COUNT: &str = "nfo:lineCount";
  pub const WORD_COUNT: &str = "nfo:wordCount";
  pub const CHARACTER_COUNT: &str = "nfo:characterCount";
  pub const WIDTH: &str = "nfo:width";
  pub const HEIGHT: &str = "nfo:height";
  pub const IMAGE_FORMAT: &str = "nfo:imageFormat";
  pub const ENTRY_COUNT: &str = "nfo:entryCounter";
}

/// A single `(predicate, object)` fact about a subject
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statement {
  pub predicate: String,
  pub object: String,
}

impl Statement {
  pub fn new(predicate: impl Into<String>, object: impl ToString) -> Self {
    Self {
      predicate: predicate.into(),
      object: object.to_string(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
  /// Subjects whose content type matches any of the patterns (`text/plain`, `image/*`)
  ContentTypes(Vec<String>),
  /// Subjects strictly below a container URI
  Descendants(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
  pub uri: String,
  pub content_type: Option<String>,
}

/// What the store remembers about an indexed file, for incremental crawls
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedFile {
  pub last_modified: Option<String>,
  pub content_type: Option<String>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
  #[error("Store rejected submission for {subject}: {reason}")]
  Rejected { subject: String, reason: String },

  #[error("Invalid query: {0}")]
  InvalidQuery(String),

  #[error("Store unavailable: {0}")]
  Unavailable(String),
}

#[async_trait]
pub trait Store: Send + Sync {
  /// Replace everything known about `subject` with `statements`
  async fn submit_facts(&self, subject: &str, statements: Vec<Statement>) -> Result<(), StoreError>;

  async fn submit_deletion(&self, subject: &str) -> Result<(), StoreError>;

  /// Rename `from` (and everything below it) to `to`, keeping the facts
  async fn submit_move(&self, from: &str, to: &str) -> Result<(), StoreError>;

  async fn run_query(&self, query: &Query) -> Result<Vec<Row>, StoreError>;

  async fn lookup(&self, subject: &str) -> Result<Option<IndexedFile>, StoreError>;
}
