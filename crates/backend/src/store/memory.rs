use std::{
  collections::BTreeMap,
  sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::trace;

use super::{IndexedFile, Query, Row, Statement, Store, StoreError, predicate};
use crate::domain::content::MimePattern;

/// In-process store keyed by subject URI
#[derive(Debug, Default)]
pub struct MemoryStore {
  subjects: RwLock<BTreeMap<String, Vec<Statement>>>,
  read_only: AtomicBool,
}

fn descendant_prefix(uri: &str) -> String {
  format!("{}/", uri.trim_end_matches('/'))
}

fn object_of<'a>(statements: &'a [Statement], predicate: &str) -> Option<&'a str> {
  statements
    .iter()
    .find(|s| s.predicate == predicate)
    .map(|s| s.object.as_str())
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Reject every submission until switched back
  pub fn set_read_only(&self, read_only: bool) {
    self.read_only.store(read_only, Ordering::SeqCst);
  }

  pub fn len(&self) -> usize {
    self.subjects.read().len()
  }

  pub fn is_empty(&self) -> bool {
    self.subjects.read().is_empty()
  }

  pub fn contains(&self, subject: &str) -> bool {
    self.subjects.read().contains_key(subject)
  }

  pub fn statements(&self, subject: &str) -> Option<Vec<Statement>> {
    self.subjects.read().get(subject).cloned()
  }

  /// First object for `predicate` on `subject`
  pub fn object(&self, subject: &str, predicate: &str) -> Option<String> {
    let subjects = self.subjects.read();
    object_of(subjects.get(subject)?, predicate).map(str::to_string)
  }

  pub fn subjects(&self) -> Vec<String> {
    self.subjects.read().keys().cloned().collect()
  }

  fn check_writable(&self, subject: &str) -> Result<(), StoreError> {
    if self.read_only.load(Ordering::SeqCst) {
      return Err(StoreError::Rejected {
        subject: subject.to_string(),
        reason: "store is read-only".to_string(),
      });
    }
    Ok(())
  }
}

#[async_trait]
impl Store for MemoryStore {
  async fn submit_facts(&self, subject: &str, statements: Vec<Statement>) -> Result<(), StoreError> {
    self.check_writable(subject)?;
    trace!(subject, count = statements.len(), "Storing facts");
    self.subjects.write().insert(subject.to_string(), statements);
    Ok(())
  }

  async fn submit_deletion(&self, subject: &str) -> Result<(), StoreError> {
    self.check_writable(subject)?;
    self.subjects.write().remove(subject);
    Ok(())
  }

  async fn submit_move(&self, from: &str, to: &str) -> Result<(), StoreError> {
    self.check_writable(from)?;

    let from_prefix = descendant_prefix(from);
    let rewrite = |uri: &str| -> Option<String> {
      if uri == from {
        Some(to.to_string())
      } else {
        uri
          .strip_prefix(&from_prefix)
          .map(|rest| format!("{}{}", descendant_prefix(to), rest))
      }
    };

    let mut subjects = self.subjects.write();
    let moved: Vec<String> = subjects
      .keys()
      .filter(|uri| rewrite(uri).is_some())
      .cloned()
      .collect();

    for old in moved {
      let Some(mut statements) = subjects.remove(&old) else {
        continue;
      };
      for statement in &mut statements {
        if (statement.predicate == predicate::URL || statement.predicate == predicate::CONTAINER)
          && let Some(new_object) = rewrite(&statement.object)
        {
          statement.object = new_object;
        }
      }
      if let Some(new_uri) = rewrite(&old) {
        subjects.insert(new_uri, statements);
      }
    }

    Ok(())
  }

  async fn run_query(&self, query: &Query) -> Result<Vec<Row>, StoreError> {
    let subjects = self.subjects.read();
    let row = |uri: &String, statements: &Vec<Statement>| Row {
      uri: uri.clone(),
      content_type: object_of(statements, predicate::MIME_TYPE).map(str::to_string),
    };

    match query {
      Query::ContentTypes(types) => {
        let patterns = types
          .iter()
          .map(|t| MimePattern::parse(t))
          .collect::<Result<Vec<_>, _>>()
          .map_err(|e| StoreError::InvalidQuery(e.to_string()))?;

        Ok(
          subjects
            .iter()
            .filter(|(_, statements)| {
              object_of(statements, predicate::MIME_TYPE).is_some_and(|ct| patterns.iter().any(|p| p.matches(ct)))
            })
            .map(|(uri, statements)| row(uri, statements))
            .collect(),
        )
      }
      Query::Descendants(container) => {
        let prefix = descendant_prefix(container);
        Ok(
          subjects
            .range(prefix.clone()..)
            .take_while(|(uri, _)| uri.starts_with(&prefix))
            .map(|(uri, statements)| row(uri, statements))
            .collect(),
        )
      }
    }
  }

  async fn lookup(&self, subject: &str) -> Result<Option<IndexedFile>, StoreError> {
    let subjects = self.subjects.read();
    Ok(subjects.get(subject).map(|statements| IndexedFile {
      last_modified: object_of(statements, predicate::LAST_MODIFIED).map(str::to_string),
      content_type: object_of(statements, predicate::MIME_TYPE).map(str::to_string),
    }))
  }
}
