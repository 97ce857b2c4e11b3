//! Built-in backends: plain text, images and directories

use std::io::Cursor;

use async_trait::async_trait;
use tracing::debug;

use super::{ConcurrencyModel, ExtractError, ExtractRequest, ExtractionBackend};
use crate::store::{Statement, predicate};

/// Upper bound on `nie:plainTextContent`
const MAX_PLAIN_TEXT_BYTES: usize = 1024 * 1024;

const MAX_TITLE_CHARS: usize = 256;

fn truncate_at_char_boundary(text: &str, max: usize) -> &str {
  if text.len() <= max {
    return text;
  }
  let mut end = max;
  while !text.is_char_boundary(end) {
    end -= 1;
  }
  &text[..end]
}

// ============================================================================
// Text
// ============================================================================

pub struct TextBackend;

#[async_trait]
impl ExtractionBackend for TextBackend {
  fn name(&self) -> &str {
    "text"
  }

  async fn extract(&self, request: ExtractRequest) -> Result<Vec<Statement>, ExtractError> {
    let bytes = tokio::fs::read(&request.path)
      .await
      .map_err(|e| ExtractError::io(&request.path, e))?;
    if request.cancel.is_cancelled() {
      return Err(ExtractError::Cancelled);
    }

    let text = String::from_utf8_lossy(&bytes);
    let mut facts = vec![
      Statement::new(predicate::LINE_COUNT, text.lines().count()),
      Statement::new(predicate::WORD_COUNT, text.split_whitespace().count()),
      Statement::new(predicate::CHARACTER_COUNT, text.chars().count()),
    ];

    if let Some(first) = text.lines().map(str::trim).find(|line| !line.is_empty()) {
      let title: String = first.chars().take(MAX_TITLE_CHARS).collect();
      facts.push(Statement::new(predicate::TITLE, title));
    }
    facts.push(Statement::new(
      predicate::PLAIN_TEXT,
      truncate_at_char_boundary(&text, MAX_PLAIN_TEXT_BYTES),
    ));

    Ok(facts)
  }
}

// ============================================================================
// Image
// ============================================================================

pub struct ImageBackend;

/// Format and, when the header is intact, pixel dimensions
fn sniff_image(bytes: &[u8]) -> Result<(image::ImageFormat, Option<(u32, u32)>), ExtractError> {
  let format = image::guess_format(bytes).map_err(|e| ExtractError::Unsupported(e.to_string()))?;
  let dimensions = image::ImageReader::with_format(Cursor::new(bytes), format)
    .into_dimensions()
    .ok();
  Ok((format, dimensions))
}

#[async_trait]
impl ExtractionBackend for ImageBackend {
  fn name(&self) -> &str {
    "image"
  }

  async fn extract(&self, request: ExtractRequest) -> Result<Vec<Statement>, ExtractError> {
    let bytes = tokio::fs::read(&request.path)
      .await
      .map_err(|e| ExtractError::io(&request.path, e))?;

    let (format, dimensions) = tokio::task::spawn_blocking(move || sniff_image(&bytes))
      .await
      .map_err(|e| ExtractError::Failed(format!("Task join error: {e}")))??;

    let mut facts = vec![Statement::new(
      predicate::IMAGE_FORMAT,
      format!("{format:?}").to_lowercase(),
    )];
    match dimensions {
      Some((width, height)) => {
        facts.push(Statement::new(predicate::WIDTH, width));
        facts.push(Statement::new(predicate::HEIGHT, height));
      }
      None => debug!(path = %request.path.display(), ?format, "Image header has no readable dimensions"),
    }

    Ok(facts)
  }
}

// ============================================================================
// Directory
// ============================================================================

pub struct DirectoryBackend;

#[async_trait]
impl ExtractionBackend for DirectoryBackend {
  fn name(&self) -> &str {
    "directory"
  }

  fn default_concurrency(&self) -> ConcurrencyModel {
    ConcurrencyModel::None
  }

  async fn extract(&self, request: ExtractRequest) -> Result<Vec<Statement>, ExtractError> {
    let mut entries = tokio::fs::read_dir(&request.path)
      .await
      .map_err(|e| ExtractError::io(&request.path, e))?;

    let mut count = 0usize;
    while entries
      .next_entry()
      .await
      .map_err(|e| ExtractError::io(&request.path, e))?
      .is_some()
    {
      count += 1;
    }

    Ok(vec![Statement::new(predicate::ENTRY_COUNT, count)])
  }
}
