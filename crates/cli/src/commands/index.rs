//! Index commands

use anyhow::{Context, Result};
use trawl::ipc::index::{IndexFileParams, ReindexParams};

use super::{absolute, connect};

/// Index one file or directory ahead of the crawl
pub async fn cmd_index(target: &str) -> Result<()> {
  let uri = if target.starts_with("file:") {
    target.to_string()
  } else {
    absolute(target)?.to_string_lossy().to_string()
  };

  let client = connect().await?;
  let result = client
    .call(IndexFileParams { uri })
    .await
    .context("Failed to index file")?;

  println!("Queued {}", result.uri);
  Ok(())
}

/// Re-extract every file whose content type matches one of `types`
pub async fn cmd_reindex(types: Vec<String>) -> Result<()> {
  let client = connect().await?;
  let result = client
    .call(ReindexParams { types })
    .await
    .context("Failed to reindex")?;

  println!("Queued {} file(s) for re-extraction", result.queued);
  Ok(())
}
