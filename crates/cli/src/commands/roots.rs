//! Root management commands

use anyhow::{Context, Result};
use trawl::ipc::roots::{RootAddParams, RootListParams, RootRemoveParams};

use super::{absolute, connect};

pub async fn cmd_roots_add(path: &str, recurse: bool, exclude_globs: Vec<String>) -> Result<()> {
  let path = absolute(path)?.to_string_lossy().to_string();
  let client = connect().await?;
  let result = client
    .call(RootAddParams {
      path,
      recurse,
      exclude_globs,
    })
    .await
    .context("Failed to add root")?;

  println!("Added {}", result.path);
  Ok(())
}

pub async fn cmd_roots_remove(path: &str, cascade: bool) -> Result<()> {
  let path = absolute(path)?.to_string_lossy().to_string();
  let client = connect().await?;
  let result = client
    .call(RootRemoveParams { path, cascade })
    .await
    .context("Failed to remove root")?;

  println!("Removed {}", result.path);
  if result.dropped > 0 {
    println!("Dropped {} queued item(s)", result.dropped);
  }
  Ok(())
}

pub async fn cmd_roots_list() -> Result<()> {
  let client = connect().await?;
  let result = client.call(RootListParams).await.context("Failed to list roots")?;

  if result.roots.is_empty() {
    println!("No roots registered. Add one with `trawl roots add <path>`.");
    return Ok(());
  }

  for root in result.roots {
    let mut line = root.path;
    if !root.recurse {
      line.push_str("  (top level only)");
    }
    if !root.exclude_globs.is_empty() {
      line.push_str(&format!("  exclude: {}", root.exclude_globs.join(", ")));
    }
    println!("{line}");
  }
  Ok(())
}
