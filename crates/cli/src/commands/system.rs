//! Status and scheduling commands

use anyhow::{Context, Result};
use trawl::ipc::{
  Client,
  system::{PauseParams, ResumeParams, ShutdownParams, StatusParams, StatusResult, ThrottleParams},
};

use super::{connect, socket_path};

/// Show daemon status
pub async fn cmd_status(json: bool) -> Result<()> {
  let client = connect().await?;
  let status = client.call(StatusParams).await.context("Failed to get status")?;

  if json {
    println!("{}", serde_json::to_string_pretty(&status)?);
    return Ok(());
  }
  print_status(&status);
  Ok(())
}

fn print_status(status: &StatusResult) {
  println!("trawl {}", status.version);
  println!("==========\n");

  println!("State:          {:?}", status.state);
  println!("Uptime:         {}", format_duration(status.uptime_seconds));
  println!("Throttle:       {:.2}", status.throttle);
  println!("Queued:         {}", status.queued);
  println!("In flight:      {}", status.in_flight);
  println!("Roots:          {}", status.roots);
  println!("Clients:        {}", status.clients);
  println!("Backends:       {}", status.backends.join(", "));

  let stats = &status.stats;
  println!("\n--- Since start ---");
  println!("Indexed:        {}", stats.indexed);
  println!("Deleted:        {}", stats.deleted);
  println!("Moved:          {}", stats.moved);
  println!("Failed:         {}", stats.failed);
  println!("No backend:     {}", stats.no_backend);
  println!("Discarded:      {}", stats.discarded);
  println!("Writebacks:     {}", stats.writebacks);
}

fn format_duration(seconds: u64) -> String {
  if seconds < 60 {
    format!("{seconds}s")
  } else if seconds < 3600 {
    format!("{}m {}s", seconds / 60, seconds % 60)
  } else {
    format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
  }
}

pub async fn cmd_throttle(factor: f64) -> Result<()> {
  let client = connect().await?;
  let result = client
    .call(ThrottleParams { factor })
    .await
    .context("Failed to set throttle")?;

  println!("Throttle set to {:.2}", result.factor);
  Ok(())
}

pub async fn cmd_pause() -> Result<()> {
  let client = connect().await?;
  let result = client.call(PauseParams).await.context("Failed to pause")?;
  println!("State: {:?}", result.state);
  Ok(())
}

pub async fn cmd_resume() -> Result<()> {
  let client = connect().await?;
  let result = client.call(ResumeParams).await.context("Failed to resume")?;
  println!("State: {:?}", result.state);
  Ok(())
}

/// Stop the daemon if it is running; never starts one
pub async fn cmd_stop() -> Result<()> {
  let Ok(client) = Client::connect_to(&socket_path().await).await else {
    println!("Daemon is not running");
    return Ok(());
  };

  let message = client.call(ShutdownParams).await.context("Failed to stop daemon")?;
  println!("Daemon {message}");
  Ok(())
}
