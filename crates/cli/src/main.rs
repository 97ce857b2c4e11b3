//! trawl CLI - desktop content indexing daemon and its control commands

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;
mod logging;

use commands::{
  cmd_daemon, cmd_index, cmd_pause, cmd_reindex, cmd_resume, cmd_roots_add, cmd_roots_list, cmd_roots_remove,
  cmd_status, cmd_stop, cmd_throttle,
};
use logging::init_cli_logging;

#[derive(Parser)]
#[command(name = "trawl")]
#[command(about = "Keeps a metadata index in step with your files")]
#[command(after_help = "\
QUICK START:
  trawl daemon --foreground       # Run the daemon in this terminal
  trawl roots add ~/Documents     # Index a directory tree
  trawl status                    # Queue, throttle and counters

The daemon starts automatically for every other command.")]
struct Cli {
  #[command(subcommand)]
  command: Commands,
}

/// Subcommands for `trawl roots`
#[derive(Subcommand)]
pub enum RootsCommand {
  /// Register a directory and crawl it
  Add {
    path: String,
    /// Only index the directory's immediate children
    #[arg(long)]
    no_recurse: bool,
    /// Glob matched against each path component; repeatable
    #[arg(long = "exclude", value_name = "GLOB")]
    exclude: Vec<String>,
  },
  /// Stop indexing a directory
  Remove {
    path: String,
    /// Also drop everything indexed under it
    #[arg(long)]
    cascade: bool,
  },
  /// List registered directories
  List,
}

#[derive(Subcommand)]
enum Commands {
  /// Run the daemon
  Daemon {
    /// Run in foreground with console logging
    #[arg(long)]
    foreground: bool,
    /// Set by the auto-start path; logs to file
    #[arg(long, hide = true)]
    background: bool,
  },
  /// Index one file or directory right away
  Index {
    /// Absolute or relative path, or a file:// URI
    target: String,
  },
  /// Re-extract every indexed file of the given content types
  #[command(after_help = "\
EXAMPLES:
  trawl reindex image/png
  trawl reindex 'audio/*' 'video/*'")]
  Reindex {
    #[arg(required = true)]
    types: Vec<String>,
  },
  /// Manage indexed directories
  Roots {
    #[command(subcommand)]
    command: RootsCommand,
  },
  /// Show daemon status
  Status {
    /// Output as JSON
    #[arg(long)]
    json: bool,
  },
  /// Slow indexing down: 0.0 is full speed, 1.0 the slowest
  Throttle { factor: f64 },
  /// Stop handing out work
  Pause,
  /// Continue after a pause
  Resume,
  /// Stop the daemon
  Stop,
}

#[tokio::main]
async fn main() -> Result<()> {
  let cli = Cli::parse();

  // The daemon sets up its own logging once the config is loaded
  if !matches!(cli.command, Commands::Daemon { .. }) {
    init_cli_logging();
  }

  match cli.command {
    Commands::Daemon { foreground, background } => cmd_daemon(foreground && !background).await,
    Commands::Index { target } => cmd_index(&target).await,
    Commands::Reindex { types } => cmd_reindex(types).await,
    Commands::Roots { command } => match command {
      RootsCommand::Add {
        path,
        no_recurse,
        exclude,
      } => cmd_roots_add(&path, !no_recurse, exclude).await,
      RootsCommand::Remove { path, cascade } => cmd_roots_remove(&path, cascade).await,
      RootsCommand::List => cmd_roots_list().await,
    },
    Commands::Status { json } => cmd_status(json).await,
    Commands::Throttle { factor } => cmd_throttle(factor).await,
    Commands::Pause => cmd_pause().await,
    Commands::Resume => cmd_resume().await,
    Commands::Stop => cmd_stop().await,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_roots_add_flags() {
    let cli = Cli::parse_from(["trawl", "roots", "add", "/docs", "--no-recurse", "--exclude", "*.tmp", "--exclude", ".git"]);
    let Commands::Roots {
      command: RootsCommand::Add {
        path,
        no_recurse,
        exclude,
      },
    } = cli.command
    else {
      panic!("expected roots add");
    };
    assert_eq!(path, "/docs");
    assert!(no_recurse);
    assert_eq!(exclude, vec!["*.tmp".to_string(), ".git".to_string()]);
  }

  #[test]
  fn test_reindex_requires_a_type() {
    assert!(Cli::try_parse_from(["trawl", "reindex"]).is_err());
  }

  #[test]
  fn test_cli_definition() {
    use clap::CommandFactory;
    Cli::command().debug_assert();
  }
}
