pub mod actor;
pub mod control;
pub mod extract;
pub mod store;

mod server;

mod domain;
pub use domain::{config, content, tree};

pub mod dirs;
pub mod ipc;

mod daemon;
pub use daemon::{Daemon, DaemonError, RuntimeConfig};
