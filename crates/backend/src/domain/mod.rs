//! Domain types - scope, content typing and configuration
//!
//! Plain data and pure functions shared by the actors. Nothing here spawns
//! tasks or performs I/O beyond reading the config file.

pub mod config;
pub mod content;
pub mod tree;
