//! Cross-component tests for the indexing actors

pub mod helpers;

mod dispatch;
mod pipeline;
mod scheduling;
mod tracker;
