//! Lifecycle bookkeeping that sits beside the pipeline rather than inside it

pub mod tracker;

pub use tracker::{
  CallerId, ClientIdentity, ClientRecord, ClientSummary, IdentityError, IdentityResolver, ProcIdentityResolver,
  RequestHandle, RequestTracker, TrackerConfig,
};
