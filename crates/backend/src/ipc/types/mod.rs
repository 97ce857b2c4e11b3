//! IPC types - request/response types per method group
//!
//! Each method group has its own module containing:
//! - Request types (input parameters)
//! - Response types (output data)
//! - `IpcRequest` implementations tying the two together

pub mod index;
pub mod roots;
pub mod system;
