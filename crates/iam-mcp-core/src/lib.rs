//! Small shared primitives for the iam-mcp workspace.
//!
//! This crate intentionally has no async or HTTP dependencies so it can be
//! shared by the signer, the transport, and the CLI.

pub mod sensitive;
pub mod util;

pub use sensitive::Sensitive;
