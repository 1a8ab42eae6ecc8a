//! Cross-thread control: the process-wide thread registry and synchronized
//! multi-thread transitions.

pub mod multi;
pub mod registry;

pub use multi::{StateChangeFailure, request_state_multiple};
