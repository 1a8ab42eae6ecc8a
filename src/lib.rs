pub mod config;
pub mod control;
pub mod error;
pub mod thread;
pub mod ticker;
pub mod utils;

pub mod prelude;
