pub use config_io::*;
pub use core_pinner::*;

mod config_io;
mod core_pinner;
pub mod logger;
pub mod time;
