pub use crate::config::{ThreadConfig, TickerConfig};
pub use crate::control::registry;
pub use crate::control::{StateChangeFailure, request_state_multiple};
pub use crate::error::{ErrorKind, ResultExt, ThreadError, ThreadResult};
pub use crate::thread::{
    Blocking, CheckpointResult, CycleWait, ListenerId, ManagedThread, State, ThreadHandle,
    ThreadStatus, WaitMode,
};
pub use crate::ticker::{Tick, TickHandler, Ticker};
pub use crate::utils::logger::LoggerConfig;
