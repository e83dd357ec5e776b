//! 核心层：错误类型、不活跃会话巡检、优雅关闭

pub mod error;
pub mod inactivity;
pub mod shutdown;

pub use error::{FlowError, StorageError};
pub use inactivity::{InactivityMonitor, SweepReport};
pub use shutdown::{run_with_graceful_shutdown, ShutdownManager, ShutdownReason};
