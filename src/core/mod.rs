//! 核心层：错误分类与恢复、编排阶段、连接监管、优雅关闭

pub mod error;
pub mod recovery;
pub mod shutdown;
pub mod state;
pub mod supervisor;

pub use error::{HiveError, ProtocolError, RecoveryAction, TransportError};
pub use recovery::RecoveryEngine;
pub use shutdown::{ShutdownManager, ShutdownReason};
pub use state::LoopPhase;
pub use supervisor::{ConnectionSupervisor, Connector, RetryPolicy, ServerStatus};
