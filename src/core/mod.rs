//! 核心层：错误类型与轮换引擎（派发、评分、轮换、台账的组合根）

pub mod engine;
pub mod error;

pub use engine::{CompletionReport, RotationEngine};
pub use error::{EngineError, TaskFailure};
