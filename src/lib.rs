//! Tagteam - 智能体轮换与成本核算引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、轮换引擎（完成管线）
//! - **dispatch**: 能力注册、访问控制、并发上限、委派、取消与超时
//! - **health**: 执行指标评分与模型轮换策略
//! - **ledger**: 定价、利润拆分、退款储备金与退款处理
//! - **observability**: tracing 初始化

pub mod config;
pub mod core;
pub mod dispatch;
pub mod health;
pub mod ledger;
pub mod observability;

pub use crate::core::{CompletionReport, EngineError, RotationEngine, TaskFailure};
