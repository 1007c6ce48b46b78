//! 核心层：错误类型与编排门面

pub mod error;
pub mod orchestrator;

pub use error::{A2AError, FailureKind, ToolFailure};
pub use orchestrator::{builtin_templates, AgentOrchestrator, QUALITY_AUDIT, SECURITY_SCAN};
