//! 核心编排层：错误类型、过程事件与主控管线

pub mod error;
pub mod events;
pub mod orchestrator;

pub use error::AgentError;
pub use events::ProgressEvent;
pub use orchestrator::{
    create_llm_from_config, spawn_command_loop, Command, Orchestrator, RunReport, RunStatus,
};
