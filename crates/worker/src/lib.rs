//! 节点 Agent
//!
//! 在本机执行 hub 派发的命令：准入控制、子进程管理、共享作业目录，
//! 以及 HTTP + WebSocket 接口。

pub mod admission;
pub mod agent;
pub mod executor;
pub mod http;
pub mod job_store;

pub use admission::{AdmissionController, SlotCounter, SlotGuard};
pub use agent::{RunningAgent, WorkerAgent};
pub use executor::JobManager;
pub use http::{create_routes, AgentError, AgentState};
pub use job_store::{JobConfig, JobDir, JobStore};
