pub mod agent;
pub mod api_observability;
pub mod app_config;
pub mod discovery;
pub mod task_manager;

pub use agent::*;
pub use api_observability::*;
pub use app_config::*;
pub use discovery::*;
pub use task_manager::*;
