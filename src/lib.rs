pub mod app;
pub mod shutdown;

pub use app::{AppMode, Application, RunningApp};
pub use shutdown::ShutdownManager;
