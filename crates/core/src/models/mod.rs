pub mod message;
pub mod node;
pub mod remote_job;
pub mod task;

pub use message::*;
pub use node::*;
pub use remote_job::*;
pub use task::*;
