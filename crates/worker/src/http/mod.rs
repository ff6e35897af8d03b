pub mod error;
pub mod handlers;
pub mod middleware;
pub mod routes;

pub use error::{AgentError, AgentResult};
pub use routes::{create_routes, AgentState};
