pub mod health;
pub mod nodes;
pub mod queue;
pub mod tasks;
