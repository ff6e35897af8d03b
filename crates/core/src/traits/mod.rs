pub mod stats_provider;
pub mod work_queue;

pub use stats_provider::*;
pub use work_queue::*;
