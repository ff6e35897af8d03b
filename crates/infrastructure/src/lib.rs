pub mod direct_queue;
pub mod host_stats;
pub mod process;
pub mod queue_factory;
pub mod redis_queue;

pub use direct_queue::DirectWorkQueue;
pub use host_stats::{local_hostname, HostStatsProvider, SlotReporter};
pub use process::{run_process, OutputChunk, ProcessOutcome, ProcessSpec, Termination};
pub use queue_factory::WorkQueueFactory;
pub use redis_queue::RedisWorkQueue;
