pub mod cluster_manager;
pub mod placement;
pub mod remote;
pub mod task_manager;

pub use cluster_manager::{ClusterManager, Subscription, SubscriptionKey};
pub use placement::{node_score, CapacityScoreStrategy, PlacementRequest, PlacementStrategy};
pub use remote::RemoteJobProcessor;
pub use task_manager::TaskManager;
