//! 存在性协议：UDP 广播 + 主动扫描维护局域网内的节点视图

pub mod announcer;
pub mod node_table;
pub mod scanner;
pub mod service;

pub use announcer::Announcer;
pub use node_table::{DiscoveryEvent, NodeTable};
pub use scanner::{local_subnets, ScanRange, Scanner};
pub use service::DiscoveryService;
