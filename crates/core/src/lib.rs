pub mod logging;
pub mod models;
pub mod traits;

pub use fleet_errors::{FleetError, FleetResult};
pub use models::*;
pub use traits::*;
