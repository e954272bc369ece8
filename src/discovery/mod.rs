//! C4: periodic UDP beacon discovery.

pub mod beacon;
pub mod engine;

pub use beacon::{Beacon, BEACON_LEN};
pub use engine::DiscoveryEngine;
