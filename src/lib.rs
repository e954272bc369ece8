//! Montana Mesh: LAN-scale peer-to-peer discovery, channels and reliable
//! delivery.
//!
//! - [`discovery`] (C4): UDP beacon peer discovery.
//! - [`poller`] (C3): backend-independent readiness facade over `mio`.
//! - [`delivery`] (C5): TCP channel lifecycle, packet framing and the
//!   writer output path.
//! - [`file_transport`] (C6): resumable file transfers riding on delivery.
//! - [`outbox`] (C7) and [`overlay`] (C8): persistent, acked reliable
//!   delivery on top of delivery's `regular` packets.
//! - [`engine`] (C9): the facade that binds all of the above into one
//!   `step()` loop.

pub mod config;
pub mod crc16;
pub mod delivery;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod events;
pub mod file_transport;
pub mod outbox;
pub mod overlay;
pub mod packet;
pub mod poller;
pub mod wire;

pub use config::MeshConfig;
pub use engine::MeshEngine;
pub use error::{MeshError, Result};
pub use events::Event;
