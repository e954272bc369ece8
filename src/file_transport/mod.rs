//! Resumable file transporter (C6).

pub mod engine;
pub mod messages;
pub mod state;

pub use engine::{FileOutcome, FileTransporter};
