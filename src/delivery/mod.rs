//! C5: asymmetric channel lifecycle, packet fragmentation/reassembly and
//! the best-effort ordered delivery stream (spec §4.5).

pub mod accounts;
pub mod engine;

pub use accounts::{ReaderAccount, WriterAccount, WriterState};
pub use engine::DeliveryEngine;
