//! Simulation toolkit for the radio interface engine.
//!
//! Provides a catalogue of representative modem operations, a mock modem
//! transport with seeded latency, loss and ack behaviour, and a load driver
//! that checks every submission completes exactly once while the modem is
//! repeatedly killed underneath it.

pub mod catalog;
pub mod modem;
pub mod scenario;
