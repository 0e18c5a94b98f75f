//! Timing-accurate replay of captured packet streams to TCP clients.
//!
//! A capture is loaded once into a [`PacketStore`]. A [`Scheduler`] walks a
//! shared cursor through it in capture time, scaled by an integer speed, and
//! every connected client gets a [`DeliveryAgent`] that catches up to the
//! cursor on its first inbound byte and then follows it.

pub mod agent;
pub mod capture;
pub mod console;
pub mod error;
pub mod pcap_import;
pub mod scheduler;
pub mod server;
pub mod stats;

pub use agent::{DeliveryAgent, DeliveryReport};
pub use capture::{load, CaptureSummary, Packet, PacketStore};
pub use error::{ReplayError, Result};
pub use scheduler::{PlaybackFeed, PlaybackState, PlaybackStatus, Scheduler};
pub use server::{ReplayServer, ServeConfig};
