//! Ports (hexagonal architecture boundaries)

pub mod inbound;
pub mod outbound;

pub use inbound::PocApi;
pub use outbound::{ChainView, NonceStore, PocNetwork, SystemTimeSource, TimeSource};
