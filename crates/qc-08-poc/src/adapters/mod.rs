//! Adapters (hexagonal architecture implementations)

pub mod chain;
pub mod clock;
pub mod network;
pub mod nonce_store;

pub use chain::InMemoryChain;
pub use clock::ManualClock;
pub use network::InMemoryNetwork;
pub use nonce_store::{FileNonceStore, MemoryNonceStore};
