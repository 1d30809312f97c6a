pub mod error;
pub mod loopback;
pub mod transport;

pub use error::TransportError;
pub use loopback::{LoopbackHub, LoopbackTransport};
pub use transport::{LiveTransport, OutboundMessage};
