//! Bus sessions: the liveness + send surface the encoder publishes through.

pub mod bus;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
pub mod udp;

pub use bus::{Bus, BusHandle};
pub use udp::UdpBus;
