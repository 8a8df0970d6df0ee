//! Device-facing building blocks: grid coordinates, per-chip layout,
//! the command wire format, and the transport seam the runtime drives
//! the hardware through (plus a simulated transport for tests).

pub mod command;
pub mod coords;
pub mod layout;
pub mod sim;
pub mod transport;

pub use coords::{CoreCoord, GridShape};
pub use layout::{CoreKind, DeviceLayout};
pub use transport::{DeviceId, DramAddr, DramTarget, Transport};
