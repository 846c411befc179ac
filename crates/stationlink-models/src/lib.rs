#![deny(missing_docs)]

//! # StationLink Models
//!
//! Core data types shared by the StationLink SDK and gateway.
//!
//! ## Record layout
//!
//! ```text
//! byte  0      1      2..3    4..5   6..7        8..9
//!      flags  (pad)  Field3  Type   OldStation  Reserve2
//!      bit0 = Occupied, bit1 = CallStation        (all i16, big-endian)
//! ```
//!
//! ## Module layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`station`] | `StationRecord`, `RawRecord` and the fixed-width decoder |
//! | [`message`] | Outbound JSON schemas (batch chunk entries, single-station envelope) |
//! | [`link`] | `LinkState` of a device or broker connection |
//! | [`mode`] | `OperatingMode` (batch vs single station) |
//! | [`error`] | `ModelError` |

pub mod error;
pub mod link;
pub mod message;
pub mod mode;
pub mod station;

// Re-export all public types at crate root for convenience.
pub use error::*;
pub use link::*;
pub use message::*;
pub use mode::*;
pub use station::*;
