//! Connection state of a network link.

use serde::{Deserialize, Serialize};

/// Lifecycle state of one link (device or broker).
///
/// ```text
/// Disconnected ──connect──▶ Connecting ──ack──▶ Connected
///      ▲                        │                  │
///      └──────── refused ───────┘◀── error / close ┘
/// ```
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum LinkState {
    /// No connection.
    #[default]
    Disconnected,
    /// A connect attempt is in flight.
    Connecting,
    /// The link is usable.
    Connected,
}

impl LinkState {
    /// `true` when the link is [`LinkState::Connected`].
    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }
}
