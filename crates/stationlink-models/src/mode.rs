//! Operating mode of the gateway.

use serde::{Deserialize, Serialize};

/// What the gateway reads and publishes each cycle.
#[derive(
    Serialize,
    Deserialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum OperatingMode {
    /// Read the whole table and publish changed records in chunks.
    #[default]
    Batch,
    /// Read one station and publish it as an envelope message.
    Single,
}
