//! Error types for the `stationlink-models` crate.

/// Errors produced when decoding or validating model types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    /// A raw station block did not have the fixed record size.
    #[error("station {index}: expected {expected} bytes, got {actual}")]
    RecordLength {
        /// Index of the station the block was read for.
        index: u32,
        /// The fixed record size.
        expected: usize,
        /// The number of bytes actually received.
        actual: usize,
    },
}
