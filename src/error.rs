use std::fmt;

/// Error type for exchange and arbiter operations.
///
/// Only *expected* failures are represented here. Invariant violations
/// (a publish scan finding no free slot, a release observing a cell with no
/// registered readers) indicate a bug in the engine or its caller and panic
/// instead of being reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeError {
    /// `max_readers` was zero or above the supported capacity at construction.
    InvalidMaxReaders(usize),

    /// An exclusive operation (`reset`, `map`) found live read or write
    /// handles. Drop them and retry.
    Busy,
}

impl fmt::Display for ExchangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidMaxReaders(n) => {
                write!(
                    f,
                    "max readers must be in range [1, {}], got {n}",
                    crate::arbiter::MAX_READERS
                )
            }
            Self::Busy => write!(f, "read or write handles are outstanding"),
        }
    }
}

impl std::error::Error for ExchangeError {}
