//! # Provisioning Testing
//!
//! Testing utilities for the provisioning worker.
//!
//! This crate provides:
//! - [`InMemoryJobQueue`]: in-process queue backend with fault injection
//! - In-memory reservation, pubkey and account stores
//! - [`StubClouds`]: scriptable cloud clients that record every call
//! - [`FixedClock`]: deterministic time
//!
//! ## Example
//!
//! ```
//! use provisioning_testing::{InMemoryJobQueue, InMemoryReservationStore, test_clock};
//! use std::sync::Arc;
//!
//! let queue = Arc::new(InMemoryJobQueue::new());
//! let store = Arc::new(InMemoryReservationStore::new(test_clock()));
//! assert!(queue.is_drained());
//! assert!(store.is_empty());
//! ```

use chrono::{DateTime, Utc};
use provisioning_core::environment::Clock;

pub mod clouds;
pub mod queue;
pub mod stores;

/// Mock implementations of environment traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use provisioning_testing::mocks::FixedClock;
    /// use provisioning_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

// Re-export commonly used items
pub use clouds::{CloudCall, StubClouds};
pub use mocks::{FixedClock, test_clock};
pub use queue::{FailedTask, InMemoryJobQueue};
pub use stores::{InMemoryAccountStore, InMemoryPubkeyStore, InMemoryReservationStore};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        let time1 = clock.now();
        let time2 = clock.now();
        assert_eq!(time1, time2);
    }
}
