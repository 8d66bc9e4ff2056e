//! Shared test utilities for stream consumer testing
//!
//! - `TestRedis`: Redis container with automatic cleanup (feature: "redis")
//! - `TestDataBuilder`: deterministic stream, group and consumer names
//!
//! # Features
//!
//! - `redis` (default): Enables Redis test infrastructure
//!
//! # Usage
//!
//! ```rust,ignore
//! use test_utils::{TestDataBuilder, TestRedis};
//!
//! #[tokio::test]
//! #[ignore = "requires Docker"]
//! async fn my_stream_test() {
//!     let redis = TestRedis::new().await;
//!     let names = TestDataBuilder::from_test_name("my_stream_test");
//!
//!     let stream = names.stream("orders");
//!     redis.xadd(&stream, &[("order_id", "1")]).await;
//!     assert_eq!(redis.xlen(&stream).await, 1);
//! }
//! ```

use uuid::Uuid;

#[cfg(feature = "redis")]
mod redis;

#[cfg(feature = "redis")]
pub use crate::redis::TestRedis;

/// Deterministic names for stream keys, groups and consumers.
///
/// Seeded from the test name so reruns reuse the same keys, while different
/// tests sharing one Redis never collide.
pub struct TestDataBuilder {
    seed: u64,
}

impl TestDataBuilder {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Create from test name (generates seed from test name hash)
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let names = TestDataBuilder::from_test_name("test_claims_stale_entries");
    /// ```
    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let names = TestDataBuilder::new(7);
    /// assert_eq!(names.stream("orders"), "test:orders:7");
    /// ```
    pub fn stream(&self, prefix: &str) -> String {
        format!("test:{}:{}", prefix, self.seed)
    }

    pub fn group(&self, prefix: &str) -> String {
        format!("{}-group-{}", prefix, self.seed)
    }

    pub fn consumer(&self, suffix: &str) -> String {
        format!("consumer-{}-{}", self.seed, suffix)
    }

    /// Seed-derived UUID, e.g. for payload fields
    pub fn id(&self) -> Uuid {
        let bytes = self.seed.to_le_bytes();
        let mut uuid_bytes = [0u8; 16];
        uuid_bytes[..8].copy_from_slice(&bytes);
        uuid_bytes[8..16].copy_from_slice(&bytes);
        Uuid::from_bytes(uuid_bytes)
    }
}
