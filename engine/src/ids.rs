//! Identifier source for rows inserted without a primary key.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Generates record ids of the form `<prefix>-<unique>`.
pub trait IdSource: Debug + Send + Sync {
    fn next_id(&self, prefix: &str) -> String;
}

/// Shared id source handle.
pub type SharedIdSource = Arc<dyn IdSource>;

/// Random v4 UUID ids.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomIds;

impl IdSource for RandomIds {
    fn next_id(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, uuid::Uuid::new_v4())
    }
}

impl RandomIds {
    pub fn shared() -> SharedIdSource {
        Arc::new(RandomIds)
    }
}

/// Counting ids (`prefix-1`, `prefix-2`, ...) for deterministic tests.
#[derive(Debug, Default)]
pub struct SequentialIds {
    issued: AtomicU64,
}

impl SequentialIds {
    pub fn shared() -> SharedIdSource {
        Arc::new(SequentialIds::default())
    }
}

impl IdSource for SequentialIds {
    fn next_id(&self, prefix: &str) -> String {
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}-{}", prefix, n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_ids_are_prefixed_and_distinct() {
        let ids = RandomIds::shared();
        let a = ids.next_id("order_header");
        let b = ids.next_id("order_header");
        assert!(a.starts_with("order_header-"));
        assert_ne!(a, b);
    }

    #[test]
    fn sequential_ids_count_from_one() {
        let ids = SequentialIds::default();
        assert_eq!(ids.next_id("t"), "t-1");
        assert_eq!(ids.next_id("t"), "t-2");
    }
}
