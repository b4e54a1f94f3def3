//! Tracked wallet set.
//!
//! Architecture:
//! - `TrackedSetCache`: immutable `HashSet` snapshot behind an `ArcSwap`;
//!   readers load the current `Arc` without locking, the refresher builds a
//!   new set off to the side and swaps it in whole
//! - `AddressSource`: where the wallet list comes from (HTTP in production)
//! - `TrackedSetRefresher`: background task that polls the source on an
//!   interval and keeps the last good snapshot on failure

pub mod source;

use arc_swap::ArcSwap;
use std::collections::HashSet;
use std::sync::Arc;

pub use source::{AddressSource, HttpAddressSource, SourceError, TrackedSetRefresher};

/// Current set of addresses of interest.
pub struct TrackedSetCache {
    current: ArcSwap<HashSet<String>>,
}

impl TrackedSetCache {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(HashSet::new()),
        }
    }

    pub fn with_addresses<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let cache = Self::new();
        cache.refresh(addresses);
        cache
    }

    /// Replace the whole set. Returns the size of the new snapshot.
    pub fn refresh<I, S>(&self, addresses: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let next: HashSet<String> = addresses
            .into_iter()
            .map(|a| a.into())
            .filter(|a: &String| !a.is_empty())
            .collect();
        let len = next.len();
        self.current.store(Arc::new(next));
        len
    }

    pub fn contains(&self, address: &str) -> bool {
        self.current.load().contains(address)
    }

    /// The snapshot currently served to readers.
    pub fn snapshot(&self) -> Arc<HashSet<String>> {
        self.current.load_full()
    }

    pub fn len(&self) -> usize {
        self.current.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TrackedSetCache {
    fn default() -> Self {
        Self::new()
    }
}
