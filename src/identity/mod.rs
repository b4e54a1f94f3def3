//! Per-process instance identity, attached to enrichment jobs and metric reports.

use rand::Rng;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceId(Arc<str>);

impl InstanceId {
    /// Random identifier of `len` characters drawn from `charset`.
    /// An empty charset falls back to lowercase alphanumerics.
    pub fn generate(charset: &str, len: usize) -> Self {
        let chars: Vec<char> = if charset.is_empty() {
            "abcdefghijklmnopqrstuvwxyz0123456789".chars().collect()
        } else {
            charset.chars().collect()
        };
        let mut rng = rand::thread_rng();
        let id: String = (0..len)
            .map(|_| chars[rng.gen_range(0..chars.len())])
            .collect();
        Self(Arc::from(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for InstanceId {
    fn from(value: &str) -> Self {
        Self(Arc::from(value))
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
