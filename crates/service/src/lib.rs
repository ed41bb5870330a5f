pub mod counters;
pub mod pending;
pub mod registry;

use std::ops::{Deref, DerefMut};

use ahash::{HashMap, HashMapExt};

/// The default `HashMap` is created without allocating capacity. Relay
/// instances tend to carry a meaningful number of registrations and
/// identities at steady state, so the in-process tables here pre-allocate a
/// modest capacity at creation time instead of growing one bucket at a time.
pub struct Table<K, V>(HashMap<K, V>);

impl<K, V> Default for Table<K, V> {
    fn default() -> Self {
        Self(HashMap::with_capacity(256))
    }
}

impl<K, V> Deref for Table<K, V> {
    type Target = HashMap<K, V>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<K, V> DerefMut for Table<K, V> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// A routing identity: either the 32-hex-character token itself, or a
/// human-chosen alias that an external control plane maps to exactly one
/// token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    Token(String),
    Alias(String),
}

impl Identity {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Token(s) | Self::Alias(s) => s,
        }
    }
}
