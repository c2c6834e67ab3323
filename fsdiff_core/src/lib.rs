//! Core entities and algorithms of fsdiff.

use ahash::{AHashMap, AHashSet};

pub mod builder;
pub mod corpus;
pub mod diff;
pub mod hash;
pub mod lru;
pub mod minimize;
pub mod prog;

pub type HashMap<K, V> = AHashMap<K, V>;
pub type HashSet<V> = AHashSet<V>;
pub type RngType = rand::rngs::SmallRng;
