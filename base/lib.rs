// This file is part of Streamvault, a caching intermediary for a
// self-hosted video frontend.

pub mod clock;
mod error;
pub mod strutil;
pub mod tracing_setup;

pub use crate::error::{Error, ErrorKind, ResultExt};

pub type FastHashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;
pub type FastHashSet<K> = std::collections::HashSet<K, ahash::RandomState>;

pub type Mutex<T> = parking_lot::Mutex<T>;
pub type Condvar = parking_lot::Condvar;
