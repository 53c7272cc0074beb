//! Small value types shared across the crate.

mod hash_rate;

pub use hash_rate::HashRate;
