pub mod bounded_cache;
pub mod protocol;
pub mod types;
pub mod wire;
