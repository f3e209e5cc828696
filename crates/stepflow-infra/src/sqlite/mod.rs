pub mod pool;
pub mod snapshot;
