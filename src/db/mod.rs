pub mod leads;
pub mod pool;
pub mod schema;

pub use pool::{create_pool, health_check, run_migrations};

#[cfg(test)]
pub use pool::memory_pool;
