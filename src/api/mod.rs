pub mod health;
pub mod leads;
pub mod routes;

pub use routes::{create_router, AppState};
