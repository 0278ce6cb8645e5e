pub mod routes;

pub use routes::{create_router, serve, ApiState, HealthResponse};
