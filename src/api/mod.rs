//! HTTP surface (feature `server`): `AppState` composition, middleware
//! stack, and route handlers, per spec.md §6.1.

pub mod middleware;
pub mod routes;
pub mod server;
pub mod state;

pub use server::{build_router, serve};
pub use state::AppState;
