//! External facade: HTTP request/reply surface plus the observer stream

pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod server;
pub mod websocket;

pub use handlers::AppState;
pub use server::ApiServer;
pub use websocket::BroadcastHub;
