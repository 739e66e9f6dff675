//! API surface (C12): request/response endpoints, WebSocket chat, and
//! the middleware stack that gates them.

pub mod endpoints;
pub mod error;
pub mod middleware;
pub mod router;
pub mod server;
pub mod types;
pub mod websocket;

pub use self::error::ApiError;
pub use self::router::api_router;
pub use self::server::ApiServer;
pub use self::types::ApiContext;
