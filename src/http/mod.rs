//! HTTP front end: routes that put each limiter in front of a request.

mod handlers;
mod server;

pub use handlers::{router, AppState, REMAINING_HEADER};
pub use server::HttpServer;
