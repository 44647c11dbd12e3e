pub mod error;
pub mod handlers;
pub mod http;
pub mod router;
pub mod server;

pub use crate::error::{Result, TsubameError};
pub use crate::http::{Body, Encoder, Request, Response};
pub use crate::router::Router;
pub use crate::server::{Server, DEFAULT_PORT};
