pub mod app;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod exception;
pub mod param;
pub mod pattern;
pub mod request;
pub mod response;
pub mod route;
pub mod server;

pub use config::Config;
pub use exception::Exception;
pub use param::{HttpRequestMethod, HttpVersion};
pub use pattern::{PathParams, PathPattern};
pub use request::{ParamValue, Request};
pub use response::{Response, ResponseState};
pub use route::{BoxFuture, Handler, HandlerResult, MethodFilter};
pub use server::{Server, ServerState};
