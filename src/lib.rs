pub mod app_layout;
pub mod cgi_env;
pub mod console;
pub mod debugger;
pub mod error;
pub mod event_log;
pub mod registry;
pub mod request;
pub mod resolver;
pub mod router;
pub mod script_process;

pub use error::ProcessError;
pub use request::{Method, Reply, Request};
pub use resolver::{Classification, Resolver};
pub use router::{Router, SurfaceBridge};
