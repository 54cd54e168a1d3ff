pub use app_error::{is_ignorable_io_error, AppError, AppResult, CloseReason};
pub use config::{ListenerConfig, ListenerInfo, ServerConfig};
pub use server::{AppHandler, AppServer, ConnectionFilter, ServerState};
pub use shutdown::Shutdown;
pub use tracing_config::{setup_local_tracing, setup_tracing, TracingGuard};

mod app_error;
mod config;
mod server;
mod shutdown;
mod tracing_config;
