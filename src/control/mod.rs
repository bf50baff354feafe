//! Control plane: the HTTP/WebSocket surface operators use to observe
//! and decide, plus the uptime timer and graceful shutdown lifecycle.

pub mod api;
pub mod shutdown;
pub mod state;
pub mod uptime;
pub mod ws;

pub use api::router;
pub use shutdown::{graceful_shutdown, run_shutdown_sequence, signal_handler};
pub use state::{AppState, ApproveError, ServerEvent};
pub use uptime::{parse_duration, spawn_uptime_timer};
