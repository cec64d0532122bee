//! OpenVPN supervisor module root – re-exports public API surface.

pub mod types;
pub mod config;
pub mod auth;
pub mod classifier;
pub mod logging;
pub mod events;
pub mod process;
pub mod reaper;
pub mod waiter;
pub mod service;

pub use types::*;
pub use config::SupervisorConfig;
pub use auth::{StagedCredentials, VpnCredentials};
pub use classifier::{classify, LineSignal};
pub use events::EventBus;
pub use reaper::{PgrepScanner, ProcessScanner};
pub use service::OpenVpnClient;
