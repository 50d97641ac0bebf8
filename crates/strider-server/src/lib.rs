pub mod config;
pub mod error;
pub mod handlers;
pub mod orchestrator;
pub mod registry;
pub mod server;
pub mod token;
pub mod ws;

pub use config::{load_config, ConfigError, ServiceConfig};
pub use orchestrator::RouteOrchestrator;
pub use registry::{SessionRegistry, ViewerHandle};
pub use server::{build_router, start, AppState, ServerHandle, Services};
pub use token::{PlainTokenDecoder, SealedTokenDecoder, TokenDecoder, TokenError};
