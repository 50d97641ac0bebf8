pub mod error;
pub mod executor;
pub mod notifier;
pub mod reconciler;
pub mod walking;

pub use error::EngineError;
pub use executor::{ExecutorConfig, RouteExecutor, RunClaim, RunOutcome};
pub use notifier::Notifier;
pub use reconciler::{Reconciler, SweepReport};
pub use walking::WalkingSet;
