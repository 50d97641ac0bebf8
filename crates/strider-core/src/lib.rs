pub mod errors;
pub mod ids;
pub mod notify;
pub mod route;
pub mod upstream;

pub use errors::UpstreamError;
pub use ids::{ConnectionId, Identity, RunId};
pub use notify::{Notification, NotificationKind, ViewerCommand};
pub use route::{ExecutionContext, Route, RouteError, RouteStep};
pub use upstream::{LocationService, LocationUpdate};
