use strider_core::{RouteError, UpstreamError};
use strider_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("invalid route: {0}")]
    InvalidRoute(#[from] RouteError),

    #[error("a route is already running for this identity")]
    AlreadyWalking,

    #[error("no viewer connected for this identity")]
    NoViewer,

    #[error("{failed} of {attempted} reconcile updates failed, {expire_failed} expiries failed")]
    PartialSweep {
        failed: usize,
        attempted: usize,
        expire_failed: usize,
    },
}
