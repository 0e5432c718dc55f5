//! Client-facing request surface: `/get`, `/set` and `/join`.
//!
//! Every outcome is answered with `200 OK` and a short text body; clients
//! (including the startup join handshake) read the body, not the status.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::command::LogEntry;
use crate::consensus::{ApplyReport, Consensus};
use crate::error::{JoinRequestError, SetError};
use crate::leadership::WriteGate;
use crate::store::KvStore;

/// How long a write waits for commit before reporting failure.
pub const SET_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything a request handler needs, passed explicitly instead of living in
/// globals.
#[derive(Clone)]
pub struct GatewayContext {
    store: Arc<KvStore>,
    consensus: Arc<dyn Consensus>,
    write: WriteGate,
}

impl GatewayContext {
    pub fn new(store: Arc<KvStore>, consensus: Arc<dyn Consensus>, write: WriteGate) -> Self {
        Self {
            store,
            consensus,
            write,
        }
    }

    /// Local read. May be stale on a node that is not the leader.
    pub fn get(&self, key: &str) -> Option<String> {
        self.store.get(key)
    }

    /// Replicates `key = value` and returns once it has been applied.
    ///
    /// A [`SetError::Commit`] caused by a timeout does not mean the write was
    /// discarded: the entry can still commit and apply afterwards.
    pub async fn set(&self, key: &str, value: &str) -> Result<ApplyReport, SetError> {
        if !self.write.is_open() {
            return Err(SetError::WriteNotAllowed);
        }
        if key.is_empty() || value.is_empty() {
            return Err(SetError::InvalidParams);
        }
        let command = LogEntry::new(key, value)
            .encode()
            .map_err(SetError::Encode)?;
        let report = self.consensus.apply(command, SET_TIMEOUT).await?;
        Ok(report)
    }

    /// Adds the member at `peer_address` as a voter. Only succeeds on the
    /// leader.
    pub async fn join(&self, peer_address: &str) -> Result<(), JoinRequestError> {
        if peer_address.is_empty() {
            return Err(JoinRequestError::InvalidPeerAddress);
        }
        self.consensus
            .add_voter(peer_address, peer_address, 0, Duration::ZERO)
            .await?;
        Ok(())
    }
}

/// Builds the router serving the request surface.
pub fn router(ctx: GatewayContext) -> Router {
    Router::new()
        .route("/get", get(get_handler))
        .route("/set", get(set_handler).post(set_handler))
        .route("/join", get(join_handler).post(join_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GetParams {
    key: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SetParams {
    key: String,
    value: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct JoinParams {
    #[serde(rename = "peerAddress")]
    peer_address: String,
}

async fn get_handler(State(ctx): State<GatewayContext>, Query(params): Query<GetParams>) -> String {
    if params.key.is_empty() {
        debug!("get with empty key");
        return String::new();
    }
    let value = ctx.get(&params.key).unwrap_or_default();
    format!("{value}\n")
}

async fn set_handler(
    State(ctx): State<GatewayContext>,
    Query(params): Query<SetParams>,
) -> Result<&'static str, SetError> {
    let report = ctx.set(&params.key, &params.value).await?;
    debug!(key = %params.key, index = report.index, "set committed");
    Ok("ok\n")
}

async fn join_handler(
    State(ctx): State<GatewayContext>,
    Query(params): Query<JoinParams>,
) -> Result<&'static str, JoinRequestError> {
    ctx.join(&params.peer_address).await?;
    info!(peer = %params.peer_address, "peer joined");
    Ok("ok")
}

impl IntoResponse for SetError {
    fn into_response(self) -> Response {
        let body = match &self {
            SetError::WriteNotAllowed => "write not allowed\n",
            SetError::InvalidParams => {
                debug!("set with empty key or value");
                "param error\n"
            }
            SetError::Encode(_) | SetError::Commit(_) => {
                warn!(error = %self, "set failed");
                "internal error\n"
            }
        };
        (StatusCode::OK, body).into_response()
    }
}

impl IntoResponse for JoinRequestError {
    fn into_response(self) -> Response {
        let body = match &self {
            JoinRequestError::InvalidPeerAddress => "invalid peerAddress\n",
            JoinRequestError::Membership(_) => {
                warn!(error = %self, "join failed");
                "internal error\n"
            }
        };
        (StatusCode::OK, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::future::{BoxFuture, FutureExt};

    use super::*;
    use crate::error::ConsensusError;

    #[derive(Default)]
    struct CountingConsensus {
        applies: AtomicUsize,
    }

    impl Consensus for CountingConsensus {
        fn apply(
            &self,
            _command: Vec<u8>,
            _timeout: Duration,
        ) -> BoxFuture<'static, Result<ApplyReport, ConsensusError>> {
            self.applies.fetch_add(1, Ordering::SeqCst);
            async { Ok(ApplyReport { index: 7, term: 1 }) }.boxed()
        }

        fn add_voter(
            &self,
            _id: &str,
            _address: &str,
            _prev_index: u64,
            _timeout: Duration,
        ) -> BoxFuture<'static, Result<(), ConsensusError>> {
            async { Ok(()) }.boxed()
        }
    }

    fn context() -> (GatewayContext, Arc<CountingConsensus>) {
        let consensus = Arc::new(CountingConsensus::default());
        let ctx = GatewayContext::new(
            Arc::new(KvStore::new()),
            consensus.clone(),
            WriteGate::new(),
        );
        (ctx, consensus)
    }

    #[tokio::test]
    async fn closed_gate_wins_over_param_validation() {
        let (ctx, consensus) = context();
        assert!(matches!(ctx.set("", "").await, Err(SetError::WriteNotAllowed)));
        assert!(matches!(ctx.set("k", "v").await, Err(SetError::WriteNotAllowed)));
        assert_eq!(consensus.applies.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_key_or_value_never_reaches_consensus() {
        let (ctx, consensus) = context();
        ctx.write.set(true);
        assert!(matches!(ctx.set("", "v").await, Err(SetError::InvalidParams)));
        assert!(matches!(ctx.set("k", "").await, Err(SetError::InvalidParams)));
        assert_eq!(consensus.applies.load(Ordering::SeqCst), 0);

        let report = ctx.set("k", "v").await.unwrap();
        assert_eq!(report.index, 7);
        assert_eq!(consensus.applies.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn join_rejects_empty_address() {
        let (ctx, _) = context();
        assert!(matches!(
            ctx.join("").await,
            Err(JoinRequestError::InvalidPeerAddress)
        ));
        ctx.join("127.0.0.1:7001").await.unwrap();
    }
}
