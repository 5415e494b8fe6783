//! Pending request bookkeeping.

use serde::Serialize;
use tokio::sync::oneshot;

use crate::domain::error::GatewayError;
use crate::domain::mapping::PlainObject;
use crate::domain::subscription::SubscriptionId;

/// Rows returned by a fetch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchResult {
    /// Mapped rows, projected to the requested fields.
    pub records: Vec<PlainObject>,
    /// Number of rows.
    pub count: usize,
}

impl FetchResult {
    /// Wrap mapped rows.
    #[must_use]
    pub fn new(records: Vec<PlainObject>) -> Self {
        let count = records.len();
        Self { records, count }
    }
}

/// What a pending request was asking for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RequestContext {
    UniverseRevision,
    UniverseSeeds {
        namespace: u32,
        qualified_name: String,
        revision: u32,
        market: String,
    },
    Fetch {
        namespace: u32,
        qualified_name: String,
        revision: u32,
        fields: Option<Vec<String>>,
    },
    Subscribe {
        subscription_id: SubscriptionId,
    },
    Unsubscribe {
        subscription_id: SubscriptionId,
    },
}

impl RequestContext {
    pub(crate) const fn kind(&self) -> &'static str {
        match self {
            Self::UniverseRevision => "universe_revision",
            Self::UniverseSeeds { .. } => "universe_seeds",
            Self::Fetch { .. } => "fetch",
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
        }
    }
}

/// Where the outcome goes.
#[derive(Debug)]
pub(crate) enum Completion {
    /// Bootstrap requests; the session consumes the response itself.
    Internal,
    Fetch(oneshot::Sender<Result<FetchResult, GatewayError>>),
    Subscribe(oneshot::Sender<Result<SubscriptionId, GatewayError>>),
    Unsubscribe(oneshot::Sender<Result<(), GatewayError>>),
}

/// One outstanding request.
#[derive(Debug)]
pub(crate) struct PendingRequest {
    pub(crate) context: RequestContext,
    completion: Completion,
}

impl PendingRequest {
    pub(crate) const fn new(context: RequestContext, completion: Completion) -> Self {
        Self {
            context,
            completion,
        }
    }

    pub(crate) const fn internal(context: RequestContext) -> Self {
        Self::new(context, Completion::Internal)
    }

    /// Deliver a failure to whoever is waiting.
    pub(crate) fn fail(self, error: GatewayError) {
        match self.completion {
            Completion::Internal => {}
            Completion::Fetch(tx) => {
                let _ = tx.send(Err(error));
            }
            Completion::Subscribe(tx) => {
                let _ = tx.send(Err(error));
            }
            Completion::Unsubscribe(tx) => {
                let _ = tx.send(Err(error));
            }
        }
    }

    pub(crate) fn complete_fetch(self, result: FetchResult) {
        match self.completion {
            Completion::Fetch(tx) => {
                let _ = tx.send(Ok(result));
            }
            other => tracing::warn!(completion = ?other, "Fetch result for non-fetch request"),
        }
    }

    pub(crate) fn complete_ack(self, id: SubscriptionId) {
        match self.completion {
            Completion::Subscribe(tx) => {
                let _ = tx.send(Ok(id));
            }
            Completion::Unsubscribe(tx) => {
                let _ = tx.send(Ok(()));
            }
            Completion::Internal => {
                tracing::debug!(kind = self.context.kind(), "Internal request acknowledged");
            }
            Completion::Fetch(_) => {
                tracing::warn!(kind = self.context.kind(), "Subscription ack for unrelated request");
            }
        }
    }
}
