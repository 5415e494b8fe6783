//! Upstream subscription port.

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::error::GatewayError;
use crate::domain::mapping::PlainObject;
use crate::domain::subscription::{SubscriptionId, SubscriptionRequest};

/// Receives every push row routed to one upstream subscription.
pub type PushSink = Arc<dyn Fn(&PlainObject) + Send + Sync>;

/// Creates and tears down upstream subscriptions.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SubscriptionPort: Send + Sync {
    /// Open an upstream subscription and route its rows to `sink`.
    ///
    /// Completes once upstream confirms the subscription.
    async fn subscribe(
        &self,
        request: SubscriptionRequest,
        sink: PushSink,
    ) -> Result<SubscriptionId, GatewayError>;

    /// Close an upstream subscription.
    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), GatewayError>;

    /// Whether `id` is still open on the current session.
    fn is_active(&self, id: &SubscriptionId) -> bool;

    /// Named fields of the latest revision of a shape.
    fn default_fields(&self, qualified_name: &str, namespace: u32) -> Option<Vec<String>>;
}
