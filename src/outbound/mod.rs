//! Outbound adapters: relay within Telegram or post to a social account.

pub mod media;
pub mod post;
pub mod relay;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::DispatchError;
use crate::pipeline::types::{ActiveRule, InboundEvent};
use crate::store::model::TargetKind;

pub use media::TempMedia;
pub use post::PostAdapter;
pub use relay::RelayAdapter;

/// Delivers one event for one rule.
#[async_trait]
pub trait Outbound: Send + Sync {
    /// Target kind this adapter handles.
    fn kind(&self) -> TargetKind;

    async fn send(&self, rule: &ActiveRule, event: &InboundEvent) -> Result<(), DispatchError>;
}

/// Result of one delivery, as recorded in stats and the attempt log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub success: bool,
    pub error: Option<String>,
}

/// Run `adapter` and fold any error into a failed [`Delivery`].
pub async fn deliver(adapter: &dyn Outbound, rule: &ActiveRule, event: &InboundEvent) -> Delivery {
    match adapter.send(rule, event).await {
        Ok(()) => {
            debug!(rule = %rule.name(), target = %rule.target.descriptor(), "Delivered");
            Delivery {
                success: true,
                error: None,
            }
        }
        Err(e) => {
            warn!(rule = %rule.name(), target = %rule.target.descriptor(), "Delivery failed: {e}");
            Delivery {
                success: false,
                error: Some(e.to_string()),
            }
        }
    }
}

pub(crate) fn wrong_adapter(rule: &ActiveRule, actual: TargetKind) -> DispatchError {
    DispatchError::WrongAdapter {
        rule: rule.name().to_string(),
        expected: rule.target.kind().as_str(),
        actual: actual.as_str(),
    }
}
