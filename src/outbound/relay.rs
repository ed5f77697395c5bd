//! Relay adapter: re-send a message into another Telegram chat.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::DispatchError;
use crate::outbound::{Outbound, wrong_adapter};
use crate::pipeline::types::{ActiveRule, InboundEvent, RuleTarget};
use crate::sessions::SessionRegistry;
use crate::store::model::TargetKind;

/// Relays through the session that received the event.
pub struct RelayAdapter {
    sessions: Arc<dyn SessionRegistry>,
}

impl RelayAdapter {
    pub fn new(sessions: Arc<dyn SessionRegistry>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl Outbound for RelayAdapter {
    fn kind(&self) -> TargetKind {
        TargetKind::Relay
    }

    async fn send(&self, rule: &ActiveRule, event: &InboundEvent) -> Result<(), DispatchError> {
        let RuleTarget::Relay { group } = &rule.target else {
            return Err(wrong_adapter(rule, self.kind()));
        };
        let text = event.body();

        if rule.rule.options.forward_media && !event.attachments.is_empty() {
            // Only the first attachment carries the text.
            for (i, attachment) in event.attachments.iter().enumerate() {
                let caption = if i == 0 { text } else { "" };
                self.sessions
                    .send_relay(&event.account, &group.external_id, caption, Some(attachment))
                    .await?;
            }
            return Ok(());
        }

        if text.is_empty() {
            return Err(DispatchError::EmptyMessage);
        }
        self.sessions
            .send_relay(&event.account, &group.external_id, text, None)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::snapshot::tests::{post_rule, relay_rule};
    use crate::pipeline::types::{Attachment, AttachmentKind};
    use crate::sessions::testing::{Call, RecordingRegistry};
    use crate::store::model::PostSpec;

    fn photo(id: &str) -> Attachment {
        Attachment {
            file_ref: id.into(),
            kind: AttachmentKind::Photo,
            file_name: None,
        }
    }

    fn adapter() -> (Arc<RecordingRegistry>, RelayAdapter) {
        let registry = Arc::new(RecordingRegistry::default());
        let adapter = RelayAdapter::new(registry.clone());
        (registry, adapter)
    }

    #[tokio::test]
    async fn plain_text_goes_to_target_via_receiving_session() {
        let (registry, adapter) = adapter();
        let rule = relay_rule(1, "mirror", "-100");
        let event = InboundEvent::new("relay_bot", "-100").with_text("hello");

        adapter.send(&rule, &event).await.unwrap();
        assert_eq!(
            registry.calls(),
            vec![Call::Relay {
                identity: "relay_bot".into(),
                target: "-1009".into(),
                text: "hello".into(),
                attachment: None,
            }]
        );
    }

    #[tokio::test]
    async fn media_sends_each_attachment_with_caption_on_first() {
        let (registry, adapter) = adapter();
        let mut rule = relay_rule(1, "mirror", "-100");
        rule.rule.options.forward_media = true;
        let event = InboundEvent::new("relay_bot", "-100")
            .with_caption("look")
            .with_attachment(photo("p1"))
            .with_attachment(photo("p2"));

        adapter.send(&rule, &event).await.unwrap();
        let calls = registry.calls();
        assert_eq!(calls.len(), 2);
        assert!(matches!(&calls[0], Call::Relay { text, attachment: Some(a), .. } if text == "look" && a == "p1"));
        assert!(matches!(&calls[1], Call::Relay { text, attachment: Some(a), .. } if text.is_empty() && a == "p2"));
    }

    #[tokio::test]
    async fn media_ignored_when_forwarding_disabled() {
        let (registry, adapter) = adapter();
        let rule = relay_rule(1, "mirror", "-100");
        let event = InboundEvent::new("relay_bot", "-100")
            .with_caption("look")
            .with_attachment(photo("p1"));

        adapter.send(&rule, &event).await.unwrap();
        assert!(matches!(&registry.calls()[0], Call::Relay { attachment: None, text, .. } if text == "look"));
    }

    #[tokio::test]
    async fn empty_message_is_an_error() {
        let (registry, adapter) = adapter();
        let rule = relay_rule(1, "mirror", "-100");
        let event = InboundEvent::new("relay_bot", "-100").with_attachment(photo("p1"));

        let err = adapter.send(&rule, &event).await.unwrap_err();
        assert!(matches!(err, DispatchError::EmptyMessage));
        assert!(registry.calls().is_empty());
    }

    #[tokio::test]
    async fn session_failure_propagates() {
        let registry = Arc::new(RecordingRegistry {
            fail_relay: true,
            ..Default::default()
        });
        let adapter = RelayAdapter::new(registry);
        let rule = relay_rule(1, "mirror", "-100");
        let event = InboundEvent::new("relay_bot", "-100").with_text("hello");

        let err = adapter.send(&rule, &event).await.unwrap_err();
        assert!(err.to_string().contains("relay refused"));
    }

    #[tokio::test]
    async fn rejects_post_rules() {
        let (_, adapter) = adapter();
        let rule = post_rule(1, "tweet", "-100", PostSpec::default());
        let event = InboundEvent::new("relay_bot", "-100").with_text("hello");

        let err = adapter.send(&rule, &event).await.unwrap_err();
        assert!(matches!(err, DispatchError::WrongAdapter { expected: "post", actual: "relay", .. }));
    }
}
