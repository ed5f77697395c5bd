//! Dispatch router — fans one inbound event out to every rule on its source.

use std::sync::Arc;

use tracing::{debug, error};

use crate::pipeline::types::{ActiveRule, DispatchTask, InboundEvent};

/// Select every rule whose source group matches the event's source id.
///
/// No filtering happens here. Events without a source id are dropped.
pub fn route(event: &Arc<InboundEvent>, rules: &[Arc<ActiveRule>]) -> Vec<DispatchTask> {
    let Some(source_id) = event.source_id.as_deref() else {
        error!(
            account = %event.account,
            message_id = ?event.message_id,
            "Dropping event without a resolvable source id"
        );
        return Vec::new();
    };

    let tasks: Vec<DispatchTask> = rules
        .iter()
        .filter(|rule| rule.source.external_id == source_id)
        .map(|rule| DispatchTask {
            rule: Arc::clone(rule),
            event: Arc::clone(event),
        })
        .collect();

    debug!(source = source_id, matched = tasks.len(), "Routed event");
    tasks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::snapshot::tests::relay_rule;

    fn rules() -> Vec<Arc<ActiveRule>> {
        vec![
            Arc::new(relay_rule(1, "a", "-100")),
            Arc::new(relay_rule(2, "b", "-200")),
            Arc::new(relay_rule(3, "c", "-100")),
        ]
    }

    fn names(tasks: &[DispatchTask]) -> Vec<&str> {
        let mut names: Vec<&str> = tasks.iter().map(|t| t.rule.name()).collect();
        names.sort();
        names
    }

    #[test]
    fn fans_out_to_every_matching_rule() {
        let event = Arc::new(InboundEvent::new("bot", "-100").with_text("hi"));
        let tasks = route(&event, &rules());
        assert_eq!(names(&tasks), vec!["a", "c"]);
        assert!(tasks.iter().all(|t| Arc::ptr_eq(&t.event, &event)));
    }

    #[test]
    fn single_match() {
        let event = Arc::new(InboundEvent::new("bot", "-200"));
        assert_eq!(names(&route(&event, &rules())), vec!["b"]);
    }

    #[test]
    fn no_match_yields_empty() {
        let event = Arc::new(InboundEvent::new("bot", "-999"));
        assert!(route(&event, &rules()).is_empty());
    }

    #[test]
    fn missing_source_id_is_dropped() {
        let mut event = InboundEvent::new("bot", "-100");
        event.source_id = None;
        assert!(route(&Arc::new(event), &rules()).is_empty());
    }

    #[test]
    fn empty_rule_set() {
        let event = Arc::new(InboundEvent::new("bot", "-100"));
        assert!(route(&event, &[]).is_empty());
    }
}
