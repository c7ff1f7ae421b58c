use crate::types::{ChainKind, NotificationChannel, PolicyStep};

/// Returns the steps a freshly provisioned chain starts with.
///
/// Users edit their chains afterwards; these templates are only applied when
/// a chain is empty.
pub fn default_chain(kind: ChainKind) -> Vec<PolicyStep> {
    match kind {
        ChainKind::Default => vec![
            PolicyStep::notify(NotificationChannel::SlackMention),
            PolicyStep::wait_minutes(15),
            PolicyStep::notify(NotificationChannel::Sms),
        ],
        ChainKind::Important => vec![
            PolicyStep::notify(NotificationChannel::Sms),
            PolicyStep::wait_minutes(5),
            PolicyStep::notify(NotificationChannel::PhoneCall),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_chain_starts_with_a_notification() {
        for kind in ChainKind::ALL {
            let steps = default_chain(kind);
            assert!(!steps.is_empty());
            assert!(matches!(steps[0], PolicyStep::Notify { .. }), "{kind} chain");
            assert!(matches!(steps.last(), Some(PolicyStep::Notify { .. })));
        }
    }

    #[test]
    fn important_chain_escalates_to_a_phone_call() {
        let steps = default_chain(ChainKind::Important);
        assert_eq!(
            steps.last(),
            Some(&PolicyStep::notify(NotificationChannel::PhoneCall))
        );
        assert_ne!(default_chain(ChainKind::Default), steps);
    }
}
