//! Subscription gate: evaluated before any inbound message reaches the
//! conversation engine.

use chrono::{DateTime, Utc};
use citabot_store::types::Account;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessDecision {
    pub allowed: bool,
    pub reason: &'static str,
}

/// Evaluate tenant access. With enforcement off everything passes; with it
/// on, only unexpired free accounts and active/trialing subscriptions do.
pub fn check_access(enforcement_enabled: bool, account: &Account, now: DateTime<Utc>) -> AccessDecision {
    if !enforcement_enabled {
        return AccessDecision {
            allowed: true,
            reason: "enforcement_disabled",
        };
    }

    if account.subscription.is_free_account {
        return if account.has_subscription_access(now) {
            AccessDecision {
                allowed: true,
                reason: "free_account",
            }
        } else {
            AccessDecision {
                allowed: false,
                reason: "free_account_expired",
            }
        };
    }

    if account.has_subscription_access(now) {
        AccessDecision {
            allowed: true,
            reason: "active_subscription",
        }
    } else {
        AccessDecision {
            allowed: false,
            reason: "no_active_subscription",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use citabot_store::types::{
        AccountStatus, PaymentsBlock, SubscriptionBlock, SubscriptionStatus,
    };
    use std::collections::HashMap;

    fn account(status: Option<SubscriptionStatus>) -> Account {
        Account {
            id: "acct".into(),
            name: "Consultorio".into(),
            email: None,
            phone_number_id: "pnid".into(),
            calendar_id: "cal".into(),
            location_id: "loc".into(),
            assigned_user_id: "user".into(),
            custom_prompt: None,
            status: AccountStatus::Active,
            payments: PaymentsBlock::default(),
            subscription: SubscriptionBlock {
                status,
                ..Default::default()
            },
            created_at: Utc::now(),
            updated_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn enforcement_off_always_allows() {
        let decision = check_access(false, &account(None), Utc::now());
        assert!(decision.allowed);
        assert_eq!(decision.reason, "enforcement_disabled");
    }

    #[test]
    fn active_and_trialing_pass() {
        for status in [SubscriptionStatus::Active, SubscriptionStatus::Trialing] {
            assert!(check_access(true, &account(Some(status)), Utc::now()).allowed);
        }
    }

    #[test]
    fn past_due_and_friends_are_denied() {
        for status in [
            SubscriptionStatus::PastDue,
            SubscriptionStatus::Canceled,
            SubscriptionStatus::Unpaid,
            SubscriptionStatus::Incomplete,
            SubscriptionStatus::Paused,
        ] {
            let decision = check_access(true, &account(Some(status)), Utc::now());
            assert!(!decision.allowed, "{status:?} should be denied");
        }
        assert!(!check_access(true, &account(None), Utc::now()).allowed);
    }

    #[test]
    fn free_account_expiry_is_honored() {
        let now = Utc::now();
        let mut acct = account(None);
        acct.subscription.is_free_account = true;
        assert!(check_access(true, &acct, now).allowed);

        acct.subscription.free_account_expires = Some(now - Duration::days(1));
        let decision = check_access(true, &acct, now);
        assert!(!decision.allowed);
        assert_eq!(decision.reason, "free_account_expired");
    }
}
