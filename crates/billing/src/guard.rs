//! Plan compatibility checks for downgrades
//!
//! Both checks are pure and run before any provider mutation, so a rejected
//! downgrade never leaves partial state behind.

use serde::Serialize;

use crate::error::{BillingError, BillingResult};
use crate::plans::{Plan, PlanLimits};

/// Current usage of a workspace, as counted by the owning domains
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageCounts {
    pub team_members: i64,
    pub businesses: i64,
    /// Orders created in the current calendar month (UTC)
    pub orders_this_month: i64,
}

/// Reject a change that would switch off any feature the current plan grants
pub fn check_feature_compatibility(current: &Plan, target: &Plan) -> BillingResult<()> {
    let lost: Vec<&str> = current
        .features
        .flags()
        .iter()
        .zip(target.features.flags().iter())
        .filter(|((_, had), (_, keeps))| *had && !*keeps)
        .map(|((name, _), _)| *name)
        .collect();

    if lost.is_empty() {
        return Ok(());
    }

    Err(BillingError::CannotDowngradePlan {
        reason: format!(
            "plan {} does not include features currently in use: {}",
            target.descriptor,
            lost.join(", ")
        ),
    })
}

/// Reject a change whose limits are below current usage
pub fn check_usage_limits(target: &Plan, usage: &UsageCounts) -> BillingResult<()> {
    let checks = [
        (
            "team members",
            usage.team_members,
            target.limits.max_team_members,
        ),
        ("businesses", usage.businesses, target.limits.max_businesses),
        (
            "orders this month",
            usage.orders_this_month,
            target.limits.max_orders_per_month,
        ),
    ];

    let exceeded: Vec<String> = checks
        .iter()
        .filter(|(_, used, limit)| *limit != PlanLimits::UNLIMITED && used > limit)
        .map(|(what, used, limit)| format!("{} ({} used, limit {})", what, used, limit))
        .collect();

    if exceeded.is_empty() {
        return Ok(());
    }

    Err(BillingError::CannotDowngradePlan {
        reason: format!(
            "current usage exceeds plan {} limits: {}",
            target.descriptor,
            exceeded.join(", ")
        ),
    })
}

/// Both downgrade checks; features first so the cheaper check fails fast
pub fn check_downgrade(current: &Plan, target: &Plan, usage: &UsageCounts) -> BillingResult<()> {
    check_feature_compatibility(current, target)?;
    check_usage_limits(target, usage)
}
