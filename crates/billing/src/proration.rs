//! Proration and refund math
//!
//! Pure functions only. Durations are compared in nanoseconds and amounts are
//! `Decimal` until the final floor into the provider's minor unit, so there is
//! no floating-point drift and no divide-by-zero on degenerate periods.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use time::{Duration, OffsetDateTime};

/// Days in the notional month used by proration estimates
pub const ESTIMATE_DAYS_IN_MONTH: i64 = 30;

/// Fraction of the period `[start, end)` still unused at `now`, in `[0, 1]`.
///
/// Returns zero for an empty or inverted period and when `now` lies outside it.
pub fn proration_fraction(now: OffsetDateTime, start: OffsetDateTime, end: OffsetDateTime) -> Decimal {
    let Some((remaining, total)) = remaining_and_total(now, start, end) else {
        return Decimal::ZERO;
    };

    (Decimal::from_i128_with_scale(remaining, 0) / Decimal::from_i128_with_scale(total, 0))
        .clamp(Decimal::ZERO, Decimal::ONE)
}

/// Remaining and total nanoseconds of the period, `None` when nothing is left
fn remaining_and_total(
    now: OffsetDateTime,
    start: OffsetDateTime,
    end: OffsetDateTime,
) -> Option<(i128, i128)> {
    let total = (end - start).whole_nanoseconds();
    if total <= 0 || now >= end || now < start {
        return None;
    }
    Some(((end - now).whole_nanoseconds(), total))
}

/// Refund for the unused part of a paid period, floored to minor units
pub fn prorated_refund(
    amount_paid: i64,
    now: OffsetDateTime,
    start: OffsetDateTime,
    end: OffsetDateTime,
) -> i64 {
    if amount_paid <= 0 {
        return 0;
    }
    let Some((remaining, total)) = remaining_and_total(now, start, end) else {
        return 0;
    };
    // Multiply before dividing so exact results are not nudged by a rounded fraction
    let refund = Decimal::from(amount_paid)
        .checked_mul(Decimal::from_i128_with_scale(remaining, 0))
        .map(|scaled| scaled / Decimal::from_i128_with_scale(total, 0))
        .unwrap_or_else(|| Decimal::from(amount_paid) * proration_fraction(now, start, end));

    refund.floor().to_i64().unwrap_or(0).clamp(0, amount_paid)
}

/// End of the refund window.
///
/// Uses the locally stored period end, unless the provider's nominal period end
/// has already passed, in which case nothing after `now` is refundable.
pub fn refund_window_end(
    nominal_end: OffsetDateTime,
    stored_end: Option<OffsetDateTime>,
    now: OffsetDateTime,
) -> OffsetDateTime {
    if nominal_end <= now {
        now
    } else {
        stored_end.unwrap_or(nominal_end)
    }
}

/// Whole calendar days until `end`, rounded up, never negative
pub fn ceil_positive_days_until(end: OffsetDateTime, now: OffsetDateTime) -> i64 {
    let remaining = end - now;
    if remaining <= Duration::ZERO {
        return 0;
    }
    let days = remaining.whole_days();
    if remaining > Duration::days(days) {
        days + 1
    } else {
        days
    }
}

/// Price in major units converted to minor units (cents, fils)
pub fn to_minor_units(price: Decimal) -> i64 {
    (price * Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .unwrap_or(0)
}

/// Display-only estimate of a plan change cost in minor units:
/// `(new - current) * days_remaining / 30`, truncated toward zero.
pub fn estimate_proration(current_price: Decimal, new_price: Decimal, days_remaining: i64) -> i64 {
    let delta = to_minor_units(new_price) - to_minor_units(current_price);
    delta.saturating_mul(days_remaining.max(0)) / ESTIMATE_DAYS_IN_MONTH
}
