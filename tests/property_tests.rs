//! Property-based tests for the order state machine, checkout pricing and
//! payment status mapping.

use proptest::prelude::*;
use rust_decimal::Decimal;
use storefront_api::{
    entities::{order::OrderStatus, payment::PaymentStatus},
    services::{
        money::to_minor_units,
        order_status::{ensure_transition, is_cancellable, is_valid_transition},
        orders::{OrderTotals, PaymentOutcome},
        payment_gateway::ExternalPaymentStatus,
        payments::reconcile_target,
    },
};

const ALL_STATUSES: [OrderStatus; 7] = [
    OrderStatus::Pending,
    OrderStatus::Confirmed,
    OrderStatus::Processing,
    OrderStatus::Shipped,
    OrderStatus::Delivered,
    OrderStatus::Cancelled,
    OrderStatus::Refunded,
];

fn status_strategy() -> impl Strategy<Value = OrderStatus> {
    proptest::sample::select(ALL_STATUSES.to_vec())
}

/// Cents between 0 and 100k major units, as a 2dp decimal
fn money_strategy() -> impl Strategy<Value = Decimal> {
    (0i64..10_000_000).prop_map(|cents| Decimal::new(cents, 2))
}

fn rate_strategy() -> impl Strategy<Value = Decimal> {
    (0i64..=3000).prop_map(|bp| Decimal::new(bp, 4))
}

fn external_status_strategy() -> impl Strategy<Value = ExternalPaymentStatus> {
    prop_oneof![
        Just(ExternalPaymentStatus::RequiresPaymentMethod),
        Just(ExternalPaymentStatus::RequiresConfirmation),
        Just(ExternalPaymentStatus::RequiresAction),
        Just(ExternalPaymentStatus::Processing),
        Just(ExternalPaymentStatus::RequiresCapture),
        Just(ExternalPaymentStatus::Succeeded),
        Just(ExternalPaymentStatus::Failed),
        Just(ExternalPaymentStatus::Canceled),
        "[a-z_]{3,12}".prop_map(|s| ExternalPaymentStatus::parse(&s)),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn terminal_states_have_no_exits(to in status_strategy()) {
        prop_assert!(!is_valid_transition(OrderStatus::Cancelled, to));
        prop_assert!(!is_valid_transition(OrderStatus::Refunded, to));
    }

    #[test]
    fn no_transition_returns_to_pending(from in status_strategy()) {
        prop_assert!(!is_valid_transition(from, OrderStatus::Pending));
        prop_assert!(!is_valid_transition(from, from));
    }

    #[test]
    fn ensure_transition_agrees_with_table(from in status_strategy(), to in status_strategy()) {
        prop_assert_eq!(ensure_transition(from, to).is_ok(), is_valid_transition(from, to));
    }

    #[test]
    fn only_pre_fulfillment_orders_cancel(status in status_strategy()) {
        let expected = matches!(status, OrderStatus::Pending | OrderStatus::Confirmed);
        prop_assert_eq!(is_cancellable(status), expected);
    }

    #[test]
    fn refunds_only_follow_delivery(from in status_strategy()) {
        prop_assert_eq!(
            is_valid_transition(from, OrderStatus::Refunded),
            from == OrderStatus::Delivered
        );
    }

    #[test]
    fn walks_through_the_graph_never_revisit_a_status(
        steps in proptest::collection::vec(status_strategy(), 0..20)
    ) {
        let mut current = OrderStatus::Pending;
        let mut seen = vec![current];
        for next in steps {
            if is_valid_transition(current, next) {
                prop_assert!(!seen.contains(&next), "{} revisited", next);
                seen.push(next);
                current = next;
            }
        }
    }

    #[test]
    fn totals_add_up(
        subtotal in money_strategy(),
        tax_rate in rate_strategy(),
        shipping in money_strategy(),
        threshold in proptest::option::of(money_strategy()),
        discount in money_strategy(),
    ) {
        let totals = OrderTotals::compute(subtotal, tax_rate, shipping, threshold, discount);

        prop_assert_eq!(
            totals.total,
            totals.subtotal + totals.tax + totals.shipping - totals.discount
        );
        prop_assert!(totals.tax.scale() <= 2);
        prop_assert!(totals.discount >= Decimal::ZERO);
        prop_assert!(totals.discount <= subtotal);
        prop_assert!(totals.total >= Decimal::ZERO);
        if let Some(threshold) = threshold {
            if subtotal >= threshold {
                prop_assert_eq!(totals.shipping, Decimal::ZERO);
            }
        }
    }

    #[test]
    fn cents_round_trip_for_two_decimal_currencies(cents in 0i64..1_000_000_000) {
        prop_assert_eq!(to_minor_units(Decimal::new(cents, 2), "USD").unwrap(), cents);
    }

    #[test]
    fn only_success_confirms_an_order(
        status in external_status_strategy(),
        previous in proptest::option::of(external_status_strategy()),
    ) {
        match reconcile_target(&status, previous.as_ref()) {
            Some((PaymentStatus::Completed, outcome)) => {
                prop_assert_eq!(outcome, PaymentOutcome::Succeeded);
                prop_assert_eq!(status, ExternalPaymentStatus::Succeeded);
            }
            Some((_, outcome)) => prop_assert_ne!(outcome, PaymentOutcome::Succeeded),
            None => prop_assert!(!matches!(
                status,
                ExternalPaymentStatus::Succeeded
                    | ExternalPaymentStatus::Failed
                    | ExternalPaymentStatus::Canceled
            )),
        }
    }

    #[test]
    fn fresh_intent_is_never_failed_by_a_waiting_report(
        previous in proptest::option::of(external_status_strategy()),
    ) {
        let target = reconcile_target(&ExternalPaymentStatus::RequiresPaymentMethod, previous.as_ref());
        let attempted = previous.as_ref().is_some_and(ExternalPaymentStatus::is_attempted);
        prop_assert_eq!(target.is_some(), attempted);
    }
}
