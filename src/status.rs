// src/status.rs
//
// Status / payment-status consistency. Only four pairs are ever allowed
// to persist:
//
//   scheduled        <-> undefined
//   cancelled        <-> undefined
//   pending_payment  <-> pending
//   completed        <-> paid
//
// Every mutation path (form edit, quick actions, settlement, price edit)
// routes the incoming change through one of the resolvers below, and the
// write sites re-check `is_consistent_pair` before touching the DB.

use crate::models::{AppointmentStatus, PaymentStatus};

/// Resolves the full pair when the *status* side changes.
pub fn resolve_for_status(
    new_status: AppointmentStatus,
) -> (AppointmentStatus, Option<PaymentStatus>) {
    match new_status {
        AppointmentStatus::Scheduled => (AppointmentStatus::Scheduled, None),
        AppointmentStatus::Cancelled => (AppointmentStatus::Cancelled, None),
        AppointmentStatus::PendingPayment => {
            (AppointmentStatus::PendingPayment, Some(PaymentStatus::Pending))
        }
        AppointmentStatus::Completed => (AppointmentStatus::Completed, Some(PaymentStatus::Paid)),
    }
}

/// Resolves the full pair when the *payment* side changes.
///
/// Clearing the payment status only pulls the appointment back to
/// scheduled when it was completed/pending_payment; an explicit
/// cancellation is never clobbered.
pub fn resolve_for_payment(
    new_payment: Option<PaymentStatus>,
    current_status: AppointmentStatus,
) -> (AppointmentStatus, Option<PaymentStatus>) {
    match new_payment {
        Some(PaymentStatus::Paid) => (AppointmentStatus::Completed, Some(PaymentStatus::Paid)),
        Some(PaymentStatus::Pending) => {
            (AppointmentStatus::PendingPayment, Some(PaymentStatus::Pending))
        }
        None => {
            let status = match current_status {
                AppointmentStatus::Completed | AppointmentStatus::PendingPayment => {
                    AppointmentStatus::Scheduled
                }
                other => other,
            };
            (status, None)
        }
    }
}

/// Second line of defense before every write.
pub fn is_consistent_pair(
    status: AppointmentStatus,
    payment_status: Option<PaymentStatus>,
) -> bool {
    matches!(
        (status, payment_status),
        (AppointmentStatus::Scheduled, None)
            | (AppointmentStatus::Cancelled, None)
            | (AppointmentStatus::PendingPayment, Some(PaymentStatus::Pending))
            | (AppointmentStatus::Completed, Some(PaymentStatus::Paid))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATUSES: [AppointmentStatus; 4] = [
        AppointmentStatus::Scheduled,
        AppointmentStatus::PendingPayment,
        AppointmentStatus::Completed,
        AppointmentStatus::Cancelled,
    ];

    const ALL_PAYMENTS: [Option<PaymentStatus>; 3] =
        [None, Some(PaymentStatus::Pending), Some(PaymentStatus::Paid)];

    #[test]
    fn status_side_forces_canonical_pairs() {
        assert_eq!(
            resolve_for_status(AppointmentStatus::Scheduled),
            (AppointmentStatus::Scheduled, None)
        );
        assert_eq!(
            resolve_for_status(AppointmentStatus::Cancelled),
            (AppointmentStatus::Cancelled, None)
        );
        assert_eq!(
            resolve_for_status(AppointmentStatus::PendingPayment),
            (AppointmentStatus::PendingPayment, Some(PaymentStatus::Pending))
        );
        assert_eq!(
            resolve_for_status(AppointmentStatus::Completed),
            (AppointmentStatus::Completed, Some(PaymentStatus::Paid))
        );
    }

    #[test]
    fn paid_forces_completed_and_back() {
        for current in ALL_STATUSES {
            assert_eq!(
                resolve_for_payment(Some(PaymentStatus::Paid), current),
                (AppointmentStatus::Completed, Some(PaymentStatus::Paid))
            );
        }
        assert_eq!(
            resolve_for_status(AppointmentStatus::Completed).1,
            Some(PaymentStatus::Paid)
        );
    }

    #[test]
    fn pending_forces_pending_payment() {
        for current in ALL_STATUSES {
            assert_eq!(
                resolve_for_payment(Some(PaymentStatus::Pending), current),
                (AppointmentStatus::PendingPayment, Some(PaymentStatus::Pending))
            );
        }
    }

    #[test]
    fn clearing_payment_does_not_clobber_cancelled() {
        assert_eq!(
            resolve_for_payment(None, AppointmentStatus::Cancelled),
            (AppointmentStatus::Cancelled, None)
        );
        assert_eq!(
            resolve_for_payment(None, AppointmentStatus::Scheduled),
            (AppointmentStatus::Scheduled, None)
        );
        assert_eq!(
            resolve_for_payment(None, AppointmentStatus::Completed),
            (AppointmentStatus::Scheduled, None)
        );
        assert_eq!(
            resolve_for_payment(None, AppointmentStatus::PendingPayment),
            (AppointmentStatus::Scheduled, None)
        );
    }

    #[test]
    fn resolvers_are_idempotent() {
        for s in ALL_STATUSES {
            let once = resolve_for_status(s);
            let twice = resolve_for_status(once.0);
            assert_eq!(once, twice);
        }
        for p in ALL_PAYMENTS {
            for current in ALL_STATUSES {
                let once = resolve_for_payment(p, current);
                let twice = resolve_for_payment(once.1, once.0);
                assert_eq!(once, twice);
            }
        }
    }

    #[test]
    fn every_resolved_pair_is_consistent() {
        for s in ALL_STATUSES {
            let (rs, rp) = resolve_for_status(s);
            assert!(is_consistent_pair(rs, rp));
        }
        for p in ALL_PAYMENTS {
            for current in ALL_STATUSES {
                let (rs, rp) = resolve_for_payment(p, current);
                assert!(is_consistent_pair(rs, rp));
            }
        }
        assert!(!is_consistent_pair(AppointmentStatus::Completed, None));
        assert!(!is_consistent_pair(
            AppointmentStatus::Scheduled,
            Some(PaymentStatus::Paid)
        ));
    }
}
