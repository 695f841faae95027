//! Pure lifecycle rules. Status is a function of document completeness and the
//! validated balance; nothing here touches a store.

use serde::Serialize;

use super::domain::EnrollmentStatus;
use crate::error::PipelineError;

/// Amount due against the sum of validated payments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Balance {
    total_due: i64,
    amount_paid: i64,
}

impl Balance {
    pub fn new(total_due: i64, amount_paid: i64) -> Result<Self, PipelineError> {
        if total_due < 0 || amount_paid < 0 {
            return Err(PipelineError::validation("amounts cannot be negative"));
        }
        if amount_paid > total_due {
            return Err(PipelineError::PaymentMismatch {
                amount: amount_paid,
                remaining: total_due,
            });
        }
        Ok(Self {
            total_due,
            amount_paid,
        })
    }

    pub fn total_due(&self) -> i64 {
        self.total_due
    }

    pub fn amount_paid(&self) -> i64 {
        self.amount_paid
    }

    pub fn remaining(&self) -> i64 {
        self.total_due - self.amount_paid
    }

    pub fn is_settled(&self) -> bool {
        self.amount_paid == self.total_due
    }

    /// Add a validated payment, refusing anything past the amount due.
    pub fn apply(self, amount: i64) -> Result<Self, PipelineError> {
        if amount <= 0 {
            return Err(PipelineError::validation("payment amount must be positive"));
        }
        if amount > self.remaining() {
            return Err(PipelineError::PaymentMismatch {
                amount,
                remaining: self.remaining(),
            });
        }
        Ok(Self {
            amount_paid: self.amount_paid + amount,
            ..self
        })
    }
}

/// Confirmed documents counted toward leaving `draft`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DocumentRequirements {
    pub birth_record: bool,
    pub baptism_record: bool,
    pub transfer_attestation: bool,
}

impl DocumentRequirements {
    /// A birth record plus either a baptism record or a transfer attestation.
    pub fn complete(&self) -> bool {
        self.birth_record && (self.baptism_record || self.transfer_attestation)
    }

    pub fn missing(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if !self.birth_record {
            missing.push("birth_record");
        }
        if !self.baptism_record && !self.transfer_attestation {
            missing.push("baptism_record_or_transfer_attestation");
        }
        missing
    }
}

pub fn derive_status(documents: DocumentRequirements, balance: Balance) -> EnrollmentStatus {
    if !documents.complete() {
        EnrollmentStatus::Draft
    } else if balance.is_settled() {
        EnrollmentStatus::Active
    } else if balance.amount_paid() == 0 {
        EnrollmentStatus::AwaitingPayment
    } else {
        EnrollmentStatus::PartiallyPaid
    }
}

/// Status to store next. Terminal states never move.
pub fn next_status(
    current: EnrollmentStatus,
    documents: DocumentRequirements,
    balance: Balance,
) -> EnrollmentStatus {
    if current.is_terminal() {
        current
    } else {
        derive_status(documents, balance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const COMPLETE: DocumentRequirements = DocumentRequirements {
        birth_record: true,
        baptism_record: true,
        transfer_attestation: false,
    };

    #[test]
    fn draft_until_birth_and_sacramental_record_are_confirmed() {
        let balance = Balance::new(15_000, 0).expect("balance");
        let birth_only = DocumentRequirements {
            birth_record: true,
            ..DocumentRequirements::default()
        };
        assert_eq!(derive_status(birth_only, balance), EnrollmentStatus::Draft);
        assert_eq!(birth_only.missing(), vec!["baptism_record_or_transfer_attestation"]);

        let transfer = DocumentRequirements {
            birth_record: true,
            transfer_attestation: true,
            ..DocumentRequirements::default()
        };
        assert_eq!(derive_status(transfer, balance), EnrollmentStatus::AwaitingPayment);
    }

    #[test]
    fn overpayment_is_a_mismatch() {
        let balance = Balance::new(15_000, 10_000).expect("balance");
        let err = balance.apply(6_000).expect_err("too much");
        assert!(matches!(
            err,
            PipelineError::PaymentMismatch {
                amount: 6_000,
                remaining: 5_000
            }
        ));
        assert!(balance.apply(5_000).expect("exact").is_settled());
    }

    #[test]
    fn terminal_states_are_kept() {
        let settled = Balance::new(100, 100).expect("balance");
        assert_eq!(
            next_status(EnrollmentStatus::Cancelled, COMPLETE, settled),
            EnrollmentStatus::Cancelled
        );
        let open = Balance::new(100, 0).expect("balance");
        assert_eq!(
            next_status(EnrollmentStatus::Active, COMPLETE, open),
            EnrollmentStatus::Active
        );
    }

    proptest! {
        #[test]
        fn paid_never_exceeds_due(
            due in 1i64..200_000,
            payments in proptest::collection::vec(1i64..100_000, 0..12),
        ) {
            let mut balance = Balance::new(due, 0).expect("balance");
            for amount in payments {
                match balance.apply(amount) {
                    Ok(next) => balance = next,
                    Err(PipelineError::PaymentMismatch { remaining, .. }) => {
                        prop_assert_eq!(remaining, balance.remaining());
                    }
                    Err(other) => prop_assert!(false, "unexpected error {other}"),
                }
                prop_assert!(balance.amount_paid() <= balance.total_due());
            }
        }

        #[test]
        fn active_iff_settled_with_documents(
            due in 1i64..50_000,
            paid_share in 0u32..=100,
            birth in any::<bool>(),
            baptism in any::<bool>(),
            transfer in any::<bool>(),
        ) {
            let paid = due * i64::from(paid_share) / 100;
            let balance = Balance::new(due, paid).expect("balance");
            let documents = DocumentRequirements {
                birth_record: birth,
                baptism_record: baptism,
                transfer_attestation: transfer,
            };
            let status = derive_status(documents, balance);
            prop_assert_eq!(
                status == EnrollmentStatus::Active,
                paid == due && documents.complete()
            );
            if status == EnrollmentStatus::PartiallyPaid {
                prop_assert!(paid > 0 && paid < due);
            }
        }
    }
}
