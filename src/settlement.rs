use serde::{Deserialize, Serialize};

/// Money in minor currency units (e.g. paise, cents).
pub type Money = i64;

/// Payment-completion state of a counter booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Settlement {
    Pending,
    Partial,
    Settled,
}

impl Settlement {
    pub fn label(&self) -> &'static str {
        match self {
            Settlement::Pending => "pending",
            Settlement::Partial => "partial",
            Settlement::Settled => "settled",
        }
    }
}

impl std::fmt::Display for Settlement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// The four monetary inputs of a counter booking. Settlement is never stored
/// next to these; it is derived from them on every read and every write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub amount: Money,
    pub discount: Money,
    pub cash_paid: Money,
    pub digital_paid: Money,
}

impl Payment {
    pub fn new(amount: Money, discount: Money, cash_paid: Money, digital_paid: Money) -> Self {
        Self { amount, discount, cash_paid, digital_paid }
    }

    pub fn net(&self) -> Money {
        self.amount.saturating_sub(self.discount)
    }

    pub fn paid(&self) -> Money {
        self.cash_paid.saturating_add(self.digital_paid)
    }

    pub fn settlement(&self) -> Settlement {
        derive_settlement(self.amount, self.discount, self.cash_paid, self.digital_paid)
    }
}

/// Total, pure derivation of the settlement label.
///
/// A fully discounted (or free) session is settled regardless of payments.
pub fn derive_settlement(
    amount: Money,
    discount: Money,
    cash_paid: Money,
    digital_paid: Money,
) -> Settlement {
    let payment = Payment::new(amount, discount, cash_paid, digital_paid);
    let (net, paid) = (payment.net(), payment.paid());
    if net <= 0 || paid >= net {
        Settlement::Settled
    } else if paid > 0 {
        Settlement::Partial
    } else {
        Settlement::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_session_is_settled() {
        assert_eq!(derive_settlement(0, 0, 0, 0), Settlement::Settled);
        assert_eq!(derive_settlement(500, 500, 0, 0), Settlement::Settled);
        assert_eq!(derive_settlement(500, 800, 0, 0), Settlement::Settled);
    }

    #[test]
    fn labels_follow_payments() {
        assert_eq!(derive_settlement(500, 0, 200, 0), Settlement::Partial);
        assert_eq!(derive_settlement(500, 0, 500, 0), Settlement::Settled);
        assert_eq!(derive_settlement(500, 0, 0, 0), Settlement::Pending);
        assert_eq!(derive_settlement(500, 100, 0, 400), Settlement::Settled);
        assert_eq!(derive_settlement(500, 100, 150, 100), Settlement::Partial);
    }

    #[test]
    fn overpayment_is_settled() {
        assert_eq!(derive_settlement(500, 0, 300, 300), Settlement::Settled);
    }

    #[test]
    fn idempotent_on_implied_inputs() {
        // Re-deriving from the same inputs always yields the same label.
        for (a, d, c, g) in [(0, 0, 0, 0), (500, 0, 200, 0), (500, 0, 500, 0), (500, 0, 0, 0)] {
            let first = derive_settlement(a, d, c, g);
            let p = Payment::new(a, d, c, g);
            assert_eq!(first, p.settlement());
            assert_eq!(first, p.settlement());
        }
    }

    #[test]
    fn net_and_paid_saturate() {
        assert_eq!(Payment::new(500, 0, 200, 0).net(), 500);
        assert_eq!(Payment::new(i64::MIN, 1, 0, 0).net(), i64::MIN);
        assert_eq!(Payment::new(0, 0, i64::MAX, 1).paid(), i64::MAX);
    }

    #[test]
    fn extreme_values_do_not_overflow() {
        assert_eq!(derive_settlement(i64::MAX, i64::MIN, 0, 0), Settlement::Pending);
        assert_eq!(derive_settlement(100, 0, i64::MAX, i64::MAX), Settlement::Settled);
    }
}
