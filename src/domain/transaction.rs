//! Transaction log entries.
//! Rows are append-only; balances are never stored on them, only deltas.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::account::UnknownVariant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Debit,
    Credit,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Debit => "debit",
            Direction::Credit => "credit",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debit" => Ok(Direction::Debit),
            "credit" => Ok(Direction::Credit),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TransactionRecord {
    pub id: Uuid,
    pub account_id: Uuid,
    pub direction: Direction,
    pub amount: BigDecimal,
    pub description: String,
    pub transfer_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl TransactionRecord {
    pub fn new(
        account_id: Uuid,
        direction: Direction,
        amount: BigDecimal,
        description: impl Into<String>,
        transfer_id: Option<Uuid>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_id,
            direction,
            amount,
            description: description.into(),
            transfer_id,
            created_at: Utc::now(),
        }
    }

    /// The signed effect this entry had on its account.
    pub fn signed_amount(&self) -> BigDecimal {
        match self.direction {
            Direction::Credit => self.amount.clone(),
            Direction::Debit => -self.amount.clone(),
        }
    }
}

/// A log entry paired with the account balance right after it was applied.
#[derive(Debug, Clone, Serialize)]
pub struct BalancedEntry {
    #[serde(flatten)]
    pub entry: TransactionRecord,
    pub balance_after: BigDecimal,
}

/// Rebuilds the balance after each entry of a newest-first listing.
///
/// `current_balance` is the balance after the newest entry. Walking
/// backwards, a credit is subtracted and a debit added back to reach the
/// balance before it.
pub fn with_running_balances(
    current_balance: &BigDecimal,
    entries_desc: Vec<TransactionRecord>,
) -> Vec<BalancedEntry> {
    let mut balance = current_balance.clone();
    entries_desc
        .into_iter()
        .map(|entry| {
            let balance_after = balance.clone();
            balance = &balance - &entry.signed_amount();
            BalancedEntry {
                entry,
                balance_after,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> BigDecimal {
        s.parse().expect("valid decimal")
    }

    #[test]
    fn signed_amount_follows_direction() {
        let account = Uuid::new_v4();
        let credit = TransactionRecord::new(account, Direction::Credit, dec("5.00"), "in", None);
        let debit = TransactionRecord::new(account, Direction::Debit, dec("5.00"), "out", None);
        assert_eq!(credit.signed_amount(), dec("5.00"));
        assert_eq!(debit.signed_amount(), dec("-5.00"));
    }

    #[test]
    fn running_balances_reproduce_history() {
        // History, oldest first: +100 (100), -40 (60), +25.50 (85.50), -10 (75.50)
        let account = Uuid::new_v4();
        let history = vec![
            (Direction::Credit, "100.00", "100.00"),
            (Direction::Debit, "40.00", "60.00"),
            (Direction::Credit, "25.50", "85.50"),
            (Direction::Debit, "10.00", "75.50"),
        ];

        let entries_desc: Vec<TransactionRecord> = history
            .iter()
            .rev()
            .map(|(direction, amount, _)| {
                TransactionRecord::new(account, *direction, dec(amount), "entry", None)
            })
            .collect();

        let balanced = with_running_balances(&dec("75.50"), entries_desc);
        let expected: Vec<BigDecimal> = history.iter().rev().map(|(_, _, after)| dec(after)).collect();
        let actual: Vec<BigDecimal> = balanced.iter().map(|b| b.balance_after.clone()).collect();

        assert_eq!(actual, expected);
    }

    #[test]
    fn running_balances_on_empty_log() {
        assert!(with_running_balances(&dec("12.00"), Vec::new()).is_empty());
    }

    #[test]
    fn direction_parses_known_values_only() {
        assert_eq!("debit".parse::<Direction>().unwrap(), Direction::Debit);
        assert_eq!("credit".parse::<Direction>().unwrap(), Direction::Credit);
        assert!("refund".parse::<Direction>().is_err());
    }
}
