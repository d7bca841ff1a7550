//! Account and user domain entities.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    Checking,
    Savings,
}

impl AccountType {
    pub const ALL: [AccountType; 2] = [AccountType::Checking, AccountType::Savings];

    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::Checking => "checking",
            AccountType::Savings => "savings",
        }
    }
}

impl fmt::Display for AccountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "checking" => Ok(AccountType::Checking),
            "savings" => Ok(AccountType::Savings),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Returned when a stored enum column holds a value this build does not know.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown variant: {0}")]
pub struct UnknownVariant(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("insufficient funds in account {account_id}")]
pub struct InsufficientFunds {
    pub account_id: Uuid,
}

#[derive(Debug, Clone, Serialize)]
pub struct Account {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub account_type: AccountType,
    pub balance: BigDecimal,
    pub available: BigDecimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Opens an empty account. Accounts only ever start at zero.
    pub fn open(owner_id: Uuid, account_type: AccountType) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner_id,
            account_type,
            balance: zero(),
            available: zero(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Applies a signed delta to both balance and available funds.
    ///
    /// Fails without touching `self` when the result would leave either
    /// figure negative. Callers must hold the account's row lock.
    pub fn apply_delta(&self, delta: &BigDecimal) -> Result<Account, InsufficientFunds> {
        let available = &self.available + delta;
        let balance = &self.balance + delta;
        if available < zero() || balance < zero() {
            return Err(InsufficientFunds {
                account_id: self.id,
            });
        }

        Ok(Account {
            balance,
            available,
            updated_at: Utc::now(),
            ..self.clone()
        })
    }

    pub fn can_cover(&self, amount: &BigDecimal) -> bool {
        &self.available >= amount
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub display_name: String,
    #[serde(skip_serializing)]
    pub api_token_hash: String,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(email: String, display_name: String, api_token_hash: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            email,
            display_name,
            api_token_hash,
            created_at: Utc::now(),
        }
    }
}

pub fn zero() -> BigDecimal {
    BigDecimal::from(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> BigDecimal {
        s.parse().expect("valid decimal")
    }

    fn funded(amount: &str) -> Account {
        let mut account = Account::open(Uuid::new_v4(), AccountType::Checking);
        account.balance = dec(amount);
        account.available = dec(amount);
        account
    }

    #[test]
    fn apply_delta_debits_and_credits() {
        let account = funded("100.00");

        let debited = account.apply_delta(&dec("-40.00")).unwrap();
        assert_eq!(debited.balance, dec("60.00"));
        assert_eq!(debited.available, dec("60.00"));

        let credited = debited.apply_delta(&dec("15.50")).unwrap();
        assert_eq!(credited.balance, dec("75.50"));
    }

    #[test]
    fn apply_delta_rejects_overdraft() {
        let account = funded("10.00");
        let err = account.apply_delta(&dec("-50.00")).unwrap_err();
        assert_eq!(err.account_id, account.id);
    }

    #[test]
    fn apply_delta_allows_draining_to_zero() {
        let account = funded("10.00");
        let drained = account.apply_delta(&dec("-10.00")).unwrap();
        assert_eq!(drained.available, zero());
    }

    #[test]
    fn apply_delta_respects_held_funds() {
        let mut account = funded("100.00");
        account.available = dec("20.00");
        assert!(account.apply_delta(&dec("-30.00")).is_err());
        assert!(!account.can_cover(&dec("30.00")));
        assert!(account.can_cover(&dec("20.00")));
    }

    #[test]
    fn account_type_round_trips_through_str() {
        for kind in AccountType::ALL {
            assert_eq!(kind.as_str().parse::<AccountType>().unwrap(), kind);
        }
        assert!("brokerage".parse::<AccountType>().is_err());
    }
}
