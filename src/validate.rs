//! Client-side validation, run before any request leaves the process.
//!
//! These checks are advisory only. The server re-validates everything;
//! cached data (balances, cheque numbers) can be stale, so passing here
//! never guarantees the mutation will succeed.

use rust_decimal::Decimal;

use crate::model::FundAccount;

/// A validation failure, phrased for direct display.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ValidationError(pub String);

pub type Result<T> = std::result::Result<T, ValidationError>;

/// Reject empty or whitespace-only required fields.
pub fn require_non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(ValidationError(format!("{field} is required")));
    }
    Ok(())
}

/// Amounts must be strictly positive.
pub fn ensure_positive_amount(amount: Decimal) -> Result<()> {
    if amount <= Decimal::ZERO {
        return Err(ValidationError(
            "Amount must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

/// Check a disbursement against the cached fund balance. Names the
/// account and its available balance so the message stands on its own.
pub fn ensure_sufficient_funds(account: &FundAccount, amount: Decimal) -> Result<()> {
    if amount > account.current_balance {
        return Err(ValidationError(format!(
            "Insufficient funds in {}: available balance is {}, requested {}",
            account.name, account.current_balance, amount
        )));
    }
    Ok(())
}

/// Duplicate cheque numbers are compared case-insensitively against the
/// cached list.
pub fn ensure_unique_cheque_number<'a, I>(number: &str, existing: I) -> Result<()>
where
    I: IntoIterator<Item = &'a str>,
{
    let wanted = number.trim().to_lowercase();
    for candidate in existing {
        if candidate.trim().to_lowercase() == wanted {
            return Err(ValidationError(format!(
                "Cheque number {number} has already been used"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(balance: i64) -> FundAccount {
        FundAccount {
            id: "fund-1".to_string(),
            name: "Roads Fund".to_string(),
            current_balance: Decimal::from(balance),
        }
    }

    #[test]
    fn test_require_non_empty_rejects_whitespace() {
        assert!(require_non_empty("Reason", "  ").is_err());
        assert!(require_non_empty("Reason", "typo in amount").is_ok());
    }

    #[test]
    fn test_positive_amount() {
        assert!(ensure_positive_amount(Decimal::ZERO).is_err());
        assert!(ensure_positive_amount(Decimal::from(-5)).is_err());
        assert!(ensure_positive_amount(Decimal::ONE).is_ok());
    }

    #[test]
    fn test_insufficient_funds_names_account_and_balance() {
        let err = ensure_sufficient_funds(&account(100), Decimal::from(250)).unwrap_err();
        assert!(err.0.contains("Roads Fund"));
        assert!(err.0.contains("100"));
        assert!(ensure_sufficient_funds(&account(100), Decimal::from(100)).is_ok());
    }

    #[test]
    fn test_cheque_number_case_insensitive() {
        let existing = ["CHQ-001", "chq-002"];
        assert!(ensure_unique_cheque_number("chq-001", existing).is_err());
        assert!(ensure_unique_cheque_number("CHQ-002", existing).is_err());
        assert!(ensure_unique_cheque_number("CHQ-003", existing).is_ok());
    }
}
