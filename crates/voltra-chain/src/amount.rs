//! Monetary amounts in satoshi units.
//!
//! Consensus code works on signed 64-bit satoshi values so that fee and
//! reward arithmetic can go through intermediate negative results without
//! wrapping.

/// A monetary amount in satoshis. May be negative in intermediate results.
pub type Amount = i64;

/// The value of a single coin in satoshis.
pub const COIN: Amount = 100_000_000;

/// Absolute upper bound of coins that can ever exist.
pub const MAX_MONEY: Amount = 21_000_000 * COIN;

/// Whether `amount` is a well-formed monetary value.
///
/// Amounts outside this range can never appear in a valid transaction, but
/// they may show up in untrusted wire data, so every parsed amount goes
/// through this check.
pub fn money_range(amount: Amount) -> bool {
    (0..=MAX_MONEY).contains(&amount)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_money_range() {
        assert!(money_range(0));
        assert!(money_range(COIN));
        assert!(money_range(MAX_MONEY));
        assert!(!money_range(MAX_MONEY + 1));
        assert!(!money_range(-1));
    }
}
