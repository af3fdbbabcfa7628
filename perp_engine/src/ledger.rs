/// ledger.rs — Account ledger
///
/// Wallet balance and used margin are the only stored money fields;
/// available balance is always derived (`wallet − used_margin`), never kept
/// separately. Drawdown statistics are monotone by construction. Any
/// operation that would push the wallet negative is a `Bankruptcy`, which
/// the scheduler turns into early termination.

use tracing::warn;

use crate::error::{EngineError, Result};
use crate::numeric::{is_greater, is_less, is_less_or_equal};

#[derive(Debug, Clone)]
pub struct AccountLedger {
    initial_balance: f64,
    wallet_balance: f64,
    used_margin: f64,
    max_wallet_balance: f64,
    drawdown: f64,
    max_drawdown: f64,
    bankrupt: bool,
}

impl AccountLedger {
    pub fn new(initial_balance: f64) -> Self {
        Self {
            initial_balance,
            wallet_balance: initial_balance,
            used_margin: 0.0,
            max_wallet_balance: initial_balance,
            drawdown: 0.0,
            max_drawdown: 0.0,
            bankrupt: false,
        }
    }

    pub fn initial_balance(&self) -> f64 {
        self.initial_balance
    }

    pub fn wallet_balance(&self) -> f64 {
        self.wallet_balance
    }

    pub fn used_margin(&self) -> f64 {
        self.used_margin
    }

    /// Derived, never stored.
    pub fn available_balance(&self) -> f64 {
        self.wallet_balance - self.used_margin
    }

    pub fn max_wallet_balance(&self) -> f64 {
        self.max_wallet_balance
    }

    pub fn drawdown(&self) -> f64 {
        self.drawdown
    }

    pub fn max_drawdown(&self) -> f64 {
        self.max_drawdown
    }

    pub fn is_bankrupt(&self) -> bool {
        self.bankrupt
    }

    pub fn set_bankrupt(&mut self) {
        self.bankrupt = true;
    }

    pub fn increase_wallet(&mut self, amount: f64) -> Result<()> {
        if is_less(amount, 0.0) || amount.is_nan() {
            return Err(EngineError::invalid(format!(
                "wallet increase amount [{amount}] must be >= 0"
            )));
        }
        self.wallet_balance += amount;
        Ok(())
    }

    pub fn decrease_wallet(&mut self, amount: f64) -> Result<()> {
        if is_less(amount, 0.0) || amount.is_nan() {
            return Err(EngineError::invalid(format!(
                "wallet decrease amount [{amount}] must be >= 0"
            )));
        }
        if is_greater(amount, self.wallet_balance) {
            return Err(EngineError::Bankruptcy(format!(
                "wallet balance [{:.2}] cannot cover [{amount:.2}]",
                self.wallet_balance
            )));
        }
        self.wallet_balance -= amount;
        Ok(())
    }

    pub fn increase_used_margin(&mut self, amount: f64) -> Result<()> {
        if is_less_or_equal(amount, 0.0) || amount.is_nan() {
            return Err(EngineError::invalid(format!(
                "used margin increase amount [{amount}] must be > 0"
            )));
        }
        if is_greater(self.used_margin + amount, self.wallet_balance) {
            return Err(EngineError::invalid(format!(
                "used margin [{:.2}] + [{amount:.2}] would exceed wallet balance [{:.2}]",
                self.used_margin, self.wallet_balance
            )));
        }
        self.used_margin += amount;
        Ok(())
    }

    /// Clips to zero with a warning when the release overshoots; the excess
    /// is floating-point dust from proportional margin releases.
    pub fn decrease_used_margin(&mut self, amount: f64) {
        if is_greater(amount, self.used_margin) {
            warn!(
                used_margin = self.used_margin,
                amount, "used margin release exceeds used margin, clipping to zero"
            );
            self.used_margin = 0.0;
            return;
        }
        self.used_margin -= amount;
    }

    /// Refresh max-wallet and drawdown after a wallet mutation.
    pub fn update_statistics(&mut self) {
        self.max_wallet_balance = self.max_wallet_balance.max(self.wallet_balance);
        self.drawdown = (1.0 - self.wallet_balance / self.max_wallet_balance) * 100.0;
        self.max_drawdown = self.max_drawdown.max(self.drawdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::numeric::is_equal;

    #[test]
    fn available_is_wallet_minus_used_margin() {
        let mut ledger = AccountLedger::new(10_000.0);
        ledger.increase_used_margin(2_500.0).unwrap();
        assert!(is_equal(ledger.available_balance(), 7_500.0));
    }

    #[test]
    fn decrease_beyond_wallet_is_bankruptcy() {
        let mut ledger = AccountLedger::new(100.0);
        match ledger.decrease_wallet(100.5) {
            Err(EngineError::Bankruptcy(_)) => {}
            other => panic!("expected Bankruptcy, got {other:?}"),
        }
    }

    #[test]
    fn negative_amounts_are_invalid() {
        let mut ledger = AccountLedger::new(100.0);
        assert!(ledger.increase_wallet(-1.0).is_err());
        assert!(ledger.decrease_wallet(-1.0).is_err());
        assert!(ledger.increase_used_margin(0.0).is_err());
    }

    #[test]
    fn margin_cannot_exceed_wallet() {
        let mut ledger = AccountLedger::new(100.0);
        assert!(ledger.increase_used_margin(60.0).is_ok());
        assert!(ledger.increase_used_margin(50.0).is_err());
    }

    #[test]
    fn margin_release_clips_fp_dust() {
        let mut ledger = AccountLedger::new(100.0);
        ledger.increase_used_margin(10.0).unwrap();
        ledger.decrease_used_margin(10.0 + 1e-9);
        assert_eq!(ledger.used_margin(), 0.0);
    }

    #[test]
    fn drawdown_statistics_are_monotone() {
        let mut ledger = AccountLedger::new(1_000.0);
        ledger.increase_wallet(500.0).unwrap();
        ledger.update_statistics();
        assert!(is_equal(ledger.max_wallet_balance(), 1_500.0));
        assert!(is_equal(ledger.max_drawdown(), 0.0));

        ledger.decrease_wallet(750.0).unwrap();
        ledger.update_statistics();
        assert!(is_equal(ledger.drawdown(), 50.0));
        assert!(is_equal(ledger.max_drawdown(), 50.0));

        ledger.increase_wallet(600.0).unwrap();
        ledger.update_statistics();
        // Recovery lowers the running drawdown but not its maximum.
        assert!(ledger.drawdown() < 50.0);
        assert!(is_equal(ledger.max_drawdown(), 50.0));
        assert!(is_equal(ledger.max_wallet_balance(), 1_500.0));
    }
}
