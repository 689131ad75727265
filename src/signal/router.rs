use rust_decimal::Decimal;

use super::{Classification, SignalClass, SignalRules, TradeSignal, classify};
use crate::swap::guard::BalanceGuard;
use crate::swap::store::SharedLedger;
use crate::swap::{Direction, SwapRequest};

#[derive(Debug, thiserror::Error)]
pub enum SignalRejected {
    #[error("unknown signal: {0}")]
    UnknownSignal(String),
    #[error("buy signal without an amount and no fixed buy amount configured")]
    MissingAmount,
    #[error("invalid amount: {0}")]
    InvalidAmount(String),
    #[error("no open position: no completed buy since the last sell")]
    NoOpenPosition,
    #[error("destination balance is zero; nothing to sell")]
    EmptyPosition,
    #[error("position lookup failed: {0:#}")]
    Lookup(anyhow::Error),
}

#[derive(Debug, Clone, Default)]
pub struct RouterConfig {
    pub rules: SignalRules,
    /// Used when a buy signal carries no amount.
    pub fixed_buy_amount: Option<Decimal>,
}

/// Turns normalized signals into swap requests.
#[derive(Clone)]
pub struct SignalRouter {
    cfg: RouterConfig,
    ledger: SharedLedger,
    balances: BalanceGuard,
}

impl SignalRouter {
    pub fn new(cfg: RouterConfig, ledger: SharedLedger, balances: BalanceGuard) -> Self {
        Self {
            cfg,
            ledger,
            balances,
        }
    }

    pub async fn route(&self, signal: &TradeSignal) -> Result<SwapRequest, SignalRejected> {
        let class = match classify(signal, &self.cfg.rules) {
            Classification::Recognized(class) => class,
            Classification::Unrecognized(reason) => {
                return Err(SignalRejected::UnknownSignal(reason));
            }
        };

        let request = match class {
            SignalClass::Buy => SwapRequest::new(Direction::Buy, self.buy_amount(signal)?),
            SignalClass::Sell => SwapRequest::new(Direction::Sell, self.sell_amount().await?),
        };
        tracing::info!(
            request_id = %request.request_id,
            direction = %request.direction,
            amount = %request.amount,
            received_at = %signal.received_at,
            "signal accepted"
        );
        Ok(request)
    }

    fn buy_amount(&self, signal: &TradeSignal) -> Result<Decimal, SignalRejected> {
        let amount = signal
            .amount()
            .map_err(SignalRejected::InvalidAmount)?
            .or(self.cfg.fixed_buy_amount)
            .ok_or(SignalRejected::MissingAmount)?;
        if amount <= Decimal::ZERO {
            return Err(SignalRejected::InvalidAmount(format!(
                "amount must be positive, got {amount}"
            )));
        }
        Ok(amount)
    }

    /// A sell closes the position: it moves the whole current destination
    /// balance, not the amount of the original buy. The position is open
    /// only while the latest completed buy is newer than the latest
    /// completed sell.
    async fn sell_amount(&self) -> Result<Decimal, SignalRejected> {
        let (last_buy, last_sell) = {
            let ledger = self.ledger.lock().expect("ledger mutex poisoned");
            let last_buy = ledger
                .get_latest_completed(Direction::Buy)
                .map_err(SignalRejected::Lookup)?;
            let last_sell = ledger
                .get_latest_completed(Direction::Sell)
                .map_err(SignalRejected::Lookup)?;
            (last_buy, last_sell)
        };
        let Some(last_buy) = last_buy else {
            return Err(SignalRejected::NoOpenPosition);
        };
        if let Some(last_sell) = last_sell
            && last_sell.updated_at >= last_buy.updated_at
        {
            tracing::debug!(
                last_buy = %last_buy.request_id,
                last_sell = %last_sell.request_id,
                "position already closed"
            );
            return Err(SignalRejected::NoOpenPosition);
        }
        tracing::debug!(
            last_buy = %last_buy.request_id,
            bought = ?last_buy.result_amount,
            "closing position"
        );

        let balance = self
            .balances
            .balance(Direction::Sell.from_chain())
            .await
            .map_err(|e| SignalRejected::Lookup(anyhow::Error::new(e)))?;
        if balance <= Decimal::ZERO {
            return Err(SignalRejected::EmptyPosition);
        }
        Ok(balance)
    }
}
