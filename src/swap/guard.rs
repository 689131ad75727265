use rust_decimal::Decimal;

use super::Chain;
use crate::chain::{ChainError, ChainPair};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceCheck {
    pub chain: Chain,
    pub requested: Decimal,
    pub available: Decimal,
}

impl BalanceCheck {
    pub fn is_sufficient(&self) -> bool {
        self.available >= self.requested
    }
}

/// Read-through balance queries against our own wallets. Nothing is cached:
/// every decision reads the chain again.
#[derive(Clone)]
pub struct BalanceGuard {
    chains: ChainPair,
}

impl BalanceGuard {
    pub fn new(chains: ChainPair) -> Self {
        Self { chains }
    }

    pub async fn balance(&self, chain: Chain) -> Result<Decimal, ChainError> {
        let client = self.chains.get(chain);
        client.query_balance(client.wallet_address()).await
    }

    pub async fn check(&self, chain: Chain, amount: Decimal) -> Result<BalanceCheck, ChainError> {
        let available = self.balance(chain).await?;
        Ok(BalanceCheck {
            chain,
            requested: amount,
            available,
        })
    }

    pub async fn sufficient_balance(&self, chain: Chain, amount: Decimal) -> Result<bool, ChainError> {
        Ok(self.check(chain, amount).await?.is_sufficient())
    }
}
