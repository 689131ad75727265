use std::time::{Duration, Instant};

use anyhow::Context as _;
use async_trait::async_trait;
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{Beneficiary, ChainClient, ChainError, Receipt, TxId};
use crate::bridge::{Attestation, EmitterAddress};

#[derive(Debug, Serialize)]
struct TransferRequest<'a> {
    amount: Decimal,
    target_chain: u16,
    beneficiary: &'a str,
}

#[derive(Debug, Serialize)]
struct RedeemRequest<'a> {
    vaa: &'a str,
}

#[derive(Debug, Deserialize)]
struct TxIdResponse {
    tx_id: Option<TxId>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum TxStatusResponse {
    Pending,
    Unknown,
    Confirmed { receipt: Receipt },
    Reverted { reason: String },
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    amount: Decimal,
}

/// `ChainClient` backed by an external signing agent that owns the keys and
/// builds chain-specific transactions.
#[derive(Clone)]
pub struct RemoteChainClient {
    http: reqwest::Client,
    base_url: String,
    name: String,
    chain_id: u16,
    wallet_address: String,
    emitter: EmitterAddress,
    poll_interval: Duration,
}

impl RemoteChainClient {
    pub fn new(
        base_url: impl Into<String>,
        name: impl Into<String>,
        chain_id: u16,
        wallet_address: impl Into<String>,
        emitter: EmitterAddress,
        poll_interval: Duration,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("build chain agent http client")?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            name: name.into(),
            chain_id,
            wallet_address: wallet_address.into(),
            emitter,
            poll_interval,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn post_for_tx_id<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
        what: &str,
    ) -> Result<Option<TxId>, ChainError> {
        let resp = self
            .http
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {path}"))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .with_context(|| format!("read {what} response"))?;
        let parsed = serde_json::from_str::<TxIdResponse>(&text).ok();
        let error = parsed.as_ref().and_then(|p| p.error.clone());
        if status.is_client_error() {
            return Err(ChainError::Rejected(error.unwrap_or_else(|| {
                format!("{what} rejected with {status}: {}", text.trim())
            })));
        }
        if !status.is_success() {
            return Err(ChainError::Transport(anyhow::anyhow!(
                "{what} failed with {status}: {}",
                error.unwrap_or(text)
            )));
        }
        let parsed = parsed.with_context(|| format!("decode {what} response: {text}"))?;
        Ok(parsed.tx_id)
    }

    async fn tx_status(&self, tx_id: &TxId) -> Result<TxStatusResponse, ChainError> {
        let resp = self
            .http
            .get(self.url(&format!("/v1/transactions/{tx_id}")))
            .send()
            .await
            .context("GET transaction")?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(TxStatusResponse::Unknown);
        }
        let resp = resp.error_for_status().context("transaction status")?;
        Ok(resp.json().await.context("decode transaction status")?)
    }
}

#[async_trait]
impl ChainClient for RemoteChainClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn chain_id(&self) -> u16 {
        self.chain_id
    }

    fn wallet_address(&self) -> &str {
        &self.wallet_address
    }

    fn emitter_address(&self) -> &EmitterAddress {
        &self.emitter
    }

    async fn submit_transfer(
        &self,
        amount: Decimal,
        beneficiary: &Beneficiary,
    ) -> Result<TxId, ChainError> {
        let body = TransferRequest {
            amount,
            target_chain: beneficiary.chain_id,
            beneficiary: &beneficiary.address,
        };
        self.post_for_tx_id("/v1/transfers", &body, "transfer")
            .await?
            .ok_or_else(|| ChainError::Transport(anyhow::anyhow!("transfer without tx_id")))
    }

    async fn await_confirmation(
        &self,
        tx_id: &TxId,
        timeout: Duration,
    ) -> Result<Receipt, ChainError> {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            match self.tx_status(tx_id).await? {
                TxStatusResponse::Confirmed { receipt } => return Ok(receipt),
                TxStatusResponse::Reverted { reason } => {
                    return Err(ChainError::Reverted {
                        tx_id: tx_id.clone(),
                        reason,
                    });
                }
                TxStatusResponse::Pending | TxStatusResponse::Unknown => {}
            }

            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Err(ChainError::Timeout(tx_id.clone()));
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn submit_redeem(&self, attestation: &Attestation) -> Result<TxId, ChainError> {
        let body = RedeemRequest {
            vaa: &attestation.vaa,
        };
        self.post_for_tx_id("/v1/redemptions", &body, "redeem")
            .await?
            .ok_or_else(|| ChainError::Transport(anyhow::anyhow!("redeem without tx_id")))
    }

    async fn query_balance(&self, address: &str) -> Result<Decimal, ChainError> {
        let resp = self
            .http
            .get(self.url(&format!("/v1/balances/{address}")))
            .send()
            .await
            .context("GET balance")?
            .error_for_status()
            .context("balance")?;
        let body: BalanceResponse = resp.json().await.context("decode balance")?;
        Ok(body.amount)
    }

    async fn find_redemption(
        &self,
        attestation: &Attestation,
    ) -> Result<Option<TxId>, ChainError> {
        let body = RedeemRequest {
            vaa: &attestation.vaa,
        };
        self.post_for_tx_id("/v1/redemptions/lookup", &body, "redemption lookup")
            .await
    }
}
