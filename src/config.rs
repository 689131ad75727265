use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::bridge::EmitterAddress;
use crate::bridge::poller::BackoffPolicy;
use crate::chain::remote::RemoteChainClient;
use crate::logging::LoggingSettings;
use crate::paper::PaperChainParams;
use crate::signal::SignalRules;
use crate::signal::mailbox::MailboxSettings;
use crate::signal::router::RouterConfig;
use crate::swap::service::OrchestratorConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_ledger_path")]
    pub ledger_path: PathBuf,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    pub source: ChainSettings,
    pub destination: ChainSettings,
    #[serde(default)]
    pub attestation: AttestationSettings,
    #[serde(default)]
    pub confirmation: ConfirmationSettings,
    #[serde(default)]
    pub signals: SignalSettings,
    #[serde(default)]
    pub alert_mode: AlertMode,
    /// Required when `alert_mode` is `email`.
    #[serde(default)]
    pub mailbox: Option<MailboxSettings>,
    #[serde(default = "default_resume_poll_interval_secs")]
    pub resume_poll_interval_secs: u64,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Upper bound for configured waits, so deadline arithmetic cannot overflow.
const MAX_WAIT_SECS: u64 = 7 * 24 * 60 * 60;

fn default_ledger_path() -> PathBuf {
    PathBuf::from("data/ledger.sqlite3")
}

fn default_listen_addr() -> String {
    "127.0.0.1:3000".to_string()
}

fn default_resume_poll_interval_secs() -> u64 {
    30
}

/// Where alerts come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertMode {
    #[default]
    Webhook,
    Email,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainSettings {
    pub name: String,
    pub chain_id: u16,
    pub wallet_address: String,
    /// Hex, 32 bytes.
    pub token_bridge_emitter: String,
    /// Signing agent endpoint; required outside paper mode.
    #[serde(default)]
    pub agent_url: Option<String>,
    #[serde(default)]
    pub paper_balance: Decimal,
}

impl ChainSettings {
    pub fn emitter(&self) -> Result<EmitterAddress> {
        self.token_bridge_emitter
            .parse::<EmitterAddress>()
            .with_context(|| format!("parse token_bridge_emitter of {}", self.name))
    }

    pub fn paper_params(&self) -> Result<PaperChainParams> {
        Ok(PaperChainParams {
            name: self.name.clone(),
            chain_id: self.chain_id,
            wallet_address: self.wallet_address.clone(),
            emitter: self.emitter()?,
            balance: self.paper_balance,
        })
    }

    pub fn remote_client(&self, poll_interval: Duration) -> Result<RemoteChainClient> {
        let url = self
            .agent_url
            .as_deref()
            .with_context(|| format!("{} chain has no agent_url", self.name))?;
        RemoteChainClient::new(
            url,
            self.name.clone(),
            self.chain_id,
            self.wallet_address.clone(),
            self.emitter()?,
            poll_interval,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttestationSettings {
    pub rpc_host: String,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub deadline_secs: u64,
    pub max_hard_errors: u32,
    pub request_timeout_secs: u64,
}

impl Default for AttestationSettings {
    fn default() -> Self {
        Self {
            rpc_host: "https://wormhole-v2-mainnet-api.certus.one".to_string(),
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            deadline_secs: 900,
            max_hard_errors: 5,
            request_timeout_secs: 10,
        }
    }
}

impl AttestationSettings {
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            max_hard_errors: self.max_hard_errors,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfirmationSettings {
    pub timeout_secs: u64,
    pub attempts: u32,
    pub poll_interval_ms: u64,
}

impl Default for ConfirmationSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            attempts: 3,
            poll_interval_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalSettings {
    pub fixed_buy_amount: Option<Decimal>,
    pub buy_aliases: Vec<String>,
    pub sell_aliases: Vec<String>,
    pub trigger_subject: Option<String>,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read settings {}", path.display()))?;
        let settings: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parse settings {}", path.display()))?;
        settings
            .validate()
            .with_context(|| format!("validate settings {}", path.display()))?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.source.chain_id != self.destination.chain_id,
            "source and destination share chain id {}",
            self.source.chain_id
        );
        self.source.emitter()?;
        self.destination.emitter()?;
        anyhow::ensure!(
            self.attestation.base_delay_ms > 0,
            "attestation.base_delay_ms must be positive"
        );
        anyhow::ensure!(
            self.attestation.base_delay_ms <= self.attestation.max_delay_ms,
            "attestation.base_delay_ms {} exceeds max_delay_ms {}",
            self.attestation.base_delay_ms,
            self.attestation.max_delay_ms
        );
        anyhow::ensure!(
            self.attestation.max_hard_errors >= 1,
            "attestation.max_hard_errors must be at least 1"
        );
        anyhow::ensure!(
            self.attestation.max_delay_ms / 1_000 <= MAX_WAIT_SECS,
            "attestation.max_delay_ms {} exceeds {MAX_WAIT_SECS}s",
            self.attestation.max_delay_ms
        );
        anyhow::ensure!(
            self.attestation.deadline_secs <= MAX_WAIT_SECS,
            "attestation.deadline_secs {} exceeds {MAX_WAIT_SECS}",
            self.attestation.deadline_secs
        );
        anyhow::ensure!(
            self.confirmation.timeout_secs <= MAX_WAIT_SECS,
            "confirmation.timeout_secs {} exceeds {MAX_WAIT_SECS}",
            self.confirmation.timeout_secs
        );
        anyhow::ensure!(
            self.confirmation.attempts >= 1,
            "confirmation.attempts must be at least 1"
        );
        if let Some(amount) = self.signals.fixed_buy_amount {
            anyhow::ensure!(
                amount > Decimal::ZERO,
                "signals.fixed_buy_amount must be positive, got {amount}"
            );
        }
        anyhow::ensure!(
            self.resume_poll_interval_secs > 0,
            "resume_poll_interval_secs must be positive"
        );
        if self.alert_mode == AlertMode::Email {
            let mailbox = self
                .mailbox
                .as_ref()
                .context("alert_mode email needs a mailbox section")?;
            anyhow::ensure!(
                mailbox.poll_interval_secs > 0,
                "mailbox.poll_interval_secs must be positive"
            );
            anyhow::ensure!(
                self.signals.trigger_subject.is_some(),
                "alert_mode email needs signals.trigger_subject"
            );
        }
        Ok(())
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            confirmation_timeout: Duration::from_secs(self.confirmation.timeout_secs),
            confirmation_attempts: self.confirmation.attempts,
            attestation_deadline: Duration::from_secs(self.attestation.deadline_secs),
        }
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            rules: SignalRules {
                buy_aliases: self.signals.buy_aliases.clone(),
                sell_aliases: self.signals.sell_aliases.clone(),
                trigger_subject: self.signals.trigger_subject.clone(),
            },
            fixed_buy_amount: self.signals.fixed_buy_amount,
        }
    }

    pub fn confirmation_poll_interval(&self) -> Duration {
        Duration::from_millis(self.confirmation.poll_interval_ms)
    }

    pub fn resume_poll_interval(&self) -> Duration {
        Duration::from_secs(self.resume_poll_interval_secs)
    }
}
