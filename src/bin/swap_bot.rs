use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use bridge_swap::bridge::AttestationApi;
use bridge_swap::bridge::guardian::GuardianRpc;
use bridge_swap::bridge::poller::AttestationClient;
use bridge_swap::chain::ChainPair;
use bridge_swap::config::{AlertMode, Settings};
use bridge_swap::paper::PaperNetwork;
use bridge_swap::signal::router::SignalRouter;
use bridge_swap::signal::mailbox::{self, ImapMailbox};
use bridge_swap::signal::webhook;
use bridge_swap::swap::Chain;
use bridge_swap::swap::service::SwapOrchestrator;
use bridge_swap::swap::store::{self, SqliteTradeLedger};
use bridge_swap::worker;
use clap::Parser as _;
use tokio::net::TcpListener;

#[derive(Debug, clap::Parser)]
struct Args {
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    /// Run against the in-memory paper network instead of the chain agents.
    #[arg(long, default_value_t = false)]
    paper: bool,

    #[arg(long)]
    listen_addr: Option<String>,

    #[arg(long)]
    ledger_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut settings = Settings::load(&args.config)?;
    if let Some(addr) = args.listen_addr {
        settings.listen_addr = addr;
    }
    if let Some(path) = args.ledger_path {
        settings.ledger_path = path;
    }
    bridge_swap::logging::init_with(&settings.logging).ok();

    let ledger = SqliteTradeLedger::open(settings.ledger_path.clone()).context("open ledger")?;
    tracing::info!(path = %ledger.path().display(), "ledger ready");
    let ledger = store::shared(ledger);

    let (chains, api) = if args.paper {
        let network = PaperNetwork::new(
            settings.source.paper_params()?,
            settings.destination.paper_params()?,
        );
        tracing::warn!("paper mode: no transaction leaves this process");
        let api: Arc<dyn AttestationApi> = network.guardian.clone();
        (network.chain_pair(), api)
    } else {
        let poll = settings.confirmation_poll_interval();
        let source = settings
            .source
            .remote_client(poll)
            .context("source chain client")?;
        let destination = settings
            .destination
            .remote_client(poll)
            .context("destination chain client")?;
        let guardian = GuardianRpc::new(
            settings.attestation.rpc_host.clone(),
            Duration::from_secs(settings.attestation.request_timeout_secs),
        )
        .context("guardian client")?;
        let api: Arc<dyn AttestationApi> = Arc::new(guardian);
        (ChainPair::new(Arc::new(source), Arc::new(destination)), api)
    };

    let attestations = AttestationClient::new(api, settings.attestation.backoff_policy());
    let orchestrator = Arc::new(
        SwapOrchestrator::new(
            settings.orchestrator_config(),
            chains,
            attestations,
            ledger.clone(),
        )
        .context("build orchestrator")?,
    );

    for chain in [Chain::Source, Chain::Destination] {
        match orchestrator.balances().balance(chain).await {
            Ok(balance) => tracing::info!(%chain, %balance, "wallet balance"),
            Err(err) => tracing::warn!(%chain, error = %err, "wallet balance unavailable"),
        }
    }

    let router_config = settings.router_config();
    let rules = router_config.rules.clone();
    let router = SignalRouter::new(router_config, ledger, orchestrator.balances().clone());
    let (tx, rx) = webhook::signal_channel();

    let _resume = worker::spawn_resume_worker(orchestrator.clone(), settings.resume_poll_interval());
    let consumer = tokio::spawn(worker::run_signal_loop(rx, router, orchestrator));

    match settings.alert_mode {
        AlertMode::Webhook => {
            let listener = TcpListener::bind(&settings.listen_addr)
                .await
                .with_context(|| format!("bind {}", settings.listen_addr))?;
            tokio::select! {
                res = webhook::serve(listener, tx) => res?,
                res = tokio::signal::ctrl_c() => {
                    res.context("listen for ctrl-c")?;
                    tracing::info!("shutting down");
                }
            }
        }
        AlertMode::Email => {
            let mailbox_settings = settings
                .mailbox
                .clone()
                .context("alert_mode email needs a mailbox section")?;
            let interval = mailbox_settings.poll_interval();
            tracing::info!(
                host = %mailbox_settings.host,
                folder = %mailbox_settings.folder,
                "watching mailbox for alerts"
            );
            let source = ImapMailbox::new(mailbox_settings).context("mailbox client")?;
            let poller = mailbox::spawn_mailbox_poller(source, rules, tx, interval);
            tokio::select! {
                res = poller => res.context("mailbox poller")?,
                res = tokio::signal::ctrl_c() => {
                    res.context("listen for ctrl-c")?;
                    tracing::info!("shutting down");
                }
            }
        }
    }

    consumer.abort();
    Ok(())
}
