use std::io::{Read, Write};
use std::time::Duration;

use anyhow::{Context as _, Result};
use chrono::{DateTime, Utc};
use mailparse::{MailHeaderMap as _, ParsedMail};
use native_tls::TlsConnector;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

use super::{SignalRules, TradeSignal};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxSettings {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
    #[serde(default = "default_folder")]
    pub folder: String,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Skip certificate verification, for self-signed local servers.
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

fn default_port() -> u16 {
    993
}

fn default_folder() -> String {
    "INBOX".to_string()
}

fn default_poll_interval_secs() -> u64 {
    15
}

impl MailboxSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Subject and plain-text body of one alert mail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertMail {
    pub subject: String,
    pub body: String,
}

impl AlertMail {
    /// The body must be a JSON object; the subject is merged into it so the
    /// router's subject gate sees it.
    pub fn into_signal(self, received_at: DateTime<Utc>) -> Result<TradeSignal> {
        let mut payload: Value =
            serde_json::from_str(self.body.trim()).context("mail body is not JSON")?;
        let Value::Object(fields) = &mut payload else {
            anyhow::bail!("mail body is not a JSON object");
        };
        fields.insert("subject".to_string(), Value::String(self.subject));
        Ok(TradeSignal::from_payload(payload, received_at))
    }
}

pub fn parse_alert_mail(raw: &[u8]) -> Result<AlertMail> {
    let mail = mailparse::parse_mail(raw).context("parse mail")?;
    let subject = mail
        .headers
        .get_first_value("Subject")
        .unwrap_or_default()
        .trim()
        .to_string();
    let part = plain_text(&mail).context("mail has no text/plain part")?;
    let body = part.get_body().context("decode mail body")?;
    Ok(AlertMail { subject, body })
}

fn plain_text<'a, 'b>(mail: &'a ParsedMail<'b>) -> Option<&'a ParsedMail<'b>> {
    if mail.subparts.is_empty() {
        return mail
            .ctype
            .mimetype
            .eq_ignore_ascii_case("text/plain")
            .then_some(mail);
    }
    mail.subparts.iter().find_map(|part| plain_text(part))
}

/// Raw RFC 822 messages that have not been seen yet. Fetching marks them
/// seen, so each message is returned once.
pub trait MailSource: Send + 'static {
    fn fetch_unseen(&mut self) -> Result<Vec<Vec<u8>>>;
}

/// IMAP over TLS. Opens a fresh session per poll.
pub struct ImapMailbox {
    settings: MailboxSettings,
    tls: TlsConnector,
}

impl ImapMailbox {
    pub fn new(settings: MailboxSettings) -> Result<Self> {
        let tls = TlsConnector::builder()
            .danger_accept_invalid_certs(settings.accept_invalid_certs)
            .build()
            .context("build TLS connector")?;
        Ok(Self { settings, tls })
    }
}

impl MailSource for ImapMailbox {
    fn fetch_unseen(&mut self) -> Result<Vec<Vec<u8>>> {
        let s = &self.settings;
        let client = imap::connect((s.host.as_str(), s.port), s.host.as_str(), &self.tls)
            .map_err(|e| anyhow::anyhow!("connect to {}:{}: {e}", s.host, s.port))?;
        let mut session = client
            .login(&s.username, &s.password)
            .map_err(|(e, _)| anyhow::anyhow!("login as {}: {e}", s.username))?;

        let fetched = fetch_unseen_in(&mut session, &s.folder);
        if let Err(err) = session.logout() {
            tracing::debug!(error = %err, "imap logout failed");
        }
        fetched
    }
}

fn fetch_unseen_in<T: Read + Write>(
    session: &mut imap::Session<T>,
    folder: &str,
) -> Result<Vec<Vec<u8>>> {
    session
        .select(folder)
        .map_err(|e| anyhow::anyhow!("select {folder}: {e}"))?;
    let mut unseen: Vec<_> = session
        .search("UNSEEN")
        .map_err(|e| anyhow::anyhow!("search {folder}: {e}"))?
        .into_iter()
        .collect();
    if unseen.is_empty() {
        return Ok(Vec::new());
    }
    unseen.sort_unstable();

    let set = unseen
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",");
    let fetches = session
        .fetch(set, "RFC822")
        .map_err(|e| anyhow::anyhow!("fetch from {folder}: {e}"))?;
    Ok(fetches
        .iter()
        .filter_map(|fetch| fetch.body().map(<[u8]>::to_vec))
        .collect())
}

/// Polls `source` and feeds trigger mails into the signal channel. Mails
/// with another subject, or without a JSON body, are skipped. Stops once
/// the signal consumer is gone.
pub fn spawn_mailbox_poller<S: MailSource>(
    source: S,
    rules: SignalRules,
    signals: mpsc::Sender<TradeSignal>,
    poll_interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut source = source;
        loop {
            let polled = tokio::task::spawn_blocking(move || {
                let fetched = source.fetch_unseen();
                (source, fetched)
            })
            .await;
            let fetched = match polled {
                Ok((returned, fetched)) => {
                    source = returned;
                    fetched
                }
                Err(err) => {
                    tracing::error!(error = %err, "mailbox poll task died; poller stopping");
                    return;
                }
            };

            match fetched {
                Ok(messages) => {
                    for raw in messages {
                        if !deliver(&raw, &rules, &signals) {
                            tracing::info!("signal channel closed; mailbox poller stopping");
                            return;
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %format!("{err:#}"), "mailbox poll failed");
                }
            }

            if signals.is_closed() {
                tracing::info!("signal channel closed; mailbox poller stopping");
                return;
            }
            tokio::time::sleep(poll_interval).await;
        }
    })
}

/// Returns false once the consumer has stopped.
fn deliver(raw: &[u8], rules: &SignalRules, signals: &mpsc::Sender<TradeSignal>) -> bool {
    let mail = match parse_alert_mail(raw) {
        Ok(mail) => mail,
        Err(err) => {
            tracing::debug!(error = %format!("{err:#}"), "skipping unreadable mail");
            return true;
        }
    };
    if !rules.accepts_subject(&mail.subject) {
        tracing::debug!(subject = %mail.subject, "skipping mail without trigger subject");
        return true;
    }

    let subject = mail.subject.clone();
    let signal = match mail.into_signal(Utc::now()) {
        Ok(signal) => signal,
        Err(err) => {
            tracing::warn!(%subject, error = %format!("{err:#}"), "trigger mail carries no alert");
            return true;
        }
    };
    let kind = signal.kind.clone();
    match signals.try_send(signal) {
        Ok(()) => {
            tracing::info!(%kind, %subject, "alert mail received");
            true
        }
        Err(TrySendError::Full(_)) => {
            tracing::warn!(%kind, "alert mail dropped: previous signal still being handled");
            true
        }
        Err(TrySendError::Closed(_)) => false,
    }
}
