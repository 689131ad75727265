use std::time::Duration;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;

use super::{Attestation, AttestationApi, AttestationKey, PollError, PollOutcome};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignedVaaResponse {
    vaa_bytes: Option<String>,
}

/// Guardian network public REST endpoint.
#[derive(Clone)]
pub struct GuardianRpc {
    http: reqwest::Client,
    host: String,
}

impl GuardianRpc {
    pub fn new(host: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("build guardian http client")?;
        Ok(Self {
            http,
            host: host.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn signed_vaa_url(&self, key: &AttestationKey) -> String {
        format!(
            "{}/v1/signed_vaa/{}/{}/{}",
            self.host, key.emitter_chain, key.emitter_address, key.sequence
        )
    }
}

#[async_trait]
impl AttestationApi for GuardianRpc {
    async fn poll(&self, key: &AttestationKey) -> Result<PollOutcome, PollError> {
        let url = self.signed_vaa_url(key);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| PollError::Transient(anyhow::Error::new(e).context("GET signed_vaa")))?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(PollOutcome::NotYet);
        }
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(PollError::Transient(anyhow::anyhow!(
                "guardian returned {status}"
            )));
        }
        if !status.is_success() {
            return Err(PollError::Malformed(format!("guardian returned {status}")));
        }

        let body: SignedVaaResponse = resp
            .json()
            .await
            .map_err(|e| PollError::Malformed(format!("decode signed_vaa body: {e}")))?;
        match body.vaa_bytes {
            Some(vaa) if !vaa.is_empty() => Ok(PollOutcome::Ready(Attestation {
                key: key.clone(),
                vaa,
            })),
            _ => Err(PollError::Malformed("response without vaaBytes".to_string())),
        }
    }
}
