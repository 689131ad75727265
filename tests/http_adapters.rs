use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context as _, Result};
use axum::extract::Path;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use bridge_swap::bridge::guardian::GuardianRpc;
use bridge_swap::bridge::{
    Attestation, AttestationApi as _, AttestationKey, EmitterAddress, PollError, PollOutcome,
};
use bridge_swap::chain::remote::RemoteChainClient;
use bridge_swap::chain::{Beneficiary, ChainClient as _, ChainError, TxId};
use rust_decimal_macros::dec;
use serde_json::{Value, json};
use tokio::net::TcpListener;

const EMITTER_BYTE: u8 = 0xec;

async fn spawn(app: Router) -> Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .context("bind mock server")?;
    let addr = listener.local_addr().context("mock server addr")?;
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    Ok(addr)
}

async fn transfer(Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    let amount: f64 = body["amount"]
        .as_str()
        .and_then(|s| s.parse().ok())
        .unwrap_or_default();
    if amount > 100.0 {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "amount too large"})),
        );
    }
    (StatusCode::OK, Json(json!({"tx_id": "t-1"})))
}

async fn transaction(Path(id): Path<String>) -> (StatusCode, Json<Value>) {
    match id.as_str() {
        "t-1" => (
            StatusCode::OK,
            Json(json!({
                "status": "confirmed",
                "receipt": {
                    "tx_id": "t-1",
                    "block_height": 42,
                    "events": [
                        {"kind": "message_published", "emitter": hex::encode([EMITTER_BYTE; 32]), "sequence": 7}
                    ]
                }
            })),
        ),
        "t-pending" => (StatusCode::OK, Json(json!({"status": "pending"}))),
        "t-reverted" => (
            StatusCode::OK,
            Json(json!({"status": "reverted", "reason": "out of gas"})),
        ),
        _ => (StatusCode::NOT_FOUND, Json(json!({}))),
    }
}

fn agent() -> Router {
    Router::new()
        .route("/v1/transfers", post(transfer))
        .route("/v1/transactions/{id}", get(transaction))
        .route(
            "/v1/redemptions/lookup",
            post(|| async { Json(json!({"tx_id": null})) }),
        )
        .route(
            "/v1/redemptions",
            post(|| async {
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"error": "node syncing"})),
                )
            }),
        )
        .route(
            "/v1/balances/{address}",
            get(|| async { Json(json!({"amount": "12.5"})) }),
        )
}

fn attestation() -> Attestation {
    Attestation {
        key: AttestationKey {
            emitter_chain: 1,
            emitter_address: EmitterAddress::from_bytes([EMITTER_BYTE; 32]),
            sequence: 7,
        },
        vaa: "AQID".to_string(),
    }
}

#[tokio::test]
async fn remote_chain_client_speaks_agent_protocol() -> Result<()> {
    let addr = spawn(agent()).await?;
    let client = RemoteChainClient::new(
        format!("http://{addr}/"),
        "solana",
        1,
        "wallet-1",
        EmitterAddress::from_bytes([EMITTER_BYTE; 32]),
        Duration::from_millis(10),
    )?;
    let beneficiary = Beneficiary {
        chain_id: 2,
        address: "0xbeef".to_string(),
    };

    let tx_id = client.submit_transfer(dec!(1.5), &beneficiary).await?;
    assert_eq!(tx_id, TxId::new("t-1"));

    let receipt = client
        .await_confirmation(&tx_id, Duration::from_secs(1))
        .await?;
    assert_eq!(receipt.block_height, 42);
    assert_eq!(client.extract_sequence(&receipt)?, 7);

    assert_eq!(client.query_balance("wallet-1").await?, dec!(12.5));
    assert_eq!(client.find_redemption(&attestation()).await?, None);
    Ok(())
}

#[tokio::test]
async fn remote_chain_client_classifies_failures() -> Result<()> {
    let addr = spawn(agent()).await?;
    let client = RemoteChainClient::new(
        format!("http://{addr}"),
        "solana",
        1,
        "wallet-1",
        EmitterAddress::from_bytes([EMITTER_BYTE; 32]),
        Duration::from_millis(10),
    )?;
    let beneficiary = Beneficiary {
        chain_id: 2,
        address: "0xbeef".to_string(),
    };

    let err = client
        .submit_transfer(dec!(1000), &beneficiary)
        .await
        .expect_err("agent rejects large transfers");
    assert!(matches!(&err, ChainError::Rejected(msg) if msg == "amount too large"));
    assert!(!err.is_retryable());

    let err = client
        .await_confirmation(&TxId::new("t-pending"), Duration::from_millis(50))
        .await
        .expect_err("never confirms");
    assert!(matches!(err, ChainError::Timeout(_)));
    assert!(err.is_retryable());

    let err = client
        .await_confirmation(&TxId::new("t-reverted"), Duration::from_secs(1))
        .await
        .expect_err("reverted");
    assert!(matches!(&err, ChainError::Reverted { reason, .. } if reason == "out of gas"));

    let err = client
        .submit_redeem(&attestation())
        .await
        .expect_err("agent is down");
    assert!(matches!(err, ChainError::Transport(_)));
    Ok(())
}

async fn signed_vaa(Path((chain, emitter, sequence)): Path<(u16, String, u64)>) -> (StatusCode, Json<Value>) {
    if chain != 1 || emitter != hex::encode([EMITTER_BYTE; 32]) {
        return (StatusCode::BAD_REQUEST, Json(json!({"message": "bad key"})));
    }
    match sequence {
        1 => (StatusCode::OK, Json(json!({"vaaBytes": "AQID"}))),
        2 => (StatusCode::NOT_FOUND, Json(json!({"code": 5}))),
        3 => (StatusCode::SERVICE_UNAVAILABLE, Json(json!({}))),
        _ => (StatusCode::OK, Json(json!({"unexpected": true}))),
    }
}

#[tokio::test]
async fn guardian_rpc_maps_http_responses_to_poll_outcomes() -> Result<()> {
    let addr = spawn(Router::new().route(
        "/v1/signed_vaa/{chain}/{emitter}/{sequence}",
        get(signed_vaa),
    ))
    .await?;
    let rpc = GuardianRpc::new(format!("http://{addr}"), Duration::from_secs(2))?;
    let key = |sequence| AttestationKey {
        emitter_chain: 1,
        emitter_address: EmitterAddress::from_bytes([EMITTER_BYTE; 32]),
        sequence,
    };

    match rpc.poll(&key(1)).await {
        Ok(PollOutcome::Ready(att)) => {
            assert_eq!(att.vaa, "AQID");
            assert_eq!(att.key, key(1));
        }
        other => panic!("expected ready, got {other:?}"),
    }
    assert!(matches!(rpc.poll(&key(2)).await, Ok(PollOutcome::NotYet)));
    assert!(matches!(rpc.poll(&key(3)).await, Err(PollError::Transient(_))));
    assert!(matches!(rpc.poll(&key(4)).await, Err(PollError::Malformed(_))));

    let mut wrong_chain = key(1);
    wrong_chain.emitter_chain = 9;
    assert!(matches!(
        rpc.poll(&wrong_chain).await,
        Err(PollError::Malformed(_))
    ));
    Ok(())
}

#[tokio::test]
async fn guardian_rpc_treats_unreachable_host_as_transient() -> Result<()> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    drop(listener);

    let rpc = GuardianRpc::new(format!("http://{addr}"), Duration::from_millis(500))?;
    let key = AttestationKey {
        emitter_chain: 1,
        emitter_address: EmitterAddress::from_bytes([EMITTER_BYTE; 32]),
        sequence: 1,
    };
    assert!(matches!(rpc.poll(&key).await, Err(PollError::Transient(_))));
    Ok(())
}
