//! Dapp-side pairing walkthrough against a live relay.
//!
//! Starts a core, proposes a session, and prints the `wc:` URI for a wallet
//! to scan. The demo then waits for the wallet to approve and fires one
//! request over the settled session.
//!
//! Run with: `PROJECT_ID=<your id> cargo run --example pairing_demo`

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::json;
use signet_core::sign::types::{AppMetadata, ProposedNamespace, RequestParams};
use signet_core::sign::ConnectParams;
use signet_core::{ClientEvent, Core, CoreConfig, Result, SignClient};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "signet_core=debug".into()),
        )
        .init();

    let project_id = std::env::var("PROJECT_ID").unwrap_or_default();
    if project_id.is_empty() {
        eprintln!("set PROJECT_ID to a relay project id");
        std::process::exit(1);
    }

    let core = Core::new(CoreConfig {
        project_id,
        ..Default::default()
    })
    .await?;
    core.start().await?;

    let client = SignClient::new(
        core.clone(),
        AppMetadata {
            name: "Signet Demo Dapp".into(),
            description: "Pairing walkthrough".into(),
            url: "https://example.com".into(),
            icons: vec![],
        },
    )
    .await?;

    let mut events = client.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            println!("event: {event:?}");
        }
    });

    let mut required = BTreeMap::new();
    required.insert(
        "eip155".to_string(),
        ProposedNamespace {
            chains: vec!["eip155:1".into()],
            methods: vec!["personal_sign".into()],
            events: vec!["accountsChanged".into()],
        },
    );

    let connect = client
        .connect(ConnectParams {
            pairing_topic: None,
            required_namespaces: required,
            optional_namespaces: BTreeMap::new(),
        })
        .await?;

    if let Some(uri) = &connect.uri {
        println!("\nscan with a wallet:\n\n  {uri}\n");
    }

    println!("waiting for approval (5 minutes)...");
    let session = tokio::time::timeout(
        Duration::from_secs(300),
        connect.approval.await_approval(),
    )
    .await
    .map_err(|_| signet_core::Error::Timeout("No approval before the URI expired".into()))??;

    println!("settled session on topic {}", session.topic);

    let signature = client
        .request(
            &session.topic,
            RequestParams {
                request: signet_core::sign::types::SessionRequestData {
                    method: "personal_sign".into(),
                    params: json!(["0x68656c6c6f", "eip155:1:0x0"]),
                    expiry: None,
                },
                chain_id: "eip155:1".into(),
            },
            None,
        )
        .await?;
    println!("wallet answered: {signature}");

    client.disconnect(&session.topic).await?;
    core.shutdown().await?;
    Ok(())
}
