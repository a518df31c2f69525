// Copyright 2026 The Bedrock Relay Project
// SPDX-License-Identifier: Apache-2.0

use clap::Parser;

use bedrock_relay::auth::{Credential, RequestSigner};
use bedrock_relay::backend::BedrockBackend;
use bedrock_relay::client::SignedHttpClient;
use bedrock_relay::config;
use bedrock_relay::proxy::{self, AppState};
use bedrock_relay::usage::InMemoryUsage;

use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "bedrock-relay", about = "Signed inference relay for Amazon Bedrock")]
struct Cli {
    /// Path to the relay.yaml config file. Defaults apply when omitted.
    #[arg(long, env = "RELAY_CONFIG")]
    config: Option<String>,

    /// Port to listen on
    #[arg(long, default_value_t = 9900, env = "RELAY_PORT")]
    port: u16,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .json()
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => {
            let source = config::FileSource {
                path: std::path::PathBuf::from(path),
            };
            match config::load_config(&source) {
                Ok(c) => c,
                Err(e) => {
                    tracing::error!("failed to load config: {e}");
                    std::process::exit(1);
                }
            }
        }
        None => config::RelayConfig::default(),
    };

    let region = config.resolved_region();
    tracing::info!(
        endpoint = %config.endpoint,
        region = %region,
        streaming = ?config.streaming,
        "config loaded"
    );

    let credential = match Credential::from_env() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("cannot sign backend calls: {e}");
            std::process::exit(1);
        }
    };

    let mut client = SignedHttpClient::new(
        reqwest::Client::new(),
        RequestSigner::new(region, "bedrock"),
        credential,
    );
    if let Some(timeout_ms) = config.timeout_ms {
        client = client.with_timeout(std::time::Duration::from_millis(timeout_ms));
    }
    let backend =
        BedrockBackend::new(client, config.endpoint.clone()).with_inference_defaults(config.inference);

    let state = AppState {
        backend: Arc::new(backend),
        usage: Arc::new(InMemoryUsage::new()),
        auth: config.auth.clone(),
        streaming: config.streaming,
    };
    let app = proxy::build_router(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], cli.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind to address");

    tracing::info!(%addr, "bedrock-relay listening");

    axum::serve(listener, app).await.expect("server error");
}
