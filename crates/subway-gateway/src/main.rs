//! # subway-gateway
//!
//! Gateway binary: loads settings, wires authentication and the demo executor,
//! and serves the subscription protocol until ctrl-c.

#![deny(unsafe_code)]

mod demo;

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use subway_auth::{
    AuthorizationGate, AuthorizationRequirements, PolicyRegistry, RequireRole,
    StaticTokenAuthenticator,
};
use subway_core::logging;
use subway_server::{ConnectionServices, GatewayServer};
use subway_settings::{AuthSettings, GatewaySettings, load_settings_from_path, settings_path};

use crate::demo::DemoExecutor;

/// Prefix of the role policies registered at startup.
const ROLE_POLICY_PREFIX: &str = "role:";

/// Subway subscription gateway.
#[derive(Parser, Debug)]
#[command(name = "subway-gateway", about = "GraphQL-over-WebSocket subscription gateway")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Path to the settings file.
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Log filter (overrides settings; `RUST_LOG` wins over both).
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn apply(&self, settings: &mut GatewaySettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
    }
}

/// One `role:<name>` policy for every role named in the auth settings.
fn role_policies(auth: &AuthSettings) -> PolicyRegistry {
    let registry = PolicyRegistry::new();
    let roles: BTreeSet<&String> = auth
        .authorized_roles
        .iter()
        .chain(auth.tokens.values().flat_map(|grant| grant.roles.iter()))
        .collect();
    for role in roles {
        registry.register(&format!("{ROLE_POLICY_PREFIX}{role}"), RequireRole(role.clone()));
    }
    registry
}

fn build_services(settings: &GatewaySettings) -> ConnectionServices {
    let evaluator = Arc::new(role_policies(&settings.auth));
    let gate = AuthorizationGate::new(AuthorizationRequirements::from(&settings.auth), evaluator);
    let authenticator = StaticTokenAuthenticator::from_grants(&settings.auth.tokens);
    tracing::info!(
        tokens = authenticator.len(),
        auth_required = settings.auth.has_requirements(),
        "authentication configured"
    );

    ConnectionServices::new(Arc::new(DemoExecutor::new(gate.clone())))
        .with_authenticator(Arc::new(authenticator))
        .with_gate(gate)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let path = args.settings.clone().unwrap_or_else(settings_path);
    let mut settings = load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    args.apply(&mut settings);

    if settings.logging.json {
        logging::init_json_subscriber(&settings.logging.level);
    } else {
        logging::init_subscriber(&settings.logging.level);
    }

    let metrics = subway_server::metrics::install_recorder()
        .context("Failed to install metrics recorder")?;
    let services = build_services(&settings);
    let ws_path = settings.server.path.clone();

    let server = GatewayServer::new(settings, services).with_metrics(metrics);
    let (addr, handle) = server.listen().await.context("Failed to bind server")?;
    tracing::info!("Subway gateway listening on ws://{addr}{ws_path}");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    server.shutdown_gracefully(Some(handle)).await;
    Ok(())
}
