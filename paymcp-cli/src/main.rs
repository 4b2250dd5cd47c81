//! Command-line MCP client.
//!
//! # Usage
//!
//! ```bash
//! # List the tools of a configured server
//! paymcp tools search
//!
//! # Call a tool on an ad-hoc URL, paying if the server asks
//! paymcp call https://mcp.example.com/mcp weather --args '{"city":"Oslo"}'
//!
//! # Use another configuration file
//! PAYMCP_CONFIG=/path/to/paymcp.toml paymcp prompts search
//! ```
//!
//! # Environment Variables
//!
//! - `PAYMCP_CONFIG` - Path to TOML configuration file (default: `paymcp.toml`)
//! - `RUST_LOG` - Log level filter (default: `info`)
//!
//! Logs go to stderr; results go to stdout.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use alloy_signer_local::PrivateKeySigner;
use clap::{Parser, Subcommand};
use paymcp::PaymentNegotiator;
use paymcp::ledger::InMemoryLedger;
use paymcp::policy::PaymentPolicy;
use paymcp_evm::{Eip155ExactSigner, EvmIdentity};
use paymcp_mcp::auth::{FileTokenStore, PopupBroker};
use paymcp_mcp::types::{CallToolParams, CallToolResult};
use paymcp_mcp::{ConnectionManager, HttpConnector, McpClient, PaidToolCaller, TransportResolver};
use serde_json::{Map, Value};
use tracing_subscriber::EnvFilter;

use paymcp_cli::config::ClientConfig;
use paymcp_cli::terminal;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[derive(Debug, Parser)]
#[command(name = "paymcp", version, about = "MCP client with DID signing, OAuth and x402 payments")]
struct Cli {
    /// Configuration file.
    #[arg(long, env = "PAYMCP_CONFIG", default_value = "paymcp.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the tools a server exposes.
    Tools {
        /// Configured server name or URL.
        server: String,
    },
    /// List the prompts a server exposes.
    Prompts {
        /// Configured server name or URL.
        server: String,
    },
    /// List resources and resource templates.
    Resources {
        /// Configured server name or URL.
        server: String,
    },
    /// Read a resource.
    Read {
        /// Configured server name or URL.
        server: String,
        /// Resource URI.
        uri: String,
    },
    /// Call a tool, paying for it if the server asks and policy allows.
    Call {
        /// Configured server name or URL.
        server: String,
        /// Tool name.
        tool: String,
        /// Arguments as a JSON object.
        #[arg(long, default_value = "{}")]
        args: String,
        /// Correlation id for the payment ledger.
        #[arg(long)]
        call_id: Option<String>,
    },
}

impl Command {
    fn server(&self) -> &str {
        match self {
            Self::Tools { server }
            | Self::Prompts { server }
            | Self::Resources { server }
            | Self::Read { server, .. }
            | Self::Call { server, .. } => server,
        }
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(Cli::parse()).await {
        tracing::error!("paymcp failed: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> CliResult<()> {
    let config = ClientConfig::load_from(&cli.config)?;
    tracing::debug!(
        path = %cli.config.display(),
        servers = config.servers.len(),
        payments = config.payment.is_some(),
        "loaded configuration"
    );
    let endpoint = config.endpoint(cli.command.server())?;

    let wallet = config
        .wallet
        .as_ref()
        .map(|wallet| wallet.private_key.trim().parse::<PrivateKeySigner>())
        .transpose()?
        .map(Arc::new);

    let broker = PopupBroker::new(config.oauth.redirect_url.clone());
    let collaborator = terminal::spawn(&broker);

    let resolver = TransportResolver::default()
        .with_probe_timeout(Duration::from_secs(config.probe_timeout_secs));
    let mut connector = HttpConnector::new(Arc::new(resolver)).with_oauth_store(
        Arc::new(FileTokenStore::new(config.oauth.token_file.clone())),
        broker,
        Duration::from_secs(config.oauth.popup_timeout_secs),
    );
    if let Some(signer) = &wallet {
        connector = connector.with_identity(Arc::new(EvmIdentity::new(
            Arc::clone(signer),
            config.chain_id(),
        )));
    }
    if let Some(operation) = &config.signing_operation {
        connector = connector.with_signing_operation(operation.clone());
    }

    let manager = ConnectionManager::new(connector);
    let outcome = async {
        let client = manager.get(&endpoint).await?;
        execute(&config, wallet, client, cli.command).await
    }
    .await;
    manager.close_all().await;
    collaborator.abort();
    outcome
}

async fn execute(
    config: &ClientConfig,
    wallet: Option<Arc<PrivateKeySigner>>,
    client: Arc<McpClient>,
    command: Command,
) -> CliResult<()> {
    let mut out = std::io::stdout();
    match command {
        Command::Tools { .. } => {
            for tool in client.tools().await? {
                writeln!(out, "{}\t{}", tool.name, tool.description.unwrap_or_default())?;
            }
        }
        Command::Prompts { .. } => {
            for prompt in client.prompts().await? {
                let arguments: Vec<_> = prompt.arguments.iter().map(|a| a.name.as_str()).collect();
                writeln!(
                    out,
                    "{}({})\t{}",
                    prompt.name,
                    arguments.join(", "),
                    prompt.description.unwrap_or_default()
                )?;
            }
        }
        Command::Resources { .. } => {
            for resource in client.resources().await? {
                writeln!(out, "{}\t{}", resource.uri, resource.name)?;
            }
            for template in client.resource_templates().await? {
                writeln!(out, "{}\t{}", template.uri_template, template.name)?;
            }
        }
        Command::Read { uri, .. } => {
            for contents in client.read_resource(&uri).await?.contents {
                match (contents.text, contents.blob) {
                    (Some(text), _) => writeln!(out, "{text}")?,
                    (None, Some(blob)) => writeln!(out, "{blob}")?,
                    (None, None) => {}
                }
            }
        }
        Command::Call {
            tool,
            args,
            call_id,
            ..
        } => {
            let arguments: Map<String, Value> = serde_json::from_str(&args)?;
            let params = CallToolParams::new(tool).with_arguments(arguments);
            let result = call_tool(config, wallet, client, params, call_id.as_deref()).await?;
            writeln!(out, "{}", result.text())?;
            if result.is_error {
                return Err("tool returned an error".into());
            }
        }
    }
    Ok(())
}

/// Calls a tool, through the payment negotiator when a policy and a wallet
/// are configured.
async fn call_tool(
    config: &ClientConfig,
    wallet: Option<Arc<PrivateKeySigner>>,
    client: Arc<McpClient>,
    params: CallToolParams,
    call_id: Option<&str>,
) -> CliResult<CallToolResult> {
    let (Some(payment), Some(signer)) = (&config.payment, wallet) else {
        if config.payment.is_some() {
            tracing::warn!("payment configured without a wallet; calling unpaid");
        }
        return Ok(client.call_tool(params).await?);
    };

    let negotiator = PaymentNegotiator::new(
        PaymentPolicy::new(payment.network.clone(), payment.max_amount),
        Arc::new(Eip155ExactSigner::new(signer)),
        Arc::new(InMemoryLedger::new()),
    );
    let paid = PaidToolCaller::new(client, negotiator)
        .call_tool_with_id(params, call_id)
        .await?;
    if paid.paid {
        match &paid.receipt {
            Some(receipt) => tracing::info!(
                success = receipt.success,
                transaction = receipt.transaction.as_deref().unwrap_or("-"),
                "payment settled"
            ),
            None => tracing::info!("payment sent, no receipt returned"),
        }
    }
    Ok(paid.result)
}
