use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use iam_mcp::types::{CallToolParams, ListToolsParams};
use iam_mcp::{McpClient, SignedHttpTransportOptions};
use iam_mcp_sigv4::{SigV4Signer, SigningScope, default_provider};
use tracing::info;
use url::Url;

#[derive(Debug, Parser)]
#[command(
    name = "iam-mcp-client",
    version,
    about = "Call a tool on an IAM-protected MCP server"
)]
struct Args {
    /// MCP streamable HTTP endpoint.
    #[arg(long, env = "MCP_SERVER_URL", default_value = "http://localhost:8080")]
    server_url: Url,

    /// Region the signature is scoped to.
    #[arg(long, env = "AWS_REGION", default_value = "us-east-1")]
    region: String,

    /// Service name used in the signing scope.
    #[arg(long, env = "IAM_MCP_SIGNING_SERVICE", default_value = "lambda")]
    service: String,

    #[arg(long, default_value = "calculate")]
    tool: String,

    /// Tool arguments as a JSON object.
    #[arg(long, default_value = r#"{"a":3,"b":9,"operation":"add"}"#)]
    arguments: String,

    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,
}

fn init_tracing(default_env_filter: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_env_filter.into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing("info");
    if let Err(e) = run(Args::parse()).await {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let arguments: serde_json::Value =
        serde_json::from_str(&args.arguments).context("parse --arguments as json")?;
    if !arguments.is_object() {
        anyhow::bail!("--arguments must be a json object");
    }

    let signer = SigV4Signer::new(
        SigningScope::new(args.service, args.region),
        default_provider(),
    );
    let mut opts = SignedHttpTransportOptions::new(args.server_url.clone());
    opts.timeout = Duration::from_secs(args.timeout_secs);

    let mut client = McpClient::connect(opts, signer)?;
    info!(endpoint = %args.server_url, "connecting");
    client
        .initialize("iam-mcp-client", env!("CARGO_PKG_VERSION"))
        .await
        .context("initialize mcp session")?;

    let tools = client
        .list_tools(ListToolsParams::default())
        .await
        .context("list tools")?;
    println!("{}", serde_json::to_string_pretty(&tools)?);

    let result = client
        .call_tool(CallToolParams {
            name: args.tool.clone(),
            arguments: Some(arguments),
        })
        .await
        .with_context(|| format!("call tool {}", args.tool))?;
    println!("{}", serde_json::to_string_pretty(&result)?);

    Ok(())
}
