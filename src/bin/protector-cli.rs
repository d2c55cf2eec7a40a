use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "protector-cli")]
#[command(about = "Operator CLI for the network protector", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://127.0.0.1:8080")]
    url: String,

    /// Bearer token, needed when the protector requires auth
    #[arg(short, long, env = "PROTECTOR_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show decision counters and persistence status
    Stats,
    /// Mint a new bearer token
    Token,
    /// Revoke a bearer token
    Revoke { token: String },
    /// Block an identity
    Block {
        identity: String,
        #[arg(short, long)]
        reason: Option<String>,
    },
    /// Lift a block on an identity
    Unblock { identity: String },
    /// Mark an identity as allowed
    Allow {
        identity: String,
        #[arg(short, long)]
        reason: Option<String>,
    },
    /// List recent threat events
    Threats {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// List access entries
    Entries,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();
    let base = cli.url.trim_end_matches('/');

    let mut headers = HeaderMap::new();
    if let Some(token) = &cli.token {
        headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {token}"))?);
    }

    let request = match cli.command {
        Commands::Stats => client.get(format!("{base}/protection/stats")),
        Commands::Token => client.post(format!("{base}/protection/token/generate")),
        Commands::Revoke { token } => client
            .post(format!("{base}/protection/token/revoke"))
            .json(&json!({ "token": token })),
        Commands::Block { identity, reason } => client
            .post(format!("{base}/protection/block/{identity}"))
            .json(&json!({ "reason": reason })),
        Commands::Unblock { identity } => client.post(format!("{base}/protection/unblock/{identity}")),
        Commands::Allow { identity, reason } => client
            .post(format!("{base}/protection/allow/{identity}"))
            .json(&json!({ "reason": reason })),
        Commands::Threats { limit } => client.get(format!("{base}/protection/threats?limit={limit}")),
        Commands::Entries => client.get(format!("{base}/protection/entries")),
    };

    let res = request.headers(headers).send().await?;
    print_response(res).await
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: protector returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        std::process::exit(1);
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
