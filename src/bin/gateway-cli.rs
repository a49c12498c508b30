use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::Value;
use url::Url;

#[derive(Parser)]
#[command(name = "gateway-cli")]
#[command(about = "Management CLI for the withme.travel gateway", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8080")]
    url: String,

    #[arg(short, long, env = "WITHME_GATEWAY_ADMIN_KEY")]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check gateway status
    Status,
    /// Show rate limit rules and tracked keys
    Limits,
    /// Show request registry counts
    Registry,
    /// Forget a client's rate limit state across all rules
    ResetClient { client: String },
    /// Drop a request registry key (e.g. "10.0.0.1 POST /api/ideas/7/vote")
    ClearKey { key: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", cli.key))?,
    );

    let base = Url::parse(&cli.url)?;
    let request = match &cli.command {
        Commands::Status => client.get(admin_url(&base, &["status"])?),
        Commands::Limits => client.get(admin_url(&base, &["limits"])?),
        Commands::Registry => client.get(admin_url(&base, &["registry"])?),
        Commands::ResetClient { client: target } => {
            client.delete(admin_url(&base, &["limits", target.as_str()])?)
        }
        Commands::ClearKey { key } => {
            client.delete(admin_url(&base, &["registry", key.as_str()])?)
        }
    };

    let res = request.headers(headers).send().await?;
    print_response(res).await
}

/// `{base}/admin/{segments..}`, each segment percent-encoded on its own.
fn admin_url(base: &Url, segments: &[&str]) -> Result<Url, String> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| format!("{} cannot be used as a base URL", base))?
        .pop_if_empty()
        .push("admin")
        .extend(segments);
    Ok(url)
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: Admin API returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        return Ok(());
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
