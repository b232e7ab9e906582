use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _};
use clap::{Parser, ValueEnum};
use colored::Colorize;
use tokio::io::AsyncWriteExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tpx_runtime::diagnostics::StderrSink;
use tpx_runtime::{Context, Engine, Execution, RequestConfig};

#[derive(Parser)]
#[command(name = "tpx")]
#[command(about = "Execute one HTTP request described by a JSON file or flags")]
#[command(version)]
struct Cli {
    /// URL to request; overrides the description file
    #[arg(value_name = "URL")]
    url: Option<String>,

    /// JSON request description
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// HTTP method to use
    #[arg(short = 'X', long)]
    method: Option<String>,

    /// Request headers (format: "Name: Value")
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,

    /// Inline request body
    #[arg(short, long)]
    data: Option<String>,

    /// Proxy URL (http://, socks5://, socks5h://)
    #[arg(short = 'x', long)]
    proxy: Option<String>,

    /// Retries after the first attempt
    #[arg(long)]
    retry: Option<u32>,

    /// Fail when the body is larger than this many bytes
    #[arg(long, value_name = "BYTES")]
    max_size: Option<u64>,

    /// Ask for a compressed response and decode it
    #[arg(long)]
    compressed: bool,

    /// Follow redirects
    #[arg(short = 'L', long)]
    location: bool,

    /// Skip certificate verification
    #[arg(short = 'k', long)]
    insecure: bool,

    /// Fallback request timeout in milliseconds
    #[arg(short = 'm', long, value_name = "MS")]
    timeout_ms: Option<u64>,

    /// Overall deadline in milliseconds; replaces the fallback timeout
    #[arg(long, value_name = "MS")]
    deadline_ms: Option<u64>,

    /// Write the body to this file instead of stdout
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Trace the exchange on stderr
    #[arg(short, long)]
    verbose: bool,

    /// Output format
    #[arg(short, long, default_value = "body")]
    format: OutputFormat,
}

#[derive(ValueEnum, Clone, Copy)]
enum OutputFormat {
    Body,
    Json,
    Headers,
}

impl Cli {
    fn request_config(&self) -> anyhow::Result<RequestConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let json = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                RequestConfig::from_json(&json).with_context(|| format!("parsing {}", path.display()))?
            }
            None => RequestConfig::default(),
        };

        if let Some(url) = &self.url {
            config.url = url.clone();
        }
        if let Some(method) = &self.method {
            config = config.method(method);
        }
        for header in &self.headers {
            config = config.header(header);
        }
        if let Some(data) = &self.data {
            config = config.text_body(data);
        }
        if let Some(proxy) = &self.proxy {
            config = config.proxy(proxy);
        }
        if let Some(retries) = self.retry {
            config.retry.max_retries = retries;
        }
        if let Some(limit) = self.max_size {
            config = config.max_response_size(limit);
        }
        if let Some(ms) = self.timeout_ms {
            config = config.timeout(Duration::from_millis(ms));
        }
        config.compressed |= self.compressed;
        config.follow_redirects |= self.location;
        config.tls.insecure |= self.insecure;
        config.verbose |= self.verbose;

        if config.url.is_empty() {
            bail!("no URL given; pass one or set \"url\" in the description file");
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tpx_runtime=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = cli.request_config()?;

    let root = Context::background();
    let ctx = match cli.deadline_ms {
        Some(ms) => root.with_timeout(Duration::from_millis(ms)),
        None => root.child(),
    };
    let interrupt = root.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let engine = Engine::builder().diagnostic_sink(Arc::new(StderrSink)).build();
    let execution = engine.execute(&ctx, &config).await?;

    match cli.format {
        OutputFormat::Body => write_body(&execution, cli.output.as_ref()).await?,
        OutputFormat::Headers => print_headers(&execution),
        OutputFormat::Json => {
            let headers: serde_json::Map<String, serde_json::Value> = execution
                .headers()
                .iter()
                .map(|(name, value)| {
                    (
                        name.to_string(),
                        serde_json::Value::String(value.to_str().unwrap_or("").to_string()),
                    )
                })
                .collect();
            let summary = serde_json::json!({
                "status": execution.status().as_u16(),
                "url": execution.url().as_str(),
                "attempts": execution.attempts(),
                "elapsed_ms": execution.elapsed().as_millis() as u64,
                "headers": headers,
                "body": execution.text(),
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    Ok(())
}

async fn write_body(execution: &Execution, output: Option<&PathBuf>) -> anyhow::Result<()> {
    match output {
        Some(path) => execution
            .save_to(path)
            .await
            .with_context(|| format!("writing {}", path.display()))?,
        None => {
            let mut stdout = tokio::io::stdout();
            execution.write_to(&mut stdout).await?;
            stdout.flush().await?;
        }
    }
    Ok(())
}

fn print_headers(execution: &Execution) {
    let status = execution.status();
    let line = format!("{:?} {}", execution.version(), status);
    let line = if status.is_success() {
        line.green()
    } else if status.is_redirection() {
        line.yellow()
    } else {
        line.red()
    };
    println!("{}", line.bold());
    for (name, value) in execution.headers() {
        println!("{}: {}", name.as_str().cyan(), value.to_str().unwrap_or("<binary>"));
    }
}
