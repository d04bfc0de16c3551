use ami_mqtt_client::{
    AmiClient, ClientConfig, ClientHooks, ExecuteOptions, ResponseData, SubscribeOptions,
};
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const READY_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Parser, Debug)]
#[command(name = "ami-mqtt", version, about = "Execute AMI commands over MQTT")]
struct Cli {
    /// Client config file (defaults to the platform config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Broker URL, overrides the config file
    #[arg(long)]
    endpoint: Option<String>,

    /// Bearer token used to sign in
    #[arg(long, env = "AMI_TOKEN", hide_env_values = true)]
    token: String,

    /// AMI server name; discovered when omitted
    #[arg(long)]
    server_name: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute one command and print its response
    Exec {
        command: String,

        /// Values for the `=?` placeholders, in order; JSON literals are accepted
        params: Vec<String>,

        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Print messages arriving on the given topics until Ctrl-C
    Listen {
        #[arg(required = true)]
        topics: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;
    let cli = Cli::parse();

    let config = load_config(&cli).await?;
    match &cli.command {
        Command::Exec {
            command,
            params,
            timeout_ms,
        } => exec(&cli, config, command, params, *timeout_ms).await,
        Command::Listen { topics } => listen(&cli, config, topics).await,
    }
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .init();
}

async fn load_config(cli: &Cli) -> Result<ClientConfig> {
    let path = cli
        .config
        .clone()
        .or_else(|| ClientConfig::default_path().filter(|path| path.exists()));

    let mut config = match (path, &cli.endpoint) {
        (Some(path), _) => ClientConfig::load(&path).await?,
        (None, Some(endpoint)) => {
            debug!("No config file, using defaults");
            ClientConfig::new(endpoint.clone())
        }
        (None, None) => return Err(eyre!("No config file found and no --endpoint given")),
    };

    if let Some(endpoint) = &cli.endpoint {
        config.endpoint = endpoint.clone();
    }
    Ok(config)
}

async fn connect(cli: &Cli, config: ClientConfig, hooks: ClientHooks) -> Result<AmiClient> {
    let client = AmiClient::over_mqtt(config, hooks)?;
    client
        .sign_in(&cli.token, cli.server_name.as_deref())
        .await?;
    client.ready(READY_TIMEOUT).await?;
    info!(
        "Ready as {} on server {}",
        client.username().unwrap_or_default(),
        client.server_name().unwrap_or_default()
    );
    Ok(client)
}

async fn exec(
    cli: &Cli,
    config: ClientConfig,
    command: &str,
    params: &[String],
    timeout_ms: Option<u64>,
) -> Result<()> {
    let client = connect(cli, config, ClientHooks::new()).await?;

    let mut options = ExecuteOptions::with_params(params.iter().map(|param| parse_param(param)));
    if let Some(ms) = timeout_ms {
        options = options.timeout(Duration::from_millis(ms));
    }

    let outcome = client.execute(command, options).await;
    client.sign_out().await;
    let response = outcome?;

    match &response.data {
        ResponseData::Json(json) => println!("{}", serde_json::to_string_pretty(json)?),
        ResponseData::Text(text) => println!("{}", text),
    }
    if !response.message.is_empty() {
        info!("{}", response.message);
    }
    Ok(())
}

async fn listen(cli: &Cli, config: ClientConfig, topics: &[String]) -> Result<()> {
    let hooks = ClientHooks::new()
        .on_message_arrived(|message| println!("[{}] {}", message.topic, message.payload))
        .on_connection_lost(|cause| warn!("Connection lost: {}", cause))
        .on_connected(|reconnect, endpoint| {
            if reconnect {
                info!("Reconnected to {}", endpoint);
            }
        });
    let client = connect(cli, config, hooks).await?;

    for topic in topics {
        client.subscribe(topic, SubscribeOptions::default()).await?;
        info!("Listening on {}", topic);
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    client.sign_out().await;
    Ok(())
}

/// Command-line parameters are JSON literals when they parse as one, strings otherwise.
fn parse_param(param: &str) -> Value {
    serde_json::from_str(param).unwrap_or_else(|_| Value::String(param.to_string()))
}
