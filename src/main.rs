use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use lockbridge::client::LockClient;
use lockbridge::command::envelope::ResponseEnvelope;
use lockbridge::command::pending::PendingTable;
use lockbridge::config;
use lockbridge::device::history::HistoryQuery;
use lockbridge::mqtt::message_manager::SubscriptionRouter;
use lockbridge::mqtt::mqtt_handler::MqttHandle;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "lockbridge", version, about = "Operate a smart lock over MQTT")]
struct Cli {
    /// Config file (default: ~/.config/lockbridge/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Device to talk to, overrides the config
    #[arg(long)]
    device: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Lock,
    Unlock,
    /// Ask the device for its current status
    Status,
    /// Follow status broadcasts until Ctrl-C, then print the action history
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;
    let cli = Cli::parse();

    let app_config = config::load(cli.config.as_deref())?;
    let device_id = cli
        .device
        .clone()
        .unwrap_or_else(|| app_config.device.device_id.clone());

    let transport = Arc::new(MqttHandle::new(
        Arc::new(SubscriptionRouter::new()),
        Arc::new(PendingTable::new()),
    ));
    let mut client = LockClient::over_mqtt(transport.clone(), app_config.client_settings());
    if let Some(signer) = app_config.signer()? {
        info!("Signing commands with the configured key");
        client = client.with_signer(Arc::new(signer));
    }

    transport
        .connect(
            &app_config.broker_address(),
            &config::credentials_from_env(),
            app_config.connect_options(),
        )
        .await
        .map_err(|e| eyre!("Failed to connect: {}", e))?;
    client.attach_device(&device_id).await?;

    let result = run(&client, &device_id, cli.command).await;
    transport.disconnect().await;
    result
}

async fn run(client: &LockClient, device_id: &str, command: Command) -> Result<()> {
    match command {
        Command::Lock => report(client.lock(device_id).await?),
        Command::Unlock => report(client.unlock(device_id).await?),
        Command::Status => {
            report(client.get_status(device_id).await?);
            match client.store().snapshot(device_id) {
                Some(status) => println!("{}", serde_json::to_string_pretty(&status)?),
                None => warn!("Device {} sent no status yet", device_id),
            }
        }
        Command::Watch => watch(client, device_id).await?,
    }
    Ok(())
}

fn report(response: ResponseEnvelope) {
    info!(
        "{} answered {} ({:?})",
        response.device_id, response.request_id, response.status
    );
}

async fn watch(client: &LockClient, device_id: &str) -> Result<()> {
    let mut changes = client.store().subscribe();
    info!("Watching {}, Ctrl-C to stop", device_id);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            change = changes.recv() => match change {
                Ok(change) => println!(
                    "{} locked={} battery={}% online={} ({:?})",
                    change.device_id,
                    change.status.is_locked,
                    change.status.battery_level,
                    change.status.is_online,
                    change.source
                ),
                Err(RecvError::Lagged(missed)) => warn!("Missed {} status changes", missed),
                Err(RecvError::Closed) => {
                    error!("Status feed closed");
                    break;
                }
            }
        }
    }

    let entries = client
        .history()
        .query(&HistoryQuery::default().device(device_id));
    println!("{}", serde_json::to_string_pretty(&entries)?);
    Ok(())
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
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
