use clap::Parser;
use durasub::transport::WsTransport;
use durasub::types::DeliveredEvent;
use durasub::{ClientConfig, DurableClient, DurableError};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "durasub", about = "Durable subscription client", version)]
struct Args {
  /// Server endpoints (repeatable); replaces the configured list
  #[arg(short, long = "endpoint", env = "DURASUB_ENDPOINTS", value_delimiter = ',')]
  endpoints: Vec<String>,
  #[arg(long, env = "DURASUB_CLIENT_ID")]
  client_id: Option<String>,
  #[arg(long)]
  timeout: Option<u64>,
  #[arg(short, long)]
  redundancy: Option<u32>,
  #[arg(short, long)]
  config: Option<String>,
  #[arg(long)]
  log_level: Option<String>,
  /// Discard the durable queue on exit instead of keeping it
  #[arg(long)]
  no_keep_alive: bool,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
  let args = Args::parse();

  // Load config: explicit path > auto-detect > defaults
  let mut config = if let Some(path) = &args.config {
    ClientConfig::from_file(path)?
  } else {
    ClientConfig::find_and_load()?.unwrap_or_default()
  };

  // CLI args override config file
  if !args.endpoints.is_empty() {
    config.pool.endpoints = args.endpoints;
  }
  if let Some(id) = args.client_id {
    config.session.durable_client_id = Some(id);
  }
  if let Some(timeout) = args.timeout {
    config.session.durable_timeout_secs = timeout;
  }
  if let Some(redundancy) = args.redundancy {
    config.session.redundancy_level = redundancy;
  }
  if let Some(level) = args.log_level {
    config.logging.level = level;
  }
  if args.no_keep_alive {
    config.session.keep_alive_on_exit = false;
  }

  tracing_subscriber::registry()
    .with(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.clone().into()),
    )
    .with(tracing_subscriber::fmt::layer())
    .init();

  let transport = Arc::new(WsTransport::new(config.pool.request_timeout()));
  let client = DurableClient::from_config(&config, transport)?;
  client.add_listener(Arc::new(|event: &DeliveredEvent| {
    tracing::info!(
      region = %event.region,
      key = %event.key,
      operation = %event.operation,
      durable = event.durable,
      sequence = event.sequence,
      value = ?event.value,
      "Event"
    );
  }));

  for entry in config.interest_entries()? {
    match client
      .register_interest(entry.region.clone(), entry.pattern.clone(), entry.durable)
      .await
    {
      Ok(()) | Err(DurableError::NotConnected(_)) => {}
      Err(e) => return Err(e.into()),
    }
  }

  let outcome = client.connect().await?;
  tracing::info!(
    client_id = %client.session().durable_client_id(),
    primary = %outcome.primary,
    secondaries = outcome.secondaries.len(),
    mode = ?outcome.mode,
    "Connected"
  );
  if let Some(warning) = &outcome.degraded {
    tracing::warn!("{}", warning);
  }

  let mut status = client.subscribe_status();
  let watcher = tokio::spawn(async move {
    while status.changed().await.is_ok() {
      let current = status.borrow_and_update().clone();
      match &current.warning {
        Some(warning) => tracing::warn!(
          session = %current.session,
          failover = ?current.failover,
          "{}",
          warning
        ),
        None => tracing::info!(
          session = %current.session,
          failover = ?current.failover,
          secondaries = current.secondaries,
          "Status changed"
        ),
      }
    }
  });

  tokio::signal::ctrl_c().await?;
  tracing::info!("Received SIGINT");
  client.close(config.session.keep_alive_on_exit).await?;
  watcher.abort();
  Ok(())
}
