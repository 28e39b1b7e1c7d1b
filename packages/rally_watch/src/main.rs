mod config;
mod phoenix;
mod ws_transport;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result, bail};
use clap::Parser;
use rally_realtime::{
    ConnectionError, Coordinator, LifecycleBinder, TeardownReason, Topic, listener,
};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use crate::config::{WatchConfig, load_config};
use crate::ws_transport::WsTransport;

#[derive(Parser)]
#[command(name = "rally-watch")]
#[command(about = "Stream live row changes from the Rally realtime service as JSON lines")]
struct Cli {
    /// Directory holding rally.toml
    #[arg(long, default_value = ".")]
    config_dir: PathBuf,

    /// Topic key to watch, e.g. `messages:conversation_id=42` (repeatable)
    #[arg(short, long = "topic")]
    topics: Vec<String>,

    /// Watch a table instead of a raw key
    #[arg(long)]
    table: Option<String>,

    /// Schema for --table
    #[arg(long, requires = "table")]
    schema: Option<String>,

    /// Equality filter for --table as column=value (repeatable)
    #[arg(long = "filter", requires = "table", value_parser = parse_filter)]
    filters: Vec<(String, String)>,

    /// Exit after this many events have been printed
    #[arg(long)]
    exit_after: Option<usize>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn parse_filter(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((column, value)) if !column.is_empty() => Ok((column.to_string(), value.to_string())),
        _ => Err(format!("expected column=value, got {raw:?}")),
    }
}

impl Cli {
    fn watched_topics(&self) -> Result<Vec<Topic>> {
        let mut topics = self
            .topics
            .iter()
            .map(|key| Topic::new(key).with_context(|| format!("invalid topic {key:?}")))
            .collect::<Result<Vec<_>>>()?;

        if let Some(table) = &self.table {
            let mut builder = Topic::builder(table);
            if let Some(schema) = &self.schema {
                builder = builder.schema(schema);
            }
            for (column, value) in &self.filters {
                builder = builder.filter(column, value);
            }
            topics.push(builder.build().context("invalid --table subscription")?);
        }

        if topics.is_empty() {
            bail!("nothing to watch: pass --topic or --table");
        }
        Ok(topics)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let default_directive = if args.debug {
        "rally_watch=debug,rally_realtime=debug,info"
    } else {
        "info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let config: WatchConfig = load_config(&args.config_dir)
        .extract()
        .context("failed to load configuration")?;
    let topics = args.watched_topics()?;

    let transport = WsTransport::connect(&config.endpoint)
        .await
        .with_context(|| format!("failed to connect to {}", config.endpoint.url))?;
    let coordinator = Coordinator::new(transport, config.realtime.clone());
    let binder = LifecycleBinder::new(coordinator);

    let stop = CancellationToken::new();
    let on_signal = stop.clone();
    binder.install_teardown(async move {
        let _ = tokio::signal::ctrl_c().await;
        on_signal.cancel();
        TeardownReason::Shutdown
    })?;

    let mut errors = binder.coordinator().connection_errors();
    let printed = Arc::new(AtomicUsize::new(0));
    let mut units = Vec::with_capacity(topics.len());
    for topic in topics {
        let printed = printed.clone();
        let stop = stop.clone();
        let limit = args.exit_after;
        let print = listener(move |event| {
            println!("{}", serde_json::to_string(event)?);
            let seen = printed.fetch_add(1, Ordering::Relaxed) + 1;
            if limit.is_some_and(|limit| seen >= limit) {
                stop.cancel();
            }
            Ok(())
        });

        let mut unit = binder.unit();
        match unit.activate(topic.clone(), print).await {
            Ok(()) => info!(topic = %topic, "Watching"),
            Err(e) if e.is_retryable() => {
                warn!(topic = %topic, code = e.error_code(), "Could not subscribe: {}", e)
            }
            Err(e) => return Err(e.into()),
        }
        units.push(unit);
    }

    if binder.coordinator().active_topic_count() == 0 {
        binder.remove_teardown();
        bail!("no subscription could be established");
    }

    let lost = tokio::select! {
        _ = stop.cancelled() => None,
        err = next_connection_error(&mut errors) => Some(err),
    };
    if binder.teardown_pending() {
        binder.teardown_now(TeardownReason::Shutdown);
    }

    for mut unit in units {
        unit.deactivate();
    }
    binder.remove_teardown();

    info!(
        events = printed.load(Ordering::Relaxed),
        "rally-watch exiting"
    );
    match lost {
        Some(err) => Err(anyhow::Error::new(err).context("realtime channel lost")),
        None => Ok(()),
    }
}

/// Wait for the next connection error the coordinator reports outside a
/// subscribe call.
async fn next_connection_error(
    errors: &mut broadcast::Receiver<ConnectionError>,
) -> ConnectionError {
    loop {
        match errors.recv().await {
            Ok(err) => return err,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Missed connection errors");
            }
            Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}
