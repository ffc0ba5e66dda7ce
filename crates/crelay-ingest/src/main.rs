//! Ingest binary for the `cRelay` activity indexer.
//!
//! Reads activity events as newline-delimited JSON from standard input and
//! saves each one through the [`EventAdapter`], which stores the raw event
//! and updates the causality and user statistics indexes.
//!
//! # Startup Sequence
//!
//! 1. Load configuration from `crelay-config.yaml` (or the path given as
//!    the first argument)
//! 2. Initialize structured logging (tracing)
//! 3. Open the configured document store
//! 4. Ingest events until end of input or Ctrl-C
//! 5. Close the store and log a summary

mod error;

use std::path::Path;

use crelay_core::{EventAdapter, RelayConfig, RelayError};
use crelay_core::config::LoggingConfig;
use crelay_types::ActivityEvent;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::error::IngestError;

/// Default configuration file, relative to the working directory.
const DEFAULT_CONFIG_PATH: &str = "crelay-config.yaml";

/// Counters reported when ingestion ends.
#[derive(Debug, Default)]
struct IngestSummary {
    saved: u64,
    redelivered: u64,
    rejected: u64,
    incomplete: u64,
}

/// Application entry point for the ingest binary.
///
/// # Errors
///
/// Returns an error if configuration, the store, or standard input fails.
#[tokio::main]
async fn main() -> Result<(), IngestError> {
    let config = load_config()?;
    init_logging(&config.logging);
    info!(
        backend = ?config.store.backend,
        namespace = %config.store.namespace,
        suffix_fallback = config.protocol.suffix_fallback,
        "crelay-ingest starting"
    );

    let store = config.store.open().await?;
    let adapter = EventAdapter::new(store, &config);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping ingestion");
            on_signal.cancel();
        }
    });

    let result = ingest(&adapter, &cancel).await;
    adapter.close().await?;
    let summary = result?;

    info!(
        saved = summary.saved,
        redelivered = summary.redelivered,
        rejected = summary.rejected,
        incomplete = summary.incomplete,
        "crelay-ingest finished"
    );
    Ok(())
}

/// Save every event read from standard input.
///
/// Malformed lines and events are logged and skipped. A store failure
/// stops ingestion.
async fn ingest(
    adapter: &EventAdapter,
    cancel: &CancellationToken,
) -> Result<IngestSummary, IngestError> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut summary = IngestSummary::default();
    let mut line_no: u64 = 0;

    loop {
        let line = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            break;
        };
        line_no = line_no.saturating_add(1);
        if line.trim().is_empty() {
            continue;
        }

        let event: ActivityEvent = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(line = line_no, error = %e, "Skipping malformed event");
                summary.rejected = summary.rejected.saturating_add(1);
                continue;
            }
        };

        match adapter.save(&event, cancel).await {
            Ok(outcome) => {
                summary.saved = summary.saved.saturating_add(1);
                if outcome.redelivered {
                    summary.redelivered = summary.redelivered.saturating_add(1);
                }
                if !outcome.is_complete() {
                    summary.incomplete = summary.incomplete.saturating_add(1);
                }
            }
            Err(RelayError::Format { source }) => {
                tracing::warn!(line = line_no, error = %source, "Rejected event");
                summary.rejected = summary.rejected.saturating_add(1);
            }
            Err(RelayError::Cancelled) => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(summary)
}

/// Load configuration from the path given as the first argument, or from
/// `crelay-config.yaml`. Falls back to defaults (plus environment
/// overrides) if the file does not exist.
fn load_config() -> Result<RelayConfig, IngestError> {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_owned());
    let path = Path::new(&path);
    if path.exists() {
        Ok(RelayConfig::from_file(path)?)
    } else {
        Ok(RelayConfig::parse("")?)
    }
}

/// Install the tracing subscriber. `RUST_LOG` overrides the configured
/// level.
fn init_logging(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}
