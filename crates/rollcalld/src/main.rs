use anyhow::{Context, Result};
use rollcall_core::{EncodingStore, Matcher};
use rollcall_hw::ImageDirSource;
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod events;
mod pipeline;
mod session;

use config::Config;
use events::{EventBus, LogObserver, RecentObserver};
use pipeline::{FrameSink, LogSink, PreviewSink, ReplayTrace};
use session::{Pipeline, PipelineFactory, SessionController, SessionError, SessionSettings};

/// Confirmations kept for `RecentConfirmations`.
const RECENT_CAPACITY: usize = 32;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");
    let config = Config::from_env();

    let store = EncodingStore::load(&config.encodings_path)
        .context("cannot start without enrolled encodings")?;

    let matcher: Arc<dyn Matcher> = rollcall_core::matcher::matcher_for_policy(&config.match_policy)
        .map(Arc::from)
        .with_context(|| {
            format!(
                "unknown ROLLCALL_MATCH_POLICY {:?} (expected \"first\" or \"nearest\")",
                config.match_policy
            )
        })?;
    tracing::info!(
        policy = %config.match_policy,
        tolerance = config.tolerance,
        "matcher configured"
    );

    let ledger = session::open_ledger(&config.ledger_path, config.rebuild_corrupt_ledger)
        .with_context(|| {
            format!(
                "cannot use ledger {}; repair it or set ROLLCALL_REBUILD_CORRUPT_LEDGER=1",
                config.ledger_path.display()
            )
        })?;
    tracing::info!(
        path = %config.ledger_path.display(),
        people = ledger.len(),
        dates = ledger.dates().len(),
        "ledger opened"
    );

    let events = Arc::new(EventBus::new());
    let recent = Arc::new(RecentObserver::new(RECENT_CAPACITY));
    events.subscribe(Arc::new(LogObserver));
    events.subscribe(recent.clone());

    let controller = Arc::new(Mutex::new(SessionController::new(
        SessionSettings {
            ledger_path: config.ledger_path.clone(),
            tolerance: config.tolerance,
            retry_delay: config.retry_delay,
            rebuild_corrupt_ledger: config.rebuild_corrupt_ledger,
        },
        Arc::new(store),
        matcher,
        events,
        replay_pipeline(&config),
        session::local_clock(),
        ledger,
    )));

    let service = dbus_interface::AttendanceService::new(Arc::clone(&controller), recent);
    let builder = if config.system_bus {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let _connection = builder
        .name(dbus_interface::BUS_NAME)?
        .serve_at(dbus_interface::OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    if config.autostart {
        session::lock(&controller)
            .start()
            .context("failed to start recognition session")?;
    }

    tracing::info!(bus = dbus_interface::BUS_NAME, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    let stopped = tokio::task::spawn_blocking(move || session::lock(&controller).stop()).await??;
    if let Some(summary) = stopped {
        tracing::info!(
            marked = summary.newly_marked,
            persisted = summary.persisted,
            "final session stopped"
        );
    }

    Ok(())
}

/// Pipeline replaying a frame directory with its detection trace.
fn replay_pipeline(config: &Config) -> PipelineFactory {
    let frame_dir = config.frame_dir.clone();
    let trace_path = config.trace_path.clone();
    let interval = config.frame_interval;
    let preview = config.preview_path.clone();

    Box::new(move || -> Result<Pipeline, SessionError> {
        let source = ImageDirSource::open(&frame_dir, interval)?;
        let trace = ReplayTrace::load(&trace_path)?;
        let sink: Box<dyn FrameSink> = match &preview {
            Some(path) => Box::new(PreviewSink::new(path.clone())),
            None => Box::new(LogSink),
        };
        Ok(Pipeline {
            source: Box::new(source),
            detector: Box::new(trace.clone()),
            encoder: Box::new(trace),
            sink,
        })
    })
}
