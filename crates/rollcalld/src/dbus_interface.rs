use crate::events::RecentObserver;
use crate::session::{self, SessionController, SharedController};
use chrono::NaiveDate;
use rollcall_core::ledger::DATE_FORMAT;
use rollcall_core::Identity;
use std::sync::Arc;
use zbus::interface;

pub const BUS_NAME: &str = "org.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

/// D-Bus interface of the attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
pub struct AttendanceService {
    controller: SharedController,
    recent: Arc<RecentObserver>,
}

impl AttendanceService {
    pub fn new(controller: SharedController, recent: Arc<RecentObserver>) -> Self {
        Self { controller, recent }
    }

    /// Run `f` on the locked controller on the blocking pool. Starting reads
    /// the ledger and opens the pipeline; stopping and marking wait on the worker.
    async fn with_controller<T, F>(&self, f: F) -> zbus::fdo::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut SessionController) -> T + Send + 'static,
    {
        let controller = Arc::clone(&self.controller);
        tokio::task::spawn_blocking(move || f(&mut session::lock(&controller)))
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }
}

fn failed(e: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Start a recognition session. Returns false if one is already running.
    async fn start(&self) -> zbus::fdo::Result<bool> {
        match self.with_controller(|c| c.start()).await? {
            Ok(started) => {
                tracing::info!(started, "start requested");
                Ok(started)
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to start session");
                Err(failed(e))
            }
        }
    }

    /// Stop the running session and return its summary as JSON (`null` if idle).
    /// Returns once the worker has made its final save.
    async fn stop(&self) -> zbus::fdo::Result<String> {
        tracing::info!("stop requested");
        let summary = self.with_controller(|c| c.stop()).await?.map_err(failed)?;
        serde_json::to_string(&summary).map_err(failed)
    }

    /// Mark a person present. An empty `date` means today.
    /// Returns the outcome as JSON.
    async fn mark(&self, identity: String, date: String) -> zbus::fdo::Result<String> {
        let identity =
            Identity::new(identity).map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;
        let date = if date.is_empty() {
            None
        } else {
            let parsed = NaiveDate::parse_from_str(&date, DATE_FORMAT).map_err(|e| {
                zbus::fdo::Error::InvalidArgs(format!("date {date:?}: {e}"))
            })?;
            Some(parsed)
        };

        let outcome = self
            .with_controller(move |c| {
                let date = date.unwrap_or_else(|| c.today());
                c.mark(&identity, date)
            })
            .await?
            .map_err(failed)?;
        serde_json::to_string(&outcome).map_err(failed)
    }

    /// Daemon status as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        self.with_controller(|controller| {
            controller.reap();
            let snapshot = controller.snapshot();
            let dates: Vec<String> = snapshot.header().into_iter().skip(1).collect();

            serde_json::json!({
                "version": env!("CARGO_PKG_VERSION"),
                "running": controller.is_running(),
                "people": snapshot.len(),
                "dates": dates,
                "last_session": controller.last_summary(),
            })
            .to_string()
        })
        .await
    }

    /// Latest persisted attendance ledger, as CSV.
    async fn attendance(&self) -> zbus::fdo::Result<String> {
        let snapshot = self.with_controller(|c| c.snapshot()).await?;
        snapshot.to_csv_string().map_err(failed)
    }

    /// Most recent presence confirmations as a JSON array, oldest first.
    async fn recent_confirmations(&self) -> zbus::fdo::Result<String> {
        serde_json::to_string(&self.recent.recent()).map_err(failed)
    }
}
