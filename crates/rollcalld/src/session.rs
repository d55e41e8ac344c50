//! Recognition session: the worker loop that turns frames into attendance.
//!
//! The worker thread owns the ledger outright. Everyone else sees immutable
//! snapshots published on a `watch` channel after each successful save.
//! Manual corrections reach a running worker over an mpsc channel, so the
//! ledger file has one writer at a time.

use crate::events::{EventBus, PresenceEvent};
use crate::pipeline::{AnnotatedFrame, FaceDetector, FaceEncoder, FaceLabel, FrameSink};
use chrono::NaiveDate;
use rollcall_core::{
    EncodingStore, Identity, Ledger, LedgerError, MatchOutcome, Matcher, PersistenceError,
};
use rollcall_hw::{AcquireError, Frame, FrameSource};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

/// Label shown for faces that match no enrolled identity.
pub const UNKNOWN_LABEL: &str = "Unknown";

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Persist(#[from] PersistenceError),
    #[error("failed to quarantine corrupt ledger {path}: {source}")]
    Quarantine {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("frame source: {0}")]
    Source(#[from] rollcall_hw::SourceError),
    #[error("detection trace: {0}")]
    Trace(#[from] crate::pipeline::TraceError),
    #[error("failed to spawn session worker: {0}")]
    Spawn(std::io::Error),
    #[error("session worker panicked")]
    WorkerPanicked,
}

/// Frame source plus the detection, encoding and display stages, opened
/// fresh for every session and dropped when it ends.
pub struct Pipeline {
    pub source: Box<dyn FrameSource>,
    pub detector: Box<dyn FaceDetector>,
    pub encoder: Box<dyn FaceEncoder>,
    pub sink: Box<dyn FrameSink>,
}

pub type PipelineFactory = Box<dyn Fn() -> Result<Pipeline, SessionError> + Send + Sync>;

/// Today's date as the session sees it.
pub type Clock = Arc<dyn Fn() -> NaiveDate + Send + Sync>;

/// Local calendar date.
pub fn local_clock() -> Clock {
    Arc::new(|| chrono::Local::now().date_naive())
}

/// Counters reported when a session ends.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionSummary {
    pub frames: u64,
    pub unavailable: u64,
    pub dark: u64,
    pub faces: u64,
    pub matched: u64,
    pub newly_marked: u64,
    pub manual_marks: u64,
    pub save_failures: u64,
    /// The ledger was fully persisted when the session ended.
    pub persisted: bool,
}

/// Result of a manual attendance mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MarkOutcome {
    /// The cell was not `Present` before.
    pub newly_marked: bool,
    /// The ledger file includes the mark.
    pub persisted: bool,
}

/// Manual mark handed to the running worker.
struct MarkRequest {
    identity: Identity,
    date: NaiveDate,
    reply: mpsc::Sender<MarkOutcome>,
}

/// Ledger location and matching parameters shared by every session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub ledger_path: PathBuf,
    pub tolerance: f32,
    pub retry_delay: Duration,
    pub rebuild_corrupt_ledger: bool,
}

/// Load the ledger, optionally quarantining a corrupt artifact and starting
/// empty. Without `rebuild_corrupt` a corrupt ledger is an error.
pub fn open_ledger(path: &Path, rebuild_corrupt: bool) -> Result<Ledger, SessionError> {
    match Ledger::load(path) {
        Err(LedgerError::Corrupt(e)) if rebuild_corrupt => {
            tracing::error!(path = %path.display(), error = %e, "ledger is corrupt, rebuilding as requested");
            rollcall_core::ledger::quarantine(path).map_err(|source| SessionError::Quarantine {
                path: path.to_path_buf(),
                source,
            })?;
            Ok(Ledger::new())
        }
        other => Ok(other?),
    }
}

/// Worker-side state. Lives on the session thread only.
struct Session {
    ledger: Ledger,
    ledger_path: PathBuf,
    store: Arc<EncodingStore>,
    matcher: Arc<dyn Matcher>,
    tolerance: f32,
    retry_delay: Duration,
    events: Arc<EventBus>,
    snapshots: watch::Sender<Arc<Ledger>>,
    marks: mpsc::Receiver<MarkRequest>,
    clock: Clock,
    /// In-memory marks not yet persisted.
    dirty: bool,
    summary: SessionSummary,
}

impl Session {
    fn run(mut self, pipeline: Pipeline, stop: &AtomicBool) -> SessionSummary {
        let Pipeline {
            mut source,
            mut detector,
            mut encoder,
            mut sink,
        } = pipeline;

        loop {
            self.apply_pending_marks();
            if stop.load(Ordering::Acquire) {
                break;
            }

            let frame = match source.acquire() {
                Ok(frame) => frame,
                Err(AcquireError::Unavailable(reason)) => {
                    self.summary.unavailable += 1;
                    tracing::debug!(%reason, "frame unavailable, skipping");
                    std::thread::sleep(self.retry_delay);
                    continue;
                }
                Err(AcquireError::Closed) => {
                    tracing::info!("frame source closed");
                    break;
                }
            };

            let annotated = self.process_frame(frame, detector.as_mut(), encoder.as_mut());
            sink.display(&annotated);
        }

        // Release the camera before the final checkpoint.
        drop(source);
        self.finish()
    }

    fn process_frame(
        &mut self,
        frame: Frame,
        detector: &mut dyn FaceDetector,
        encoder: &mut dyn FaceEncoder,
    ) -> AnnotatedFrame {
        self.summary.frames += 1;
        let mut labels = Vec::new();

        if frame.is_dark {
            self.summary.dark += 1;
            tracing::trace!(seq = frame.sequence, "dark frame, detection skipped");
            return AnnotatedFrame { frame, labels };
        }

        let regions = match detector.detect(&frame) {
            Ok(regions) => regions,
            Err(e) => {
                tracing::warn!(seq = frame.sequence, error = %e, "detection failed, frame skipped");
                return AnnotatedFrame { frame, labels };
            }
        };

        for region in regions {
            self.summary.faces += 1;
            let outcome = match encoder.encode(&frame, &region) {
                Ok(live) => self.matcher.compare(&live, &self.store, self.tolerance),
                Err(e) => {
                    tracing::warn!(seq = frame.sequence, error = %e, "encoding failed");
                    MatchOutcome::Unknown
                }
            };

            let label = match outcome {
                MatchOutcome::Known {
                    identity, distance, ..
                } => {
                    self.summary.matched += 1;
                    self.record(&identity, distance);
                    FaceLabel {
                        region,
                        text: identity.to_string(),
                        known: true,
                    }
                }
                MatchOutcome::Unknown => FaceLabel {
                    region,
                    text: UNKNOWN_LABEL.to_string(),
                    known: false,
                },
            };
            labels.push(label);
        }

        AnnotatedFrame { frame, labels }
    }

    /// Mark a recognised person present today. Only the first sighting of
    /// the day notifies observers and triggers a checkpoint.
    fn record(&mut self, identity: &Identity, distance: f32) {
        let today = (self.clock)();
        self.ledger.ensure_date_column(today);
        if !self.ledger.mark_present(identity, today) {
            return;
        }

        self.summary.newly_marked += 1;
        self.dirty = true;
        self.events.emit(&PresenceEvent {
            identity: identity.clone(),
            date: today,
            distance,
        });
        self.persist();
    }

    fn apply_pending_marks(&mut self) {
        while let Ok(request) = self.marks.try_recv() {
            let outcome = self.apply_mark(&request.identity, request.date);
            // The requester may have gone away.
            let _ = request.reply.send(outcome);
        }
    }

    fn apply_mark(&mut self, identity: &Identity, date: NaiveDate) -> MarkOutcome {
        if !self.ledger.mark_present(identity, date) {
            return MarkOutcome {
                newly_marked: false,
                persisted: !self.dirty,
            };
        }

        tracing::info!(%identity, %date, "manual attendance mark");
        self.summary.manual_marks += 1;
        self.dirty = true;
        MarkOutcome {
            newly_marked: true,
            persisted: self.persist(),
        }
    }

    fn persist(&mut self) -> bool {
        match self.ledger.save(&self.ledger_path) {
            Ok(()) => {
                self.dirty = false;
                self.snapshots.send_replace(Arc::new(self.ledger.clone()));
                true
            }
            Err(e) => {
                // The mark stays in memory; the next mark or shutdown retries.
                self.summary.save_failures += 1;
                tracing::warn!(error = %e, "failed to persist ledger");
                false
            }
        }
    }

    fn finish(mut self) -> SessionSummary {
        self.apply_pending_marks();
        self.summary.persisted = !self.dirty || self.persist();
        tracing::info!(
            frames = self.summary.frames,
            marked = self.summary.newly_marked,
            persisted = self.summary.persisted,
            "session finished"
        );
        self.summary
    }
}

/// A session worker that has been started.
struct RunningSession {
    stop: Arc<AtomicBool>,
    marks: mpsc::Sender<MarkRequest>,
    handle: JoinHandle<SessionSummary>,
}

impl RunningSession {
    /// Ask the worker to stop before its next frame acquisition.
    fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    fn join(self) -> Result<SessionSummary, SessionError> {
        self.handle.join().map_err(|_| SessionError::WorkerPanicked)
    }
}

/// Controller shared between the D-Bus service and the shutdown path.
pub type SharedController = Arc<Mutex<SessionController>>;

/// Lock the controller, ignoring poisoning.
pub fn lock(controller: &Mutex<SessionController>) -> MutexGuard<'_, SessionController> {
    controller.lock().unwrap_or_else(|e| e.into_inner())
}

/// Starts and stops session workers and serves ledger snapshots.
///
/// Every method that can touch the ledger file runs to completion under the
/// controller lock, so call them off the async executor.
pub struct SessionController {
    settings: SessionSettings,
    store: Arc<EncodingStore>,
    matcher: Arc<dyn Matcher>,
    events: Arc<EventBus>,
    factory: PipelineFactory,
    clock: Clock,
    snapshots: watch::Sender<Arc<Ledger>>,
    running: Option<RunningSession>,
    last_summary: Option<SessionSummary>,
}

impl SessionController {
    pub fn new(
        settings: SessionSettings,
        store: Arc<EncodingStore>,
        matcher: Arc<dyn Matcher>,
        events: Arc<EventBus>,
        factory: PipelineFactory,
        clock: Clock,
        initial: Ledger,
    ) -> Self {
        let (snapshots, _) = watch::channel(Arc::new(initial));
        Self {
            settings,
            store,
            matcher,
            events,
            factory,
            clock,
            snapshots,
            running: None,
            last_summary: None,
        }
    }

    /// Start a session worker. Returns `Ok(false)` if one is already running.
    ///
    /// The ledger is reloaded from disk and the pipeline opened before the
    /// worker is spawned, so a corrupt ledger or a missing camera fails here.
    pub fn start(&mut self) -> Result<bool, SessionError> {
        if self.is_running() {
            return Ok(false);
        }
        self.reap();

        let ledger = open_ledger(
            &self.settings.ledger_path,
            self.settings.rebuild_corrupt_ledger,
        )?;
        let pipeline = (self.factory)()?;
        self.snapshots.send_replace(Arc::new(ledger.clone()));
        let (marks, mark_queue) = mpsc::channel();

        let session = Session {
            ledger,
            ledger_path: self.settings.ledger_path.clone(),
            store: Arc::clone(&self.store),
            matcher: Arc::clone(&self.matcher),
            tolerance: self.settings.tolerance,
            retry_delay: self.settings.retry_delay,
            events: Arc::clone(&self.events),
            snapshots: self.snapshots.clone(),
            marks: mark_queue,
            clock: Arc::clone(&self.clock),
            dirty: false,
            summary: SessionSummary::default(),
        };

        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("rollcall-session".into())
            .spawn(move || {
                tracing::info!("session worker started");
                let summary = session.run(pipeline, &worker_stop);
                tracing::info!("session worker exiting");
                summary
            })
            .map_err(SessionError::Spawn)?;

        self.running = Some(RunningSession {
            stop,
            marks,
            handle,
        });
        Ok(true)
    }

    /// Stop the running worker and wait for its final checkpoint.
    /// Returns `Ok(None)` if no session was running.
    pub fn stop(&mut self) -> Result<Option<SessionSummary>, SessionError> {
        let Some(running) = self.running.take() else {
            return Ok(None);
        };
        running.request_stop();
        let summary = running.join()?;
        self.last_summary = Some(summary.clone());
        Ok(Some(summary))
    }

    /// Mark `identity` present on `date` outside recognition.
    ///
    /// A running worker applies the mark itself and saves. Otherwise the
    /// ledger file is edited directly.
    pub fn mark(&mut self, identity: &Identity, date: NaiveDate) -> Result<MarkOutcome, SessionError> {
        if let Some(running) = &self.running {
            let (reply, outcome) = mpsc::channel();
            let request = MarkRequest {
                identity: identity.clone(),
                date,
                reply,
            };
            if running.marks.send(request).is_ok() {
                if let Ok(outcome) = outcome.recv() {
                    return Ok(outcome);
                }
            }
            // The worker exited without taking the mark. Let its final save land first.
            self.join_running();
        }

        let path = &self.settings.ledger_path;
        let mut ledger = Ledger::load(path)?;
        let newly_marked = ledger.mark_present(identity, date);
        if newly_marked {
            ledger.save(path)?;
            tracing::info!(%identity, %date, "manual attendance mark");
        }
        self.snapshots.send_replace(Arc::new(ledger));
        Ok(MarkOutcome {
            newly_marked,
            persisted: true,
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.as_ref().is_some_and(|r| !r.is_finished())
    }

    /// Record the summary of a session that finished by itself.
    pub fn reap(&mut self) {
        if self.running.as_ref().is_some_and(RunningSession::is_finished) {
            self.join_running();
        }
    }

    fn join_running(&mut self) {
        if let Some(running) = self.running.take() {
            match running.join() {
                Ok(summary) => self.last_summary = Some(summary),
                Err(e) => tracing::error!(error = %e, "session ended abnormally"),
            }
        }
    }

    pub fn last_summary(&self) -> Option<&SessionSummary> {
        self.last_summary.as_ref()
    }

    /// Today's date as sessions see it.
    pub fn today(&self) -> NaiveDate {
        (self.clock)()
    }

    /// Latest persisted ledger state.
    pub fn snapshot(&self) -> Arc<Ledger> {
        Arc::clone(&self.snapshots.borrow())
    }
}
