use rollcall_core::pipeline::{DisplaySink, PipelineState, STATUS_READY};
use rollcall_core::{
    AttendanceLedger, FaceExtractor, Frame, NearestMatcher, Pipeline, PipelineError, Registry,
    SourceOpener,
};
use serde::Serialize;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::sync::oneshot;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("no frame captured yet; start a session first")]
    NoFrame,
    #[error("failed to write snapshot: {0}")]
    Snapshot(#[from] image::ImageError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Snapshot of engine state, serialized as JSON for `Status`.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub version: &'static str,
    pub state: &'static str,
    pub status: String,
    pub known_faces: usize,
    pub logged_this_session: usize,
    pub logs_dir: PathBuf,
    pub last_frame: Option<u32>,
}

/// Latest frame, status line and recent attendance lines, as a viewer would show them.
pub struct ViewState {
    frame: Option<Frame>,
    status: String,
    log: VecDeque<String>,
    capacity: usize,
}

impl ViewState {
    pub fn new(capacity: usize) -> Self {
        Self {
            frame: None,
            status: STATUS_READY.to_string(),
            log: VecDeque::new(),
            capacity,
        }
    }

    pub fn frame(&self) -> Option<&Frame> {
        self.frame.as_ref()
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    /// Recent attendance lines, oldest first.
    pub fn log(&self) -> Vec<String> {
        self.log.iter().cloned().collect()
    }
}

impl DisplaySink for ViewState {
    fn show_frame(&mut self, frame: Option<&Frame>) {
        self.frame = frame.cloned();
    }

    fn set_status(&mut self, status: &str) {
        self.status = status.to_string();
    }

    fn append_log(&mut self, line: &str) {
        if self.capacity == 0 {
            return;
        }
        while self.log.len() >= self.capacity {
            self.log.pop_front();
        }
        self.log.push_back(line.to_string());
    }

    fn clear_log(&mut self) {
        self.log.clear();
    }
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Start {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Clear {
        reply: oneshot::Sender<()>,
    },
    Status {
        reply: oneshot::Sender<EngineStatus>,
    },
    RecentLog {
        reply: oneshot::Sender<Vec<String>>,
    },
    Snapshot {
        path: PathBuf,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
}

/// Clone-safe handle to the engine thread. The thread exits once every
/// handle is dropped.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Begin an attendance session.
    pub async fn start(&self) -> Result<(), EngineError> {
        self.request(|reply| EngineRequest::Start { reply }).await?
    }

    /// End the session and release the camera.
    pub async fn stop(&self) -> Result<(), EngineError> {
        self.request(|reply| EngineRequest::Stop { reply }).await
    }

    /// Forget who was seen this session.
    pub async fn clear(&self) -> Result<(), EngineError> {
        self.request(|reply| EngineRequest::Clear { reply }).await
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        self.request(|reply| EngineRequest::Status { reply }).await
    }

    pub async fn recent_log(&self) -> Result<Vec<String>, EngineError> {
        self.request(|reply| EngineRequest::RecentLog { reply }).await
    }

    /// Write the latest annotated frame to `path` as PNG.
    pub async fn snapshot(&self, path: PathBuf) -> Result<(), EngineError> {
        self.request(|reply| EngineRequest::Snapshot { path, reply }).await?
    }
}

/// Everything the engine thread takes ownership of.
pub struct EngineParts<E, O> {
    pub extractor: E,
    pub registry: Registry,
    pub matcher: NearestMatcher,
    pub ledger: AttendanceLedger,
    pub opener: O,
    pub tick_interval: Duration,
    pub recent_log_capacity: usize,
}

struct Engine<E, O: SourceOpener> {
    pipeline: Pipeline<E, O>,
    view: ViewState,
    tick_interval: Duration,
}

/// Spawn the engine on a dedicated OS thread.
///
/// The pipeline is built on the engine thread, so the frame source it
/// opens never crosses threads.
pub fn spawn_engine<E, O>(parts: EngineParts<E, O>) -> Result<EngineHandle, EngineError>
where
    E: FaceExtractor + Send + 'static,
    O: SourceOpener + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<EngineRequest>(8);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            let engine = Engine {
                pipeline: Pipeline::new(
                    parts.extractor,
                    parts.registry,
                    parts.matcher,
                    parts.ledger,
                    parts.opener,
                ),
                view: ViewState::new(parts.recent_log_capacity),
                tick_interval: parts.tick_interval,
            };
            engine.run(rx);
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

impl<E: FaceExtractor, O: SourceOpener> Engine<E, O> {
    fn run(mut self, mut rx: mpsc::Receiver<EngineRequest>) {
        tracing::info!(known_faces = self.pipeline.registry().len(), "engine thread started");

        loop {
            if self.pipeline.state() != PipelineState::Running {
                match rx.blocking_recv() {
                    Some(req) => self.handle(req),
                    None => break,
                }
                continue;
            }

            let started = Instant::now();
            let mut closed = false;
            loop {
                match rx.try_recv() {
                    Ok(req) => self.handle(req),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        closed = true;
                        break;
                    }
                }
            }
            if closed {
                break;
            }

            let report = self
                .pipeline
                .tick(chrono::Local::now().naive_local(), &mut self.view);
            if report.write_failures > 0 {
                tracing::warn!(
                    failures = report.write_failures,
                    "attendance writes failed this tick"
                );
            }

            // A slow tick delays the next one; nothing queues up.
            if let Some(rest) = self.tick_interval.checked_sub(started.elapsed()) {
                std::thread::sleep(rest);
            }
        }

        self.pipeline.stop(&mut self.view);
        tracing::info!("engine thread exiting");
    }

    fn handle(&mut self, req: EngineRequest) {
        match req {
            EngineRequest::Start { reply } => {
                let result = self.pipeline.start(&mut self.view).map_err(EngineError::from);
                let _ = reply.send(result);
            }
            EngineRequest::Stop { reply } => {
                self.pipeline.stop(&mut self.view);
                let _ = reply.send(());
            }
            EngineRequest::Clear { reply } => {
                self.pipeline.clear(&mut self.view);
                let _ = reply.send(());
            }
            EngineRequest::Status { reply } => {
                let _ = reply.send(self.status());
            }
            EngineRequest::RecentLog { reply } => {
                let _ = reply.send(self.view.log());
            }
            EngineRequest::Snapshot { path, reply } => {
                let _ = reply.send(self.snapshot(&path));
            }
        }
    }

    fn status(&self) -> EngineStatus {
        EngineStatus {
            version: env!("CARGO_PKG_VERSION"),
            state: match self.pipeline.state() {
                PipelineState::Idle => "idle",
                PipelineState::Running => "running",
                PipelineState::Stopping => "stopping",
            },
            status: self.view.status().to_string(),
            known_faces: self.pipeline.registry().len(),
            logged_this_session: self.pipeline.ledger().session_len(),
            logs_dir: self.pipeline.ledger().dir().to_path_buf(),
            last_frame: self.view.frame().map(|f| f.sequence),
        }
    }

    fn snapshot(&self, path: &std::path::Path) -> Result<(), EngineError> {
        let image = self
            .view
            .frame()
            .and_then(Frame::to_image)
            .ok_or(EngineError::NoFrame)?;
        image.save_with_format(path, image::ImageFormat::Png)?;
        tracing::info!(path = %path.display(), "snapshot written");
        Ok(())
    }
}
