//! Frame sampler and Start/Stop/Clear state machine.
//!
//! Every tick pulls one frame. Only every other tick runs extraction and
//! matching; the tick in between re-draws the faces held from the last
//! processing tick. New matches go to the attendance ledger.

use crate::annotate;
use crate::extractor::FaceExtractor;
use crate::ledger::{AttendanceLedger, AttendanceRecord, RecordOutcome};
use crate::matcher::NearestMatcher;
use crate::registry::Registry;
use crate::types::{FaceMatch, Frame, Identity};
use chrono::NaiveDateTime;
use std::error::Error as StdError;
use thiserror::Error;

pub const STATUS_READY: &str = "Ready";
pub const STATUS_RUNNING: &str = "Running";
pub const STATUS_STOPPED: &str = "Stopped";
pub const STATUS_CLEARED: &str = "Session cleared";

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("could not open frame source: {0}")]
    Open(Box<dyn StdError + Send + Sync>),
    #[error("frame read failed: {0}")]
    Read(Box<dyn StdError + Send + Sync>),
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("no known faces loaded; add face images to the known faces directory")]
    EmptyRegistry,
    #[error(transparent)]
    Source(#[from] SourceError),
}

/// Producer of sequential color frames. Dropping it releases the device.
pub trait FrameSource {
    fn read_frame(&mut self) -> Result<Frame, SourceError>;
}

/// Opens a fresh [`FrameSource`] for each session.
pub trait SourceOpener {
    type Source: FrameSource;

    fn open(&mut self) -> Result<Self::Source, SourceError>;
}

/// Consumer of annotated frames, status text and attendance lines.
pub trait DisplaySink {
    /// The latest annotated frame, or `None` once stopped.
    fn show_frame(&mut self, frame: Option<&Frame>);
    fn set_status(&mut self, status: &str);
    /// One "label - date time" line per new attendance record.
    fn append_log(&mut self, line: &str);
    fn clear_log(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running,
    Stopping,
}

/// Recognition state carried from one tick to the next.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplerState {
    /// Whether the next frame gets extraction and matching.
    pub process_next: bool,
    /// Faces from the most recent processing tick.
    pub held: Vec<FaceMatch>,
}

impl Default for SamplerState {
    fn default() -> Self {
        Self {
            process_next: true,
            held: Vec::new(),
        }
    }
}

impl SamplerState {
    /// Consume one frame and return the next state and whether this frame was processed.
    ///
    /// An extraction error counts as a frame with no faces.
    pub fn advance<E: FaceExtractor + ?Sized>(
        self,
        frame: &Frame,
        extractor: &mut E,
        registry: &Registry,
        matcher: &NearestMatcher,
    ) -> (Self, bool) {
        if !self.process_next {
            return (
                Self {
                    process_next: true,
                    held: self.held,
                },
                false,
            );
        }

        let detections = extractor.detect_and_encode(frame).unwrap_or_else(|e| {
            tracing::warn!(
                error = %e,
                seq = frame.sequence,
                "extraction failed; treating as no faces"
            );
            Vec::new()
        });

        let held = detections
            .into_iter()
            .map(|d| FaceMatch {
                result: matcher.compare(&d.signature, registry, &*extractor),
                region: d.region,
            })
            .collect();

        (
            Self {
                process_next: false,
                held,
            },
            true,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The pipeline is not running.
    Idle,
    /// The source had no frame; nothing changed.
    NoFrame,
    /// Extraction and matching ran on this frame.
    Processed,
    /// The held faces were re-drawn on this frame.
    Reused,
}

/// What one tick did.
#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub outcome: TickOutcome,
    /// Faces drawn on this tick's frame.
    pub faces: Vec<FaceMatch>,
    /// Records written to the ledger on this tick.
    pub logged: Vec<AttendanceRecord>,
    /// Ledger writes that failed on this tick.
    pub write_failures: usize,
}

impl TickReport {
    fn empty(outcome: TickOutcome) -> Self {
        Self {
            outcome,
            faces: Vec::new(),
            logged: Vec::new(),
            write_failures: 0,
        }
    }
}

pub struct Pipeline<E, O: SourceOpener> {
    state: PipelineState,
    extractor: E,
    registry: Registry,
    matcher: NearestMatcher,
    ledger: AttendanceLedger,
    opener: O,
    source: Option<O::Source>,
    sampler: SamplerState,
}

impl<E: FaceExtractor, O: SourceOpener> Pipeline<E, O> {
    pub fn new(
        extractor: E,
        registry: Registry,
        matcher: NearestMatcher,
        ledger: AttendanceLedger,
        opener: O,
    ) -> Self {
        Self {
            state: PipelineState::Idle,
            extractor,
            registry,
            matcher,
            ledger,
            opener,
            source: None,
            sampler: SamplerState::default(),
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn ledger(&self) -> &AttendanceLedger {
        &self.ledger
    }

    pub fn sampler(&self) -> &SamplerState {
        &self.sampler
    }

    /// Begin a session. A no-op when already running.
    ///
    /// Refuses to start with an empty registry or when the source cannot
    /// be opened; either way the pipeline stays idle.
    pub fn start<D: DisplaySink + ?Sized>(&mut self, display: &mut D) -> Result<(), PipelineError> {
        if self.state != PipelineState::Idle {
            return Ok(());
        }

        if self.registry.is_empty() {
            let err = PipelineError::EmptyRegistry;
            display.set_status(&format!("Error: {err}"));
            return Err(err);
        }

        let source = self.opener.open().map_err(|e| {
            tracing::error!(error = %e, "frame source unavailable");
            display.set_status(&format!("Error: {e}"));
            PipelineError::Source(e)
        })?;

        self.source = Some(source);
        self.ledger.clear_session();
        self.sampler = SamplerState::default();
        self.state = PipelineState::Running;
        display.set_status(STATUS_RUNNING);
        tracing::info!(known_faces = self.registry.len(), "attendance session started");
        Ok(())
    }

    /// End the session and release the source. The session set and log files are kept.
    pub fn stop<D: DisplaySink + ?Sized>(&mut self, display: &mut D) {
        if self.state != PipelineState::Running {
            return;
        }
        self.state = PipelineState::Stopping;
        self.source = None;
        self.sampler = SamplerState::default();
        display.show_frame(None);
        display.set_status(STATUS_STOPPED);
        self.state = PipelineState::Idle;
        tracing::info!(logged = self.ledger.session_len(), "attendance session stopped");
    }

    /// Forget who was seen this session and empty the recent-log view.
    pub fn clear<D: DisplaySink + ?Sized>(&mut self, display: &mut D) {
        self.ledger.clear_session();
        display.clear_log();
        display.set_status(STATUS_CLEARED);
        tracing::debug!("session cleared");
    }

    /// Run one sampling cycle at wall-clock time `now`.
    pub fn tick<D: DisplaySink + ?Sized>(
        &mut self,
        now: NaiveDateTime,
        display: &mut D,
    ) -> TickReport {
        if self.state != PipelineState::Running {
            return TickReport::empty(TickOutcome::Idle);
        }
        let Some(source) = self.source.as_mut() else {
            return TickReport::empty(TickOutcome::Idle);
        };

        let mut frame = match source.read_frame() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(error = %e, "no frame this tick");
                return TickReport::empty(TickOutcome::NoFrame);
            }
        };

        let sampler = std::mem::take(&mut self.sampler);
        let (sampler, processed) =
            sampler.advance(&frame, &mut self.extractor, &self.registry, &self.matcher);
        self.sampler = sampler;

        let mut report = TickReport::empty(if processed {
            TickOutcome::Processed
        } else {
            TickOutcome::Reused
        });

        if processed {
            for face in &self.sampler.held {
                let Identity::Known(label) = &face.result.identity else {
                    continue;
                };
                match self.ledger.record(label, now) {
                    Ok(RecordOutcome::Logged(record)) => {
                        display.append_log(&record.to_string());
                        display.set_status(&format!("Attendance logged: {}", record.label));
                        report.logged.push(record);
                    }
                    Ok(RecordOutcome::Duplicate) => {}
                    Err(e) => {
                        tracing::error!(label = %label, error = %e, "attendance write failed");
                        display.set_status(&format!("Error: {e}"));
                        report.write_failures += 1;
                    }
                }
            }
        }

        annotate::annotate(&mut frame, &self.sampler.held);
        display.show_frame(Some(&frame));
        report.faces = self.sampler.held.clone();
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryEntry;
    use crate::testing::{FakeExtractor, RecordingDisplay, ScriptedOpener};
    use crate::types::Signature;
    use chrono::NaiveDate;

    const ALICE: [u8; 3] = [200, 0, 0];
    const BOB: [u8; 3] = [0, 200, 0];
    const STRANGER: [u8; 3] = [0, 0, 200];
    const EMPTY: [u8; 3] = [40, 40, 40];

    struct Rig {
        pipeline: Pipeline<FakeExtractor, ScriptedOpener>,
        opener: ScriptedOpener,
        display: RecordingDisplay,
        _dir: tempfile::TempDir,
    }

    fn now(secs: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 5)
            .unwrap()
            .and_hms_opt(9, 0, secs)
            .unwrap()
    }

    /// Registry {alice: [0, 0], bob: [5, 5]}, threshold 0.6. Frames colored
    /// ALICE frames carry a face 0.3 from alice, STRANGER one 0.9 from everyone.
    fn rig() -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::from_entries(vec![
            RegistryEntry {
                label: "alice".into(),
                signature: Signature::new(vec![0.0, 0.0]),
            },
            RegistryEntry {
                label: "bob".into(),
                signature: Signature::new(vec![5.0, 5.0]),
            },
        ])
        .unwrap();

        let mut extractor = FakeExtractor::default();
        extractor.face_for_color(ALICE, Signature::new(vec![0.3, 0.0]));
        extractor.face_for_color(BOB, Signature::new(vec![5.0, 5.1]));
        extractor.face_for_color(STRANGER, Signature::new(vec![0.0, -0.9]));

        let opener = ScriptedOpener::default();
        let pipeline = Pipeline::new(
            extractor,
            registry,
            NearestMatcher::new(0.6),
            AttendanceLedger::new(dir.path()),
            opener.clone(),
        );
        Rig { pipeline, opener, display: RecordingDisplay::default(), _dir: dir }
    }

    fn frame(rgb: [u8; 3]) -> Frame {
        Frame::filled(64, 48, rgb)
    }

    fn log_lines(rig: &Rig) -> Vec<String> {
        let day = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        let path = rig.pipeline.ledger().log_path(day);
        std::fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_start_requires_known_faces() {
        let dir = tempfile::tempdir().unwrap();
        let opener = ScriptedOpener::default();
        let mut pipeline = Pipeline::new(
            FakeExtractor::default(),
            Registry::default(),
            NearestMatcher::new(0.6),
            AttendanceLedger::new(dir.path()),
            opener.clone(),
        );
        let mut display = RecordingDisplay::default();

        let err = pipeline.start(&mut display).unwrap_err();
        assert!(matches!(err, PipelineError::EmptyRegistry));
        assert_eq!(pipeline.state(), PipelineState::Idle);
        assert_eq!(opener.opened(), 0);
        assert!(display.statuses.last().unwrap().starts_with("Error:"));
    }

    #[test]
    fn test_open_failure_stays_idle() {
        let mut rig = rig();
        rig.opener.fail_open(true);
        let err = rig.pipeline.start(&mut rig.display).unwrap_err();
        assert!(matches!(err, PipelineError::Source(SourceError::Open(_))));
        assert_eq!(rig.pipeline.state(), PipelineState::Idle);
        let report = rig.pipeline.tick(now(0), &mut rig.display);
        assert_eq!(report.outcome, TickOutcome::Idle);
    }

    #[test]
    fn test_logs_once_per_session() {
        let mut rig = rig();
        rig.pipeline.start(&mut rig.display).unwrap();
        for _ in 0..6 {
            rig.opener.push_frame(frame(ALICE));
        }

        let first = rig.pipeline.tick(now(1), &mut rig.display);
        assert_eq!(first.outcome, TickOutcome::Processed);
        assert_eq!(first.logged.len(), 1);
        assert_eq!(first.logged[0].label, "alice");
        assert!(rig.pipeline.ledger().is_logged("alice"));

        let mut total = first.logged.len();
        for t in 2..=6 {
            let report = rig.pipeline.tick(now(t), &mut rig.display);
            assert_eq!(report.faces[0].result.identity, Identity::Known("alice".into()));
            total += report.logged.len();
        }
        assert_eq!(total, 1);
        assert_eq!(log_lines(&rig), vec!["alice,2024-03-05,09:00:01"]);
        assert_eq!(rig.display.log, vec!["alice - 2024-03-05 09:00:01"]);
    }

    #[test]
    fn test_unknown_face_is_not_logged() {
        let mut rig = rig();
        rig.pipeline.start(&mut rig.display).unwrap();
        rig.opener.push_frame(frame(STRANGER));

        let report = rig.pipeline.tick(now(1), &mut rig.display);
        assert_eq!(report.outcome, TickOutcome::Processed);
        assert_eq!(report.faces.len(), 1);
        assert_eq!(report.faces[0].result.identity, Identity::Unknown);
        assert!(report.logged.is_empty());
        assert!(log_lines(&rig).is_empty());
    }

    #[test]
    fn test_only_every_other_tick_extracts() {
        let mut rig = rig();
        rig.pipeline.start(&mut rig.display).unwrap();
        for _ in 0..4 {
            rig.opener.push_frame(frame(EMPTY));
        }

        let outcomes: Vec<TickOutcome> = (0..4)
            .map(|t| rig.pipeline.tick(now(t), &mut rig.display).outcome)
            .collect();
        assert_eq!(
            outcomes,
            vec![
                TickOutcome::Processed,
                TickOutcome::Reused,
                TickOutcome::Processed,
                TickOutcome::Reused,
            ]
        );
        assert_eq!(rig.pipeline.extractor.calls, 2);
    }

    #[test]
    fn test_skipped_tick_reuses_previous_faces() {
        let mut rig = rig();
        rig.pipeline.start(&mut rig.display).unwrap();
        rig.opener.push_frame(frame(ALICE));
        // Bob walks in on the skipped tick; he must not appear until the next processing tick.
        rig.opener.push_frame(frame(BOB));
        rig.opener.push_frame(frame(BOB));

        let processed = rig.pipeline.tick(now(1), &mut rig.display);
        let reused = rig.pipeline.tick(now(2), &mut rig.display);
        assert_eq!(reused.outcome, TickOutcome::Reused);
        assert_eq!(reused.faces, processed.faces);
        assert!(reused.logged.is_empty());

        let next = rig.pipeline.tick(now(3), &mut rig.display);
        assert_eq!(next.outcome, TickOutcome::Processed);
        assert_eq!(next.faces[0].result.identity, Identity::Known("bob".into()));
        assert_eq!(log_lines(&rig), vec!["alice,2024-03-05,09:00:01", "bob,2024-03-05,09:00:03"]);
    }

    #[test]
    fn test_reused_tick_draws_held_boxes() {
        let mut rig = rig();
        rig.pipeline.start(&mut rig.display).unwrap();
        rig.opener.push_frame(frame(ALICE));
        rig.opener.push_frame(frame(EMPTY));

        rig.pipeline.tick(now(1), &mut rig.display);
        rig.pipeline.tick(now(2), &mut rig.display);

        let shown = rig.display.frames.last().unwrap().as_ref().unwrap();
        // The held face spans the whole frame, so its outline sits on the corner.
        assert_eq!(shown.pixel(0, 0), Some(annotate::BOX_COLOR));
    }

    #[test]
    fn test_read_failure_skips_without_flipping() {
        let mut rig = rig();
        rig.pipeline.start(&mut rig.display).unwrap();
        rig.opener.push_missing();
        rig.opener.push_frame(frame(ALICE));

        let missed = rig.pipeline.tick(now(1), &mut rig.display);
        assert_eq!(missed.outcome, TickOutcome::NoFrame);
        assert_eq!(rig.pipeline.state(), PipelineState::Running);
        assert!(rig.pipeline.sampler().process_next);

        let next = rig.pipeline.tick(now(2), &mut rig.display);
        assert_eq!(next.outcome, TickOutcome::Processed);
        assert_eq!(next.logged.len(), 1);
    }

    #[test]
    fn test_extraction_failure_means_no_faces() {
        let mut rig = rig();
        rig.pipeline.start(&mut rig.display).unwrap();
        rig.pipeline.extractor.push_failure("model exploded");
        rig.opener.push_frame(frame(ALICE));

        let report = rig.pipeline.tick(now(1), &mut rig.display);
        assert_eq!(report.outcome, TickOutcome::Processed);
        assert!(report.faces.is_empty());
        assert!(report.logged.is_empty());
        assert_eq!(rig.pipeline.state(), PipelineState::Running);
    }

    #[test]
    fn test_write_failure_retries_on_later_tick() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("logs");
        std::fs::write(&blocker, "").unwrap();

        let mut rig = rig();
        rig.pipeline.ledger = AttendanceLedger::new(&blocker);
        rig.pipeline.start(&mut rig.display).unwrap();
        rig.opener.push_frame(frame(ALICE));
        rig.opener.push_frame(frame(ALICE));
        rig.opener.push_frame(frame(ALICE));

        let failed = rig.pipeline.tick(now(1), &mut rig.display);
        assert_eq!(failed.write_failures, 1);
        assert!(!rig.pipeline.ledger().is_logged("alice"));
        assert!(rig.display.statuses.last().unwrap().starts_with("Error:"));

        // The directory becomes writable again before the next processing tick.
        std::fs::remove_file(&blocker).unwrap();
        rig.pipeline.tick(now(2), &mut rig.display);
        let retried = rig.pipeline.tick(now(3), &mut rig.display);
        assert_eq!(retried.logged.len(), 1);
        assert!(rig.pipeline.ledger().is_logged("alice"));
    }

    #[test]
    fn test_stop_releases_source_and_keeps_session() {
        let mut rig = rig();
        rig.pipeline.start(&mut rig.display).unwrap();
        rig.opener.push_frame(frame(ALICE));
        rig.pipeline.tick(now(1), &mut rig.display);

        rig.pipeline.stop(&mut rig.display);
        assert_eq!(rig.pipeline.state(), PipelineState::Idle);
        assert_eq!(rig.opener.released(), 1);
        assert!(rig.display.frames.last().unwrap().is_none());
        assert_eq!(rig.display.statuses.last().unwrap(), STATUS_STOPPED);
        assert!(rig.pipeline.ledger().is_logged("alice"));

        // Stop again is a no-op.
        rig.pipeline.stop(&mut rig.display);
        assert_eq!(rig.opener.released(), 1);
    }

    #[test]
    fn test_restart_begins_a_fresh_session() {
        let mut rig = rig();
        rig.pipeline.start(&mut rig.display).unwrap();
        rig.opener.push_frame(frame(ALICE));
        rig.pipeline.tick(now(1), &mut rig.display);
        rig.pipeline.stop(&mut rig.display);

        rig.pipeline.start(&mut rig.display).unwrap();
        assert_eq!(rig.opener.opened(), 2);
        rig.opener.push_frame(frame(ALICE));
        let report = rig.pipeline.tick(now(30), &mut rig.display);
        assert_eq!(report.logged.len(), 1);
        assert_eq!(log_lines(&rig).len(), 2);
    }

    #[test]
    fn test_start_while_running_is_noop() {
        let mut rig = rig();
        rig.pipeline.start(&mut rig.display).unwrap();
        rig.opener.push_frame(frame(ALICE));
        rig.pipeline.tick(now(1), &mut rig.display);

        rig.pipeline.start(&mut rig.display).unwrap();
        assert_eq!(rig.opener.opened(), 1);
        assert!(rig.pipeline.ledger().is_logged("alice"));
    }

    #[test]
    fn test_clear_is_idempotent_and_allows_relogging() {
        let mut rig = rig();
        rig.pipeline.start(&mut rig.display).unwrap();
        rig.opener.push_frame(frame(ALICE));
        rig.pipeline.tick(now(1), &mut rig.display);

        rig.pipeline.clear(&mut rig.display);
        rig.pipeline.clear(&mut rig.display);
        assert_eq!(rig.pipeline.ledger().session_len(), 0);
        assert!(rig.display.log.is_empty());
        assert_eq!(rig.pipeline.state(), PipelineState::Running);

        rig.opener.push_frame(frame(ALICE));
        rig.opener.push_frame(frame(ALICE));
        rig.pipeline.tick(now(2), &mut rig.display);
        let report = rig.pipeline.tick(now(3), &mut rig.display);
        assert_eq!(report.logged.len(), 1);
        assert_eq!(log_lines(&rig).len(), 2);
    }

    #[test]
    fn test_clear_while_idle() {
        let mut rig = rig();
        rig.pipeline.clear(&mut rig.display);
        assert_eq!(rig.pipeline.state(), PipelineState::Idle);
        assert_eq!(rig.display.statuses.last().unwrap(), STATUS_CLEARED);
    }

    #[test]
    fn test_sampler_state_is_a_plain_value() {
        let registry = Registry::from_entries(vec![RegistryEntry {
            label: "alice".into(),
            signature: Signature::new(vec![0.0, 0.0]),
        }])
        .unwrap();
        let mut extractor = FakeExtractor::default();
        extractor.face_for_color(ALICE, Signature::new(vec![0.3, 0.0]));
        let matcher = NearestMatcher::new(0.6);

        let (s1, p1) =
            SamplerState::default().advance(&frame(ALICE), &mut extractor, &registry, &matcher);
        let (s2, p2) = s1.clone().advance(&frame(EMPTY), &mut extractor, &registry, &matcher);
        assert!(p1 && !p2);
        assert_eq!(s2.held, s1.held);
        assert!(s2.process_next);
    }
}
