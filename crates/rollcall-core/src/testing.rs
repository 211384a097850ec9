//! In-memory fakes for unit tests.

use crate::extractor::{ExtractorError, FaceExtractor, Metric};
use crate::pipeline::{DisplaySink, FrameSource, SourceError, SourceOpener};
use crate::types::{BoundingBox, Detection, Frame, Signature};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

/// Extractor driven by a script, falling back to frame color.
///
/// Scripted results are consumed first. With the script empty, a frame
/// whose top-left pixel has a registered color yields one face covering
/// the whole frame; any other frame has no faces.
#[derive(Default)]
pub struct FakeExtractor {
    script: VecDeque<Result<Vec<Detection>, String>>,
    faces_by_color: HashMap<[u8; 3], Signature>,
    pub calls: usize,
}

impl FakeExtractor {
    pub fn push_detections(&mut self, detections: Vec<Detection>) {
        self.script.push_back(Ok(detections));
    }

    pub fn push_failure(&mut self, message: &str) {
        self.script.push_back(Err(message.to_string()));
    }

    pub fn face_for_color(&mut self, rgb: [u8; 3], signature: Signature) {
        self.faces_by_color.insert(rgb, signature);
    }
}

impl Metric for FakeExtractor {
    fn distance(&self, a: &Signature, b: &Signature) -> f32 {
        a.euclidean_distance(b)
    }
}

impl FaceExtractor for FakeExtractor {
    fn detect_and_encode(&mut self, frame: &Frame) -> Result<Vec<Detection>, ExtractorError> {
        self.calls += 1;
        if let Some(next) = self.script.pop_front() {
            return next.map_err(ExtractorError::Failed);
        }
        let signature = frame.pixel(0, 0).and_then(|rgb| self.faces_by_color.get(&rgb));
        Ok(signature
            .map(|signature| Detection {
                region: BoundingBox::new(0.0, 0.0, frame.width as f32, frame.height as f32),
                signature: signature.clone(),
            })
            .into_iter()
            .collect())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct FakeFailure(&'static str);

#[derive(Default)]
struct OpenerShared {
    /// `None` entries are read failures.
    frames: RefCell<VecDeque<Option<Frame>>>,
    fail_open: Cell<bool>,
    opened: Cell<usize>,
    released: Cell<usize>,
}

/// Opener handing out sources that read from one shared frame queue.
/// Clones share state, so a test keeps one clone to feed frames.
#[derive(Clone, Default)]
pub struct ScriptedOpener {
    shared: Rc<OpenerShared>,
}

impl ScriptedOpener {
    pub fn push_frame(&self, frame: Frame) {
        self.shared.frames.borrow_mut().push_back(Some(frame));
    }

    pub fn push_missing(&self) {
        self.shared.frames.borrow_mut().push_back(None);
    }

    pub fn fail_open(&self, fail: bool) {
        self.shared.fail_open.set(fail);
    }

    pub fn opened(&self) -> usize {
        self.shared.opened.get()
    }

    pub fn released(&self) -> usize {
        self.shared.released.get()
    }
}

impl SourceOpener for ScriptedOpener {
    type Source = ScriptedSource;

    fn open(&mut self) -> Result<ScriptedSource, SourceError> {
        if self.shared.fail_open.get() {
            return Err(SourceError::Open(Box::new(FakeFailure("device busy"))));
        }
        self.shared.opened.set(self.shared.opened.get() + 1);
        Ok(ScriptedSource {
            shared: Rc::clone(&self.shared),
            sequence: 0,
        })
    }
}

pub struct ScriptedSource {
    shared: Rc<OpenerShared>,
    sequence: u32,
}

impl FrameSource for ScriptedSource {
    fn read_frame(&mut self) -> Result<Frame, SourceError> {
        match self.shared.frames.borrow_mut().pop_front() {
            Some(Some(mut frame)) => {
                self.sequence += 1;
                frame.sequence = self.sequence;
                Ok(frame)
            }
            Some(None) => Err(SourceError::Read(Box::new(FakeFailure("dropped frame")))),
            None => Err(SourceError::Read(Box::new(FakeFailure("queue empty")))),
        }
    }
}

impl Drop for ScriptedSource {
    fn drop(&mut self) {
        self.shared.released.set(self.shared.released.get() + 1);
    }
}

/// Display that remembers everything it was shown.
#[derive(Default)]
pub struct RecordingDisplay {
    pub frames: Vec<Option<Frame>>,
    pub statuses: Vec<String>,
    pub log: Vec<String>,
}

impl DisplaySink for RecordingDisplay {
    fn show_frame(&mut self, frame: Option<&Frame>) {
        self.frames.push(frame.cloned());
    }

    fn set_status(&mut self, status: &str) {
        self.statuses.push(status.to_string());
    }

    fn append_log(&mut self, line: &str) {
        self.log.push(line.to_string());
    }

    fn clear_log(&mut self) {
        self.log.clear();
    }
}
