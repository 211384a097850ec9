//! Known-face registry: one signature per labeled reference image.

use crate::extractor::FaceExtractor;
use crate::types::{Frame, Signature};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Reference image extensions, compared case-insensitively.
pub const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("failed to read registry directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("duplicate label {label:?}: {first} and {second}")]
    DuplicateLabel {
        label: String,
        first: PathBuf,
        second: PathBuf,
    },
    #[error("duplicate label {0:?}")]
    DuplicateEntry(String),
}

/// A labeled reference signature.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryEntry {
    pub label: String,
    pub signature: Signature,
}

/// The in-memory set of known faces, immutable once loaded.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    entries: Vec<RegistryEntry>,
}

impl Registry {
    /// Build a registry from ready-made entries, rejecting duplicate labels.
    pub fn from_entries(entries: Vec<RegistryEntry>) -> Result<Self, RegistryError> {
        let mut seen = HashSet::new();
        for entry in &entries {
            if !seen.insert(entry.label.as_str()) {
                return Err(RegistryError::DuplicateEntry(entry.label.clone()));
            }
        }
        Ok(Self { entries })
    }

    /// Load every reference image in `dir`.
    ///
    /// A missing directory gives an empty registry. Images with no face,
    /// images that fail to decode and images the extractor chokes on are
    /// skipped with a warning. Two files with the same stem are an error.
    pub fn load<E: FaceExtractor + ?Sized>(
        dir: &Path,
        extractor: &mut E,
    ) -> Result<Self, RegistryError> {
        if !dir.is_dir() {
            tracing::warn!(
                dir = %dir.display(),
                "known faces directory missing; registry is empty"
            );
            return Ok(Self::default());
        }

        let mut sources: HashMap<String, PathBuf> = HashMap::new();
        let mut entries = Vec::new();

        for path in reference_images(dir)? {
            let Some(label) = label_for(&path) else {
                tracing::warn!(
                    path = %path.display(),
                    "unusable file name for a label; skipping"
                );
                continue;
            };
            if let Some(first) = sources.get(&label) {
                return Err(RegistryError::DuplicateLabel {
                    label,
                    first: first.clone(),
                    second: path,
                });
            }
            sources.insert(label.clone(), path.clone());

            let image = match image::open(&path) {
                Ok(img) => Frame::from_image(img.to_rgb8()),
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "unreadable reference image; skipping"
                    );
                    continue;
                }
            };

            match extractor.encode_single(&image) {
                Ok(Some(signature)) => {
                    tracing::debug!(label = %label, path = %path.display(), "registered face");
                    entries.push(RegistryEntry { label, signature });
                }
                Ok(None) => {
                    tracing::warn!(
                        path = %path.display(),
                        "no face found in reference image; skipping"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "extraction failed on reference image; skipping"
                    );
                }
            }
        }

        tracing::info!(dir = %dir.display(), count = entries.len(), "known faces loaded");
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[RegistryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.label.as_str())
    }

    pub fn get(&self, label: &str) -> Option<&RegistryEntry> {
        self.entries.iter().find(|e| e.label == label)
    }
}

/// Reference image files in `dir`, sorted by file name.
pub fn reference_images(dir: &Path) -> Result<Vec<PathBuf>, RegistryError> {
    let read_err = |source| RegistryError::ReadDir {
        path: dir.to_path_buf(),
        source,
    };
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(read_err)? {
        let path = entry.map_err(read_err)?.path();
        if path.is_file() && has_image_extension(&path) {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
}

/// Whether `label` can name a person: non-empty with no control characters.
///
/// Attendance records are one line each, so a label must never carry a
/// line break into the ledger.
pub fn is_valid_label(label: &str) -> bool {
    !label.is_empty() && !label.chars().any(char::is_control)
}

/// Label for a reference image: its file name without the extension.
pub fn label_for(path: &Path) -> Option<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| is_valid_label(s))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeExtractor;

    fn write_image(dir: &Path, name: &str, rgb: [u8; 3]) {
        Frame::filled(8, 8, rgb)
            .to_image()
            .unwrap()
            .save(dir.join(name))
            .unwrap();
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut fake = FakeExtractor::default();
        let reg = Registry::load(&dir.path().join("nope"), &mut fake).unwrap();
        assert!(reg.is_empty());
    }

    #[test]
    fn test_loads_one_entry_per_face_image() {
        let dir = tempfile::tempdir().unwrap();
        write_image(dir.path(), "alice.png", [255, 0, 0]);
        write_image(dir.path(), "bob.PNG", [0, 255, 0]);

        let mut fake = FakeExtractor::default();
        fake.face_for_color([255, 0, 0], Signature::new(vec![1.0, 0.0]));
        fake.face_for_color([0, 255, 0], Signature::new(vec![0.0, 1.0]));

        let reg = Registry::load(dir.path(), &mut fake).unwrap();
        assert_eq!(reg.labels().collect::<Vec<_>>(), vec!["alice", "bob"]);
        assert_eq!(reg.get("bob").unwrap().signature.values, vec![0.0, 1.0]);
    }

    #[test]
    fn test_skips_faceless_and_non_image_files() {
        let dir = tempfile::tempdir().unwrap();
        write_image(dir.path(), "alice.png", [255, 0, 0]);
        write_image(dir.path(), "empty_room.png", [9, 9, 9]);
        std::fs::write(dir.path().join("notes.txt"), "not an image").unwrap();
        std::fs::write(dir.path().join("corrupt.jpg"), b"\xff\xd8 garbage").unwrap();

        let mut fake = FakeExtractor::default();
        fake.face_for_color([255, 0, 0], Signature::new(vec![1.0]));

        let reg = Registry::load(dir.path(), &mut fake).unwrap();
        assert_eq!(reg.len(), 1);
        assert!(reg.get("alice").is_some());
        assert!(reg.get("empty_room").is_none());
    }

    #[test]
    fn test_duplicate_label_fails() {
        let dir = tempfile::tempdir().unwrap();
        write_image(dir.path(), "alice.png", [255, 0, 0]);
        write_image(dir.path(), "alice.jpg", [255, 0, 0]);

        let mut fake = FakeExtractor::default();
        fake.face_for_color([255, 0, 0], Signature::new(vec![1.0]));

        let err = Registry::load(dir.path(), &mut fake).unwrap_err();
        match err {
            RegistryError::DuplicateLabel { label, .. } => assert_eq!(label, "alice"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_from_entries_rejects_duplicates() {
        let e = RegistryEntry {
            label: "x".into(),
            signature: Signature::new(vec![0.0]),
        };
        assert!(Registry::from_entries(vec![e.clone(), e]).is_err());
    }

    #[test]
    fn test_extension_allow_list() {
        assert!(has_image_extension(Path::new("a.JPEG")));
        assert!(has_image_extension(Path::new("a.jpg")));
        assert!(!has_image_extension(Path::new("a.gif")));
        assert!(!has_image_extension(Path::new("jpg")));
    }

    #[test]
    fn test_label_strips_extension_only() {
        assert_eq!(
            label_for(Path::new("/x/Mary Ann.jpg")).as_deref(),
            Some("Mary Ann")
        );
        assert_eq!(label_for(Path::new("j.r.r.png")).as_deref(), Some("j.r.r"));
    }

    #[test]
    fn test_label_rejects_control_characters() {
        assert_eq!(label_for(Path::new("lee\n\"x.png")), None);
        assert_eq!(label_for(Path::new("tab\there.jpg")), None);
        assert!(!is_valid_label(""));
        assert!(!is_valid_label("a\rb"));
        assert!(is_valid_label("Doe, \"JD\" John"));
    }

    #[test]
    fn test_newline_file_name_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_image(dir.path(), "alice.png", [255, 0, 0]);
        write_image(dir.path(), "lee\nmallory.png", [255, 0, 0]);

        let mut fake = FakeExtractor::default();
        fake.face_for_color([255, 0, 0], Signature::new(vec![1.0]));

        let reg = Registry::load(dir.path(), &mut fake).unwrap();
        assert_eq!(reg.labels().collect::<Vec<_>>(), vec!["alice"]);
    }
}
