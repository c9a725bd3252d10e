//! Persistence of analysis artifacts

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::{debug, warn};
use serde::{Serialize, Serializer};
use uuid::Uuid;

use crate::error::{AnalysisError, Result};
use crate::frame::RgbFrame;

/// The four images produced per analysis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum ArtifactKind {
    Original,
    Overlay,
    Contour,
    Predict,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 4] = [
        ArtifactKind::Original,
        ArtifactKind::Overlay,
        ArtifactKind::Contour,
        ArtifactKind::Predict,
    ];

    /// Directory name under the store root
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Original => "Original",
            Self::Overlay => "Overlay",
            Self::Contour => "Contour",
            Self::Predict => "Predict",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Globally unique artifact identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ArtifactId {
    pub kind: ArtifactKind,
    pub uuid: Uuid,
}

impl ArtifactId {
    /// Fresh random (v4) identifier
    pub fn new(kind: ArtifactKind) -> Self {
        Self {
            kind,
            uuid: Uuid::new_v4(),
        }
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}.png", self.kind, self.uuid)
    }
}

/// Where a persisted artifact can be fetched from
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactRef {
    pub id: ArtifactId,
    pub location: String,
}

impl Serialize for ArtifactRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.location)
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.location)
    }
}

/// Persistence capability for artifact images
pub trait ArtifactStore: Send + Sync {
    fn persist(&self, id: &ArtifactId, frame: &RgbFrame) -> Result<ArtifactRef>;

    /// Delete a previously persisted artifact
    fn remove(&self, artifact: &ArtifactRef) -> Result<()>;
}

/// Writes PNG files to `<root>/<Kind>/<uuid>.png`
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, id: &ArtifactId) -> PathBuf {
        self.root
            .join(id.kind.dir_name())
            .join(format!("{}.png", id.uuid))
    }
}

impl ArtifactStore for FsArtifactStore {
    fn persist(&self, id: &ArtifactId, frame: &RgbFrame) -> Result<ArtifactRef> {
        let path = self.path_for(id);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| {
                AnalysisError::Storage(format!("cannot create {}: {e}", dir.display()))
            })?;
        }
        frame
            .save_png(&path)
            .map_err(|e| AnalysisError::Storage(format!("cannot write {}: {e}", path.display())))?;

        debug!("Persisted {id} to {}", path.display());
        Ok(ArtifactRef {
            id: *id,
            location: path.to_string_lossy().into_owned(),
        })
    }

    fn remove(&self, artifact: &ArtifactRef) -> Result<()> {
        let path = self.path_for(&artifact.id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Artifact {} already gone", path.display());
                Ok(())
            }
            Err(e) => Err(AnalysisError::Storage(format!(
                "cannot remove {}: {e}",
                path.display()
            ))),
        }
    }
}

/// Keeps artifacts in memory, optionally refusing writes past a fixed count
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    frames: Mutex<HashMap<ArtifactId, RgbFrame>>,
    limit: Option<usize>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that fails every write once it holds `limit` artifacts
    pub fn with_limit(limit: usize) -> Self {
        Self {
            frames: Mutex::default(),
            limit: Some(limit),
        }
    }

    pub fn get(&self, id: &ArtifactId) -> Option<RgbFrame> {
        self.frames.lock().ok()?.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().map_or(0, |frames| frames.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<ArtifactId> {
        self.frames
            .lock()
            .map(|frames| frames.keys().copied().collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<ArtifactId, RgbFrame>>> {
        self.frames
            .lock()
            .map_err(|_| AnalysisError::Storage("memory store lock poisoned".to_string()))
    }
}

impl ArtifactStore for MemoryArtifactStore {
    fn persist(&self, id: &ArtifactId, frame: &RgbFrame) -> Result<ArtifactRef> {
        let mut frames = self.lock()?;
        if self.limit.is_some_and(|limit| frames.len() >= limit) {
            return Err(AnalysisError::Storage(format!(
                "memory store full, cannot persist {id}"
            )));
        }
        if frames.insert(*id, frame.clone()).is_some() {
            warn!("Overwrote artifact {id}");
        }
        Ok(ArtifactRef {
            id: *id,
            location: format!("memory://{id}"),
        })
    }

    fn remove(&self, artifact: &ArtifactRef) -> Result<()> {
        self.lock()?.remove(&artifact.id);
        Ok(())
    }
}
