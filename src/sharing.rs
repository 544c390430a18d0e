//! Model persistence for sharing a model with worker processes.
//!
//! [`persist`] turns an in-memory model into a [`PersistedModel`], which owns the storage
//! and hands out a [`ModelHandle`]. The handle is small and serializable; a worker process
//! receives it once at start-up and materializes the model with [`ModelHandle::get`].

use crate::buffer::NumericBuffer;
use crate::codec::{BufferCodec, Codec};
use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempPath;
use tracing::debug;

/// Number of times a model has been materialized from a handle in this process.
static FETCHES: AtomicUsize = AtomicUsize::new(0);

/// How many times this process has materialized a model from a [`ModelHandle`].
pub fn fetch_count() -> usize {
    FETCHES.load(Ordering::Relaxed)
}

/// Where a persisted model lives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PersistMethod {
    /// A temporary file, read by each worker (default).
    #[default]
    File,
    /// Encoded bytes carried inside the handle itself.
    Inline,
}

impl FromStr for PersistMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "file" => Ok(Self::File),
            "inline" => Ok(Self::Inline),
            _ => Err(format!(
                "Unknown persist method: '{}'. Valid options: file, inline",
                s
            )),
        }
    }
}

impl fmt::Display for PersistMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File => write!(f, "file"),
            Self::Inline => write!(f, "inline"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Location {
    File { path: PathBuf },
    Inline { bytes: NumericBuffer<u8> },
}

/// A serializable reference to a persisted model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelHandle {
    location: Location,
}

impl ModelHandle {
    /// The persistence method behind this handle.
    pub fn method(&self) -> PersistMethod {
        match self.location {
            Location::File { .. } => PersistMethod::File,
            Location::Inline { .. } => PersistMethod::Inline,
        }
    }

    /// Backing file, for file-persisted handles.
    pub fn path(&self) -> Option<&Path> {
        match &self.location {
            Location::File { path } => Some(path),
            Location::Inline { .. } => None,
        }
    }

    /// Materialize the model.
    ///
    /// Safe to call repeatedly; each call decodes a fresh copy, so callers are expected to
    /// fetch once and keep the result.
    pub fn get<M: DeserializeOwned>(&self) -> Result<M> {
        let model = match &self.location {
            Location::File { path } => {
                let file = File::open(path).map_err(|e| {
                    Error::Persist(format!("cannot open {}: {}", path.display(), e))
                })?;
                BufferCodec.read_frame(&mut BufReader::new(file))?
            }
            Location::Inline { bytes } => {
                BufferCodec.read_frame(&mut Cursor::new(bytes.as_slice()))?
            }
        };
        FETCHES.fetch_add(1, Ordering::Relaxed);
        model.ok_or_else(|| Error::Persist("persisted model is empty".into()))
    }
}

/// A persisted model and the storage it owns.
///
/// Dropping it releases the storage; handles cloned from it stop working after that.
#[derive(Debug)]
pub struct PersistedModel {
    handle: ModelHandle,
    _file: Option<TempPath>,
}

impl PersistedModel {
    /// The shareable handle.
    pub fn handle(&self) -> &ModelHandle {
        &self.handle
    }
}

/// Persist `model` so other processes can fetch it through a [`ModelHandle`].
pub fn persist<M: Serialize>(model: &M, method: PersistMethod) -> Result<PersistedModel> {
    match method {
        PersistMethod::File => {
            let mut file = tempfile::Builder::new()
                .prefix("modelops-")
                .suffix(".model")
                .tempfile()?;
            {
                let mut writer = BufWriter::new(file.as_file_mut());
                BufferCodec.write_frame(&mut writer, model)?;
                writer.flush()?;
            }
            let path = file.into_temp_path();
            debug!(path = %path.display(), "persisted model to file");
            Ok(PersistedModel {
                handle: ModelHandle {
                    location: Location::File {
                        path: path.to_path_buf(),
                    },
                },
                _file: Some(path),
            })
        }
        PersistMethod::Inline => {
            let mut bytes = Vec::new();
            BufferCodec.write_frame(&mut bytes, model)?;
            debug!(bytes = bytes.len(), "persisted model inline");
            Ok(PersistedModel {
                handle: ModelHandle {
                    location: Location::Inline {
                        bytes: NumericBuffer::new(bytes),
                    },
                },
                _file: None,
            })
        }
    }
}

/// A model as supplied by a caller: either the model itself or a handle to a persisted one.
#[derive(Debug, Clone)]
pub enum ModelSource<M> {
    /// An in-memory model.
    Raw(M),
    /// A model persisted elsewhere.
    Handle(ModelHandle),
}

impl<M> ModelSource<M> {
    /// Whether this source still needs persisting before workers can use it.
    pub fn is_raw(&self) -> bool {
        matches!(self, Self::Raw(_))
    }
}

impl<M: DeserializeOwned> ModelSource<M> {
    /// Produce the in-memory model, fetching it from the handle if needed.
    pub fn materialize(self) -> Result<M> {
        match self {
            Self::Raw(model) => Ok(model),
            Self::Handle(handle) => handle.get(),
        }
    }
}

impl<M: Serialize> ModelSource<M> {
    /// Produce a handle workers can fetch, persisting a raw model with `method`.
    pub(crate) fn share(self, method: PersistMethod) -> Result<SharedModel> {
        match self {
            Self::Raw(model) => Ok(SharedModel::Owned(persist(&model, method)?)),
            Self::Handle(handle) => Ok(SharedModel::Borrowed(handle)),
        }
    }
}

impl<M> From<ModelHandle> for ModelSource<M> {
    fn from(handle: ModelHandle) -> Self {
        Self::Handle(handle)
    }
}

/// A model handle as held by a worker pool.
#[derive(Debug)]
pub(crate) enum SharedModel {
    /// Persisted by the pool, released with it.
    Owned(PersistedModel),
    /// Supplied by the caller, who keeps ownership.
    Borrowed(ModelHandle),
}

impl SharedModel {
    pub(crate) fn handle(&self) -> &ModelHandle {
        match self {
            Self::Owned(persisted) => persisted.handle(),
            Self::Borrowed(handle) => handle,
        }
    }
}
