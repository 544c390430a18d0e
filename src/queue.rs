//! Fast serialization queue.
//!
//! A single-writer/single-reader transport over an OS pipe. Each endpoint is typed by the
//! [`Codec`] it speaks; the codec is fixed when the endpoint is built and travels with the
//! type, so an endpoint rebuilt from a raw descriptor in another process speaks the same
//! protocol as long as it is constructed with the same codec.
//!
//! ```no_run
//! use modelops::{BufferCodec, NumericBuffer, fast_queue};
//!
//! let (tx, mut rx) = fast_queue::<BufferCodec>()?;
//! tx.put(&NumericBuffer::new(vec![0.5f64; 1 << 16]))?;
//! let back: NumericBuffer<f64> = rx.get()?.expect("sender is still open");
//! # Ok::<(), modelops::Error>(())
//! ```

use crate::codec::{BufferCodec, Codec};
use crate::error::{Error, Result};
use crate::ipc::{self, PipeFd};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::{BufReader, BufWriter, Write};
use std::os::unix::io::RawFd;
use std::sync::Mutex;

/// Default buffer size for queue endpoints (64KB).
const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Writing end of a fast queue.
///
/// `put` holds an internal lock for the whole frame, so a sender shared between threads
/// never interleaves frames.
#[derive(Debug)]
pub struct FastSender<C: Codec = BufferCodec> {
    writer: Mutex<BufWriter<PipeFd>>,
    codec: C,
}

/// Reading end of a fast queue.
#[derive(Debug)]
pub struct FastReceiver<C: Codec = BufferCodec> {
    reader: BufReader<PipeFd>,
    codec: C,
}

/// Create a connected queue inside this process.
pub fn fast_queue<C: Codec + Default>() -> Result<(FastSender<C>, FastReceiver<C>)> {
    fast_queue_with(C::default())
}

/// Create a connected queue speaking `codec`.
pub fn fast_queue_with<C: Codec>(codec: C) -> Result<(FastSender<C>, FastReceiver<C>)> {
    let (read_end, write_end) = ipc::pipe()?;
    Ok((
        FastSender::new(write_end, codec.clone()),
        FastReceiver::new(read_end, codec),
    ))
}

impl<C: Codec> FastSender<C> {
    /// Wrap the write end of a pipe.
    pub fn new(fd: impl Into<PipeFd>, codec: C) -> Self {
        Self {
            writer: Mutex::new(BufWriter::with_capacity(DEFAULT_BUFFER_SIZE, fd.into())),
            codec,
        }
    }

    /// Rebuild a sender from a descriptor inherited from another process.
    ///
    /// # Safety
    /// `fd` must be an open descriptor owned by nobody else in this process.
    pub unsafe fn from_raw_fd(fd: RawFd, codec: C) -> Self {
        Self::new(unsafe { PipeFd::from_raw(fd) }, codec)
    }

    /// The codec this sender writes.
    pub fn codec(&self) -> &C {
        &self.codec
    }

    /// Send one value and flush it to the pipe.
    pub fn put<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| Error::Worker("queue writer lock poisoned".into()))?;
        self.codec.write_frame(&mut *writer, value)?;
        writer.flush()?;
        Ok(())
    }

    /// Flush and release the underlying descriptor, e.g. to hand it to a child process.
    pub fn into_fd(self) -> Result<PipeFd> {
        let writer = self
            .writer
            .into_inner()
            .map_err(|_| Error::Worker("queue writer lock poisoned".into()))?;
        writer
            .into_inner()
            .map_err(|e| Error::Io(e.into_error()))
    }
}

impl<C: Codec> FastReceiver<C> {
    /// Wrap the read end of a pipe.
    pub fn new(fd: impl Into<PipeFd>, codec: C) -> Self {
        Self {
            reader: BufReader::with_capacity(DEFAULT_BUFFER_SIZE, fd.into()),
            codec,
        }
    }

    /// Rebuild a receiver from a descriptor inherited from another process.
    ///
    /// # Safety
    /// `fd` must be an open descriptor owned by nobody else in this process.
    pub unsafe fn from_raw_fd(fd: RawFd, codec: C) -> Self {
        Self::new(unsafe { PipeFd::from_raw(fd) }, codec)
    }

    /// The codec this receiver reads.
    pub fn codec(&self) -> &C {
        &self.codec
    }

    /// Receive the next value in put order.
    ///
    /// Returns `None` once every sender has closed and all frames were read.
    pub fn get<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        self.codec.read_frame(&mut self.reader)
    }

    /// Release the underlying descriptor. Data already buffered is discarded.
    pub fn into_fd(self) -> PipeFd {
        self.reader.into_inner()
    }
}
