//! Reusable export buffers
//!
//! An export copies the selected samples into an [`ExportBuffer`] and checks
//! it out under a fresh buffer id. While checked out the buffer is immutable
//! and its pointers stay valid, so a host can read it in place. Returning the
//! id hands the allocation back to a bounded idle list for later exports.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Result, SensorError};

/// Minimum growth when a buffer runs out of reserved room
const MIN_GROWTH: usize = 64;

/// Timestamps and per-channel values of one export
#[derive(Debug, Default)]
pub struct ExportBuffer {
    timestamps: Vec<f64>,
    channels: Vec<Vec<f64>>,
    /// Start of each channel vector, rebuilt when the buffer is checked out
    channel_ptrs: Vec<*const f64>,
}

// SAFETY: `channel_ptrs` only points into `channels`, which the buffer owns.
// A checked-out buffer sits behind an `Arc` and is never mutated, so the
// pointers are shared read-only exactly like the vectors themselves.
unsafe impl Send for ExportBuffer {}
unsafe impl Sync for ExportBuffer {}

impl ExportBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear all samples and switch to `channels` channels, keeping capacity
    pub fn reset(&mut self, channels: usize) -> Result<()> {
        self.timestamps.clear();
        self.channel_ptrs.clear();
        self.channels.truncate(channels);
        for channel in &mut self.channels {
            channel.clear();
        }
        if self.channels.len() < channels {
            self.channels.try_reserve(channels - self.channels.len())?;
            self.channels.resize_with(channels, Vec::new);
        }
        Ok(())
    }

    /// Reserve room for `additional` more samples in every vector
    pub fn reserve(&mut self, additional: usize) -> Result<()> {
        self.timestamps.try_reserve(additional)?;
        for channel in &mut self.channels {
            channel.try_reserve(additional)?;
        }
        Ok(())
    }

    /// Append one sample
    ///
    /// # Arguments
    /// * `timestamp` - Device time of the sample in seconds
    /// * `value` - Value of the sample on channel `c`
    pub fn push(&mut self, timestamp: f64, value: impl Fn(usize) -> f64) -> Result<()> {
        if self.timestamps.len() == self.timestamps.capacity() {
            self.reserve(self.timestamps.len().max(MIN_GROWTH))?;
        }
        self.timestamps.push(timestamp);
        for (c, channel) in self.channels.iter_mut().enumerate() {
            channel.try_reserve(1)?;
            channel.push(value(c));
        }
        Ok(())
    }

    /// Number of samples per channel
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    /// Whether the buffer holds no samples
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Number of channels
    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    /// Sample timestamps in seconds
    pub fn timestamps(&self) -> &[f64] {
        &self.timestamps
    }

    /// Values of channel `index`
    ///
    /// # Panics
    /// If `index` is not below [`Self::num_channels`]
    pub fn channel(&self, index: usize) -> &[f64] {
        &self.channels[index]
    }

    fn seal(&mut self) -> Result<()> {
        self.channel_ptrs.clear();
        self.channel_ptrs.try_reserve(self.channels.len())?;
        self.channel_ptrs.extend(self.channels.iter().map(|c| c.as_ptr()));
        Ok(())
    }
}

/// A checked-out export buffer
///
/// Hand it back with [`ExportBufferPool::return_lease`]. Dropping a lease
/// without returning it leaves the buffer checked out under its id.
#[derive(Debug)]
pub struct ExportLease {
    buffer_id: u32,
    buffer: Arc<ExportBuffer>,
}

impl ExportLease {
    /// Id to return the buffer with
    pub fn buffer_id(&self) -> u32 {
        self.buffer_id
    }

    /// Samples per channel
    pub fn num_samples(&self) -> usize {
        self.buffer.len()
    }

    /// Number of channels
    pub fn num_channels(&self) -> usize {
        self.buffer.num_channels()
    }

    /// Sample timestamps in seconds
    pub fn timestamps(&self) -> &[f64] {
        self.buffer.timestamps()
    }

    /// Values of channel `index`
    pub fn channel(&self, index: usize) -> &[f64] {
        self.buffer.channel(index)
    }

    /// Start of the timestamp array, valid until the buffer is returned
    pub fn timestamp_ptr(&self) -> *const f64 {
        self.buffer.timestamps.as_ptr()
    }

    /// Start of the per-channel pointer table, valid until the buffer is
    /// returned
    pub fn channel_ptrs(&self) -> *const *const f64 {
        self.buffer.channel_ptrs.as_ptr()
    }
}

#[derive(Debug)]
struct PoolInner {
    checked_out: HashMap<u32, Arc<ExportBuffer>>,
    idle: Vec<ExportBuffer>,
    /// Candidate for the next buffer id; 0 is never handed out
    next_id: u32,
}

/// Checked-out export buffers plus recycled allocations
#[derive(Debug)]
pub struct ExportBufferPool {
    inner: Mutex<PoolInner>,
    max_idle: usize,
}

impl ExportBufferPool {
    /// Create a pool keeping at most `max_idle` returned buffers for reuse
    pub fn new(max_idle: usize) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                checked_out: HashMap::new(),
                idle: Vec::new(),
                next_id: 1,
            }),
            max_idle,
        }
    }

    /// Fill a buffer and check it out
    ///
    /// # Arguments
    /// * `channels` - Expected channel count, used to pick a recycled buffer
    /// * `fill` - Writes the export into the buffer
    ///
    /// # Returns
    /// A lease on the filled buffer, or the error from `fill`. The pool lock
    /// is not held while `fill` runs.
    pub fn fill<F>(&self, channels: usize, fill: F) -> Result<ExportLease>
    where
        F: FnOnce(&mut ExportBuffer) -> Result<()>,
    {
        let mut buffer = self.take_idle(channels);
        let filled = fill(&mut buffer).and_then(|_| buffer.seal());
        if let Err(e) = filled {
            self.recycle(buffer);
            return Err(e);
        }

        let mut inner = self.inner.lock();
        if let Err(e) = inner.checked_out.try_reserve(1) {
            drop(inner);
            self.recycle(buffer);
            return Err(e.into());
        }

        let mut id = inner.next_id;
        while id == 0 || inner.checked_out.contains_key(&id) {
            id = id.wrapping_add(1);
        }
        inner.next_id = id.wrapping_add(1);

        let buffer = Arc::new(buffer);
        inner.checked_out.insert(id, Arc::clone(&buffer));
        tracing::trace!(
            buffer_id = id,
            samples = buffer.len(),
            channels = buffer.num_channels(),
            checked_out = inner.checked_out.len(),
            "Buffer checked out"
        );
        Ok(ExportLease {
            buffer_id: id,
            buffer,
        })
    }

    /// Return a checked-out buffer by id
    ///
    /// Fails with [`SensorError::BufferNotCheckedOut`] for an unknown id,
    /// including one that was already returned.
    pub fn return_buffer(&self, buffer_id: u32) -> Result<()> {
        let buffer = self
            .inner
            .lock()
            .checked_out
            .remove(&buffer_id)
            .ok_or(SensorError::BufferNotCheckedOut(buffer_id))?;

        // Still shared when a lease for it is alive; it is freed with the lease
        if let Ok(buffer) = Arc::try_unwrap(buffer) {
            self.recycle(buffer);
        }
        tracing::trace!(buffer_id, "Buffer returned");
        Ok(())
    }

    /// Return the buffer behind a lease
    pub fn return_lease(&self, lease: ExportLease) -> Result<()> {
        let ExportLease { buffer_id, buffer } = lease;
        drop(buffer);
        self.return_buffer(buffer_id)
    }

    /// Number of buffers currently checked out
    pub fn checked_out(&self) -> usize {
        self.inner.lock().checked_out.len()
    }

    /// Number of returned buffers waiting for reuse
    pub fn idle(&self) -> usize {
        self.inner.lock().idle.len()
    }

    fn take_idle(&self, channels: usize) -> ExportBuffer {
        let mut inner = self.inner.lock();
        let position = inner
            .idle
            .iter()
            .rposition(|b| b.num_channels() == channels)
            .or_else(|| inner.idle.len().checked_sub(1));
        match position {
            Some(i) => inner.idle.swap_remove(i),
            None => ExportBuffer::new(),
        }
    }

    fn recycle(&self, mut buffer: ExportBuffer) {
        let mut inner = self.inner.lock();
        if inner.idle.len() < self.max_idle {
            let channels = buffer.num_channels();
            // Clearing an existing buffer never allocates
            if buffer.reset(channels).is_ok() {
                inner.idle.push(buffer);
            }
        }
    }
}

impl Default for ExportBufferPool {
    fn default() -> Self {
        Self::new(8)
    }
}
