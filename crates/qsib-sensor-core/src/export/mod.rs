//! Export of stored signals into caller-visible buffers

pub mod buffer;
