//! `FrameBuffer`: an immutable decoded frame plus its accounting header.

use std::sync::Arc;

/// Immutable byte blob for one decoded display-resolution frame.
///
/// `byte_size` comes from the loader and is authoritative for accounting;
/// the cache never recomputes it from `data.len()`.
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    data: Arc<[u8]>,
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    pub byte_size: usize,
}

impl FrameBuffer {
    pub fn new(data: Arc<[u8]>, width: u32, height: u32, channels: u8, byte_size: usize) -> Self {
        FrameBuffer { data, width, height, channels, byte_size }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }
}

/// One decoded frame as handed back by a `FrameLoader`.
#[derive(Debug, Clone)]
pub struct LoadedFrame {
    pub data: Arc<[u8]>,
    pub width: u32,
    pub height: u32,
    pub channels: u8,
}

impl From<LoadedFrame> for FrameBuffer {
    fn from(f: LoadedFrame) -> Self {
        let byte_size = f.data.len();
        FrameBuffer::new(f.data, f.width, f.height, f.channels, byte_size)
    }
}
