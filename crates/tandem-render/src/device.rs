//! The device seam: where render commands meet an actual GPU (or not).
//!
//! [`RenderDevice`] is the narrow interface the render backend drives. A
//! device lives on the render consumer thread only and may be `!Send`, which
//! is the usual situation for graphics contexts. [`HeadlessDevice`] keeps
//! resources in host memory and records the draw stream of the last few
//! presented frames; it backs tests and runs without a window.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::command::{Color, IndexFormat, ShaderDesc, TextureDesc, Viewport, TEXTURE_SLOTS};

/// Device-local identifier of a buffer, texture or shader.
pub type DeviceId = u64;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures reported by a [`RenderDevice`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    /// An allocation would exceed the device memory budget.
    #[error("out of device memory: {requested} bytes requested, {available} available")]
    OutOfMemory {
        /// Bytes asked for.
        requested: u64,
        /// Bytes left in the budget.
        available: u64,
    },

    /// A byte range falls outside a resource.
    #[error("range {offset}..{offset}+{len} is outside a resource of {size} bytes")]
    OutOfBounds {
        /// Start of the range.
        offset: u64,
        /// Length of the range.
        len: u64,
        /// Size of the resource.
        size: u64,
    },

    /// The id does not name a live device resource.
    #[error("unknown device resource {id}")]
    UnknownResource {
        /// The id.
        id: DeviceId,
    },

    /// The shader program was rejected.
    #[error("shader '{label}' rejected: {reason}")]
    ShaderRejected {
        /// Shader label.
        label: String,
        /// Why it was rejected.
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// FrameStats
// ---------------------------------------------------------------------------

/// Counters for one presented frame.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FrameStats {
    /// 1-based index of the frame; 0 means nothing presented yet.
    pub frame: u64,
    /// Draw and indexed-draw calls recorded.
    pub draw_calls: u32,
    /// Vertices submitted by non-indexed draws.
    pub vertices: u64,
    /// Indices submitted by indexed draws.
    pub indices: u64,
    /// Clears recorded.
    pub clears: u32,
    /// Viewport in effect at present time.
    pub viewport: Viewport,
}

// ---------------------------------------------------------------------------
// DrawCall
// ---------------------------------------------------------------------------

/// Device resources bound when a draw is issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrawBindings {
    /// Shader program.
    pub shader: DeviceId,
    /// Vertex buffer.
    pub vertex: DeviceId,
    /// Index buffer and index width, if one is bound.
    pub index: Option<(DeviceId, IndexFormat)>,
    /// Texture per slot.
    pub textures: [Option<DeviceId>; TEXTURE_SLOTS as usize],
}

/// A validated frame command handed to the device.
#[derive(Debug, Clone, PartialEq)]
pub enum DrawCall {
    /// Clear the target.
    Clear {
        /// Clear color.
        color: Color,
    },
    /// Change the target rectangle.
    SetViewport {
        /// New viewport.
        viewport: Viewport,
    },
    /// Non-indexed draw.
    Draw {
        /// Resources in effect.
        bindings: DrawBindings,
        /// First vertex.
        first_vertex: u32,
        /// Number of vertices.
        vertex_count: u32,
    },
    /// Indexed draw; `bindings.index` is always set.
    DrawIndexed {
        /// Resources in effect.
        bindings: DrawBindings,
        /// First index.
        first_index: u32,
        /// Number of indices.
        index_count: u32,
    },
}

// ---------------------------------------------------------------------------
// RenderDevice
// ---------------------------------------------------------------------------

/// A graphics device driven by the render consumer.
///
/// All methods are called on the consumer thread, in command order. The
/// backend validates handles, bindings and draw ranges before calling in;
/// the device only reports what it alone can know (memory, compilation).
pub trait RenderDevice {
    /// Human-readable device name for logs.
    fn name(&self) -> &str;

    /// Allocate a zero-filled buffer of `size` bytes.
    fn create_buffer(&mut self, size: u64) -> Result<DeviceId, DeviceError>;

    /// Write `data` at `offset`.
    fn write_buffer(&mut self, id: DeviceId, offset: u64, data: &[u8]) -> Result<(), DeviceError>;

    /// Copy `len` bytes starting at `offset`.
    fn read_buffer(&self, id: DeviceId, offset: u64, len: u64) -> Result<Vec<u8>, DeviceError>;

    /// Allocate a texture, optionally with initial texels.
    fn create_texture(
        &mut self,
        desc: &TextureDesc,
        pixels: Option<&[u8]>,
    ) -> Result<DeviceId, DeviceError>;

    /// Compile a shader program.
    fn create_shader(&mut self, desc: &ShaderDesc) -> Result<DeviceId, DeviceError>;

    /// Free a resource. Unknown ids are ignored.
    fn destroy(&mut self, id: DeviceId);

    /// Record a clear, viewport change or draw into the current frame.
    ///
    /// Every id in a draw's bindings names a live resource of the right kind
    /// and the draw range lies inside the bound buffers.
    fn submit(&mut self, call: &DrawCall) -> Result<(), DeviceError>;

    /// Hand a finished frame to the display.
    fn present(&mut self, frame: &FrameStats) -> Result<(), DeviceError>;
}

// ---------------------------------------------------------------------------
// HeadlessDevice
// ---------------------------------------------------------------------------

/// Default memory budget of a [`HeadlessDevice`]: 256 MiB.
pub const DEFAULT_MEMORY_BUDGET: u64 = 256 * 1024 * 1024;

/// Presented frames a [`HeadlessDevice`] keeps by default.
pub const DEFAULT_FRAME_HISTORY: usize = 8;

/// Calls a [`HeadlessDevice`] records per frame; later ones are only counted.
pub const MAX_RECORDED_CALLS: usize = 65_536;

/// A frame kept in the [`HeadlessDevice`] history.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PresentedFrame {
    /// Counters the backend reported at present time.
    pub stats: FrameStats,
    /// Calls submitted during the frame, in order.
    pub calls: Vec<DrawCall>,
    /// Calls past [`MAX_RECORDED_CALLS`] that were not recorded.
    pub calls_dropped: u64,
}

#[derive(Debug)]
enum Stored {
    Buffer(Vec<u8>),
    Texture(Vec<u8>),
    Shader,
}

impl Stored {
    fn bytes(&self) -> u64 {
        match self {
            Stored::Buffer(b) | Stored::Texture(b) => b.len() as u64,
            Stored::Shader => 0,
        }
    }
}

/// A device that keeps everything in host memory.
///
/// Only the last `history` presented frames are kept; older ones are
/// dropped as new frames arrive.
#[derive(Debug)]
pub struct HeadlessDevice {
    next_id: DeviceId,
    resources: HashMap<DeviceId, Stored>,
    budget: u64,
    allocated: u64,
    pending: PresentedFrame,
    presented: VecDeque<PresentedFrame>,
    history: usize,
    frames_presented: u64,
}

impl HeadlessDevice {
    /// A device with the given memory budget in bytes.
    pub fn new(budget: u64) -> Self {
        Self {
            next_id: 1,
            resources: HashMap::new(),
            budget,
            allocated: 0,
            pending: PresentedFrame::default(),
            presented: VecDeque::with_capacity(DEFAULT_FRAME_HISTORY),
            history: DEFAULT_FRAME_HISTORY,
            frames_presented: 0,
        }
    }

    /// Keep at most `frames` presented frames.
    pub fn with_history(mut self, frames: usize) -> Self {
        self.history = frames;
        while self.presented.len() > frames {
            self.presented.pop_front();
        }
        self
    }

    /// Bytes currently allocated.
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated
    }

    /// Number of live resources.
    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    /// The most recently presented frames, oldest first.
    pub fn presented(&self) -> &VecDeque<PresentedFrame> {
        &self.presented
    }

    /// The last presented frame, if any is kept.
    pub fn last_presented(&self) -> Option<&PresentedFrame> {
        self.presented.back()
    }

    /// Calls submitted since the last present.
    pub fn pending_calls(&self) -> &[DrawCall] {
        &self.pending.calls
    }

    /// Frames presented over the device's lifetime.
    pub fn frames_presented(&self) -> u64 {
        self.frames_presented
    }

    fn allocate(&mut self, stored: Stored) -> Result<DeviceId, DeviceError> {
        let requested = stored.bytes();
        let available = self.budget.saturating_sub(self.allocated);
        if requested > available {
            return Err(DeviceError::OutOfMemory {
                requested,
                available,
            });
        }
        let id = self.next_id;
        self.next_id += 1;
        self.allocated += requested;
        self.resources.insert(id, stored);
        Ok(id)
    }

    fn buffer(&self, id: DeviceId) -> Result<&Vec<u8>, DeviceError> {
        match self.resources.get(&id) {
            Some(Stored::Buffer(bytes)) => Ok(bytes),
            _ => Err(DeviceError::UnknownResource { id }),
        }
    }
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new(DEFAULT_MEMORY_BUDGET)
    }
}

fn range(offset: u64, len: u64, size: u64) -> Result<std::ops::Range<usize>, DeviceError> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(offset as usize..end as usize),
        _ => Err(DeviceError::OutOfBounds { offset, len, size }),
    }
}

impl RenderDevice for HeadlessDevice {
    fn name(&self) -> &str {
        "headless"
    }

    fn create_buffer(&mut self, size: u64) -> Result<DeviceId, DeviceError> {
        let available = self.budget.saturating_sub(self.allocated);
        if size > available {
            return Err(DeviceError::OutOfMemory {
                requested: size,
                available,
            });
        }
        self.allocate(Stored::Buffer(vec![0; size as usize]))
    }

    fn write_buffer(&mut self, id: DeviceId, offset: u64, data: &[u8]) -> Result<(), DeviceError> {
        let Some(Stored::Buffer(bytes)) = self.resources.get_mut(&id) else {
            return Err(DeviceError::UnknownResource { id });
        };
        let r = range(offset, data.len() as u64, bytes.len() as u64)?;
        bytes[r].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, id: DeviceId, offset: u64, len: u64) -> Result<Vec<u8>, DeviceError> {
        let bytes = self.buffer(id)?;
        let r = range(offset, len, bytes.len() as u64)?;
        Ok(bytes[r].to_vec())
    }

    fn create_texture(
        &mut self,
        desc: &TextureDesc,
        pixels: Option<&[u8]>,
    ) -> Result<DeviceId, DeviceError> {
        let len = desc.byte_len();
        let available = self.budget.saturating_sub(self.allocated);
        if len > available {
            return Err(DeviceError::OutOfMemory {
                requested: len,
                available,
            });
        }
        let texels = match pixels {
            Some(p) => p.to_vec(),
            None => vec![0; len as usize],
        };
        self.allocate(Stored::Texture(texels))
    }

    fn create_shader(&mut self, desc: &ShaderDesc) -> Result<DeviceId, DeviceError> {
        for entry in [&desc.vertex_entry, &desc.fragment_entry] {
            if !desc.source.contains(entry.as_str()) {
                return Err(DeviceError::ShaderRejected {
                    label: desc.label.clone(),
                    reason: format!("entry point '{entry}' not found in source"),
                });
            }
        }
        self.allocate(Stored::Shader)
    }

    fn destroy(&mut self, id: DeviceId) {
        if let Some(stored) = self.resources.remove(&id) {
            self.allocated -= stored.bytes();
        }
    }

    fn submit(&mut self, call: &DrawCall) -> Result<(), DeviceError> {
        if self.pending.calls.len() < MAX_RECORDED_CALLS {
            self.pending.calls.push(call.clone());
        } else {
            self.pending.calls_dropped += 1;
        }
        Ok(())
    }

    fn present(&mut self, frame: &FrameStats) -> Result<(), DeviceError> {
        trace!(
            frame = frame.frame,
            draw_calls = frame.draw_calls,
            recorded = self.pending.calls.len(),
            "headless frame presented"
        );
        let mut finished = std::mem::take(&mut self.pending);
        finished.stats = *frame;
        self.frames_presented += 1;
        if self.history == 0 {
            return Ok(());
        }
        if self.presented.len() == self.history {
            self.presented.pop_front();
        }
        self.presented.push_back(finished);
        Ok(())
    }
}
