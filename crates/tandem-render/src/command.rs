//! Render commands and the descriptors they carry.
//!
//! Every call on [`RenderContext`](crate::RenderContext) becomes one
//! [`RenderCommand`]. Buffer and texture contents are copied into an owned
//! `Vec<u8>` when the command is built, so producers may reuse their memory
//! as soon as the call returns.

use serde::{Deserialize, Serialize};
use tandem_queue::callback::ConsumerCallback;
use tandem_queue::consumer::Opcode;
use tandem_queue::handle::Handle;

// ---------------------------------------------------------------------------
// Vertex
// ---------------------------------------------------------------------------

/// A 2D vertex with an RGBA color, laid out for direct upload.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
pub struct Vertex {
    /// Position in clip space.
    pub position: [f32; 2],
    /// RGBA color, each channel in `0.0..=1.0`.
    pub color: [f32; 4],
}

impl Vertex {
    /// Size of one vertex in bytes; the stride shaders should declare.
    pub const STRIDE: u32 = std::mem::size_of::<Vertex>() as u32;

    /// Construct a vertex.
    pub const fn new(position: [f32; 2], color: [f32; 4]) -> Self {
        Self { position, color }
    }
}

// ---------------------------------------------------------------------------
// Descriptors
// ---------------------------------------------------------------------------

/// What a buffer may be bound as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferUsage {
    /// Per-vertex data.
    Vertex,
    /// 16 or 32 bit indices.
    Index,
    /// Shader constants.
    Uniform,
}

/// Parameters of a new buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferDesc {
    /// Binding role.
    pub usage: BufferUsage,
    /// Size in bytes. Must be non-zero.
    pub size: u64,
}

/// Pixel layout of a texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextureFormat {
    /// 8-bit RGBA.
    #[default]
    Rgba8,
    /// Single 8-bit channel.
    R8,
    /// 32-bit float depth.
    Depth32,
}

impl TextureFormat {
    /// Bytes per texel.
    pub fn bytes_per_pixel(self) -> u64 {
        match self {
            TextureFormat::Rgba8 | TextureFormat::Depth32 => 4,
            TextureFormat::R8 => 1,
        }
    }
}

/// Parameters of a new texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextureDesc {
    /// Width in texels.
    pub width: u32,
    /// Height in texels.
    pub height: u32,
    /// Texel format.
    #[serde(default)]
    pub format: TextureFormat,
}

impl TextureDesc {
    /// Size of the full texture in bytes.
    pub fn byte_len(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height) * self.format.bytes_per_pixel()
    }
}

/// A shader program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShaderDesc {
    /// Debug label.
    pub label: String,
    /// Shader source text.
    pub source: String,
    /// Vertex stage entry point.
    pub vertex_entry: String,
    /// Fragment stage entry point.
    pub fragment_entry: String,
    /// Bytes per vertex the program reads from the bound vertex buffer.
    pub vertex_stride: u32,
}

/// Width of the indices in an index buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexFormat {
    /// `u16` indices.
    U16,
    /// `u32` indices.
    U32,
}

impl IndexFormat {
    /// Bytes per index.
    pub fn size(self) -> u64 {
        match self {
            IndexFormat::U16 => 2,
            IndexFormat::U32 => 4,
        }
    }
}

/// Target rectangle in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Viewport {
    /// Left edge.
    pub x: f32,
    /// Top edge.
    pub y: f32,
    /// Width; must be positive.
    pub width: f32,
    /// Height; must be positive.
    pub height: f32,
}

/// Linear RGBA color.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Color {
    /// Red.
    pub r: f32,
    /// Green.
    pub g: f32,
    /// Blue.
    pub b: f32,
    /// Alpha.
    pub a: f32,
}

impl Color {
    /// Opaque black.
    pub const BLACK: Color = Color::rgba(0.0, 0.0, 0.0, 1.0);

    /// Construct from channels.
    pub const fn rgba(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }
}

// ---------------------------------------------------------------------------
// RenderCommand
// ---------------------------------------------------------------------------

/// Upper bound on the in-queue size of a [`RenderCommand`].
pub const MAX_COMMAND_BYTES: usize = 64;

const _: () = assert!(std::mem::size_of::<RenderCommand>() <= MAX_COMMAND_BYTES);

/// Number of texture binding slots.
pub const TEXTURE_SLOTS: u32 = 8;

/// One deferred operation on the render device.
#[derive(Debug)]
pub enum RenderCommand {
    /// Create a buffer under a pre-reserved handle.
    CreateBuffer {
        /// Reserved handle.
        handle: Handle,
        /// Buffer parameters.
        desc: BufferDesc,
        /// Initial contents, at most `desc.size` bytes.
        contents: Option<Vec<u8>>,
    },
    /// Overwrite part of a buffer.
    UpdateBuffer {
        /// Target buffer.
        buffer: Handle,
        /// Byte offset into the buffer.
        offset: u64,
        /// New bytes.
        data: Vec<u8>,
    },
    /// Create a texture under a pre-reserved handle.
    CreateTexture {
        /// Reserved handle.
        handle: Handle,
        /// Texture parameters.
        desc: TextureDesc,
        /// Initial texels; exactly `desc.byte_len()` bytes when present.
        pixels: Option<Vec<u8>>,
    },
    /// Compile a shader under a pre-reserved handle.
    CreateShader {
        /// Reserved handle.
        handle: Handle,
        /// Program description.
        desc: Box<ShaderDesc>,
    },
    /// Set the target rectangle for subsequent draws.
    SetViewport {
        /// New viewport.
        viewport: Viewport,
    },
    /// Clear the current frame.
    Clear {
        /// Clear color.
        color: Color,
    },
    /// Bind the vertex buffer used by draws.
    BindVertexBuffer {
        /// Buffer with [`BufferUsage::Vertex`].
        buffer: Handle,
    },
    /// Bind the index buffer used by indexed draws.
    BindIndexBuffer {
        /// Buffer with [`BufferUsage::Index`].
        buffer: Handle,
        /// Index width.
        format: IndexFormat,
    },
    /// Bind the shader used by draws.
    BindShader {
        /// Shader handle.
        shader: Handle,
    },
    /// Bind a texture to a slot.
    BindTexture {
        /// Slot, below [`TEXTURE_SLOTS`].
        slot: u32,
        /// Texture handle.
        texture: Handle,
    },
    /// Draw non-indexed vertices.
    Draw {
        /// First vertex.
        first_vertex: u32,
        /// Number of vertices.
        vertex_count: u32,
    },
    /// Draw through the bound index buffer.
    DrawIndexed {
        /// First index.
        first_index: u32,
        /// Number of indices.
        index_count: u32,
    },
    /// Finish the frame and hand it to the device.
    Present,
    /// Copy bytes out of a buffer, delivered to `callback`.
    ReadBuffer {
        /// Source buffer.
        buffer: Handle,
        /// Byte offset.
        offset: u64,
        /// Number of bytes.
        len: u64,
        /// Receives the bytes, or `None` if the read is invalid.
        callback: ConsumerCallback<Option<Vec<u8>>>,
    },
    /// Destroy the resource behind `handle` and free the handle.
    Release {
        /// Handle to release.
        handle: Handle,
    },
}

impl Opcode for RenderCommand {
    fn opcode(&self) -> &'static str {
        match self {
            RenderCommand::CreateBuffer { .. } => "create_buffer",
            RenderCommand::UpdateBuffer { .. } => "update_buffer",
            RenderCommand::CreateTexture { .. } => "create_texture",
            RenderCommand::CreateShader { .. } => "create_shader",
            RenderCommand::SetViewport { .. } => "set_viewport",
            RenderCommand::Clear { .. } => "clear",
            RenderCommand::BindVertexBuffer { .. } => "bind_vertex_buffer",
            RenderCommand::BindIndexBuffer { .. } => "bind_index_buffer",
            RenderCommand::BindShader { .. } => "bind_shader",
            RenderCommand::BindTexture { .. } => "bind_texture",
            RenderCommand::Draw { .. } => "draw",
            RenderCommand::DrawIndexed { .. } => "draw_indexed",
            RenderCommand::Present => "present",
            RenderCommand::ReadBuffer { .. } => "read_buffer",
            RenderCommand::Release { .. } => "release",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_is_tightly_packed() {
        assert_eq!(Vertex::STRIDE, 24);
        let verts = [
            Vertex::new([0.0, 0.0], [1.0; 4]),
            Vertex::new([1.0, 0.0], [1.0; 4]),
        ];
        let bytes: &[u8] = bytemuck::cast_slice(&verts);
        assert_eq!(bytes.len(), 48);
    }

    #[test]
    fn texture_byte_len() {
        let desc = TextureDesc {
            width: 4,
            height: 2,
            format: TextureFormat::Rgba8,
        };
        assert_eq!(desc.byte_len(), 32);
        let r8 = TextureDesc {
            format: TextureFormat::R8,
            ..desc
        };
        assert_eq!(r8.byte_len(), 8);
    }

    #[test]
    fn opcodes_are_distinct() {
        let cmds = [
            RenderCommand::Present,
            RenderCommand::Clear {
                color: Color::BLACK,
            },
            RenderCommand::Draw {
                first_vertex: 0,
                vertex_count: 3,
            },
            RenderCommand::Release {
                handle: Handle::INVALID,
            },
        ];
        let mut names: Vec<_> = cmds.iter().map(Opcode::opcode).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), cmds.len());
    }
}
