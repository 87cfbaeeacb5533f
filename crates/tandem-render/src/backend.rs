//! The consumer-owned render state.
//!
//! [`RenderBackend`] wraps a [`RenderDevice`] and applies [`RenderCommand`]s
//! to it on the render consumer thread. It owns the handle table that maps
//! producer handles to device resources, tracks the current bindings and
//! validates every draw before the device sees it. `Present` publishes the
//! frame's counters to a [`FrameReadback`] shared with producers.

use std::sync::Arc;

use parking_lot::Mutex;
use tandem_queue::consumer::Backend;
use tandem_queue::handle::{Handle, HandleAllocator, HandleTable};
use tandem_queue::CommandError;
use tracing::debug;

use crate::command::{
    BufferDesc, BufferUsage, Color, IndexFormat, RenderCommand, ShaderDesc, TextureDesc, Viewport,
    TEXTURE_SLOTS,
};
use crate::device::{DeviceError, DeviceId, DrawBindings, DrawCall, FrameStats, RenderDevice};

/// Name reported in logs and diagnostics.
pub const RENDER_BACKEND_NAME: &str = "render";

// ---------------------------------------------------------------------------
// FrameReadback
// ---------------------------------------------------------------------------

/// Shared slot holding the stats of the last presented frame.
#[derive(Debug, Clone, Default)]
pub struct FrameReadback {
    latest: Arc<Mutex<FrameStats>>,
}

impl FrameReadback {
    /// A readback with no frame presented.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stats of the last presented frame.
    pub fn load(&self) -> FrameStats {
        *self.latest.lock()
    }

    fn publish(&self, stats: FrameStats) {
        *self.latest.lock() = stats;
    }
}

// ---------------------------------------------------------------------------
// Resources and bindings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum Resource {
    Buffer { id: DeviceId, usage: BufferUsage, size: u64 },
    Texture { id: DeviceId },
    Shader { id: DeviceId, stride: u32 },
}

impl Resource {
    fn device_id(&self) -> DeviceId {
        match *self {
            Resource::Buffer { id, .. } | Resource::Texture { id } | Resource::Shader { id, .. } => {
                id
            }
        }
    }
}

#[derive(Debug, Default)]
struct Bindings {
    vertex: Option<Handle>,
    index: Option<(Handle, IndexFormat)>,
    shader: Option<Handle>,
    textures: [Option<Handle>; TEXTURE_SLOTS as usize],
}

impl Bindings {
    fn unbind(&mut self, handle: Handle) {
        if self.vertex == Some(handle) {
            self.vertex = None;
        }
        if matches!(self.index, Some((h, _)) if h == handle) {
            self.index = None;
        }
        if self.shader == Some(handle) {
            self.shader = None;
        }
        for slot in &mut self.textures {
            if *slot == Some(handle) {
                *slot = None;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// RenderBackend
// ---------------------------------------------------------------------------

/// Render state owned by the render consumer.
pub struct RenderBackend<D> {
    device: D,
    resources: HandleTable<Resource>,
    bindings: Bindings,
    frame: FrameStats,
    frames: u64,
    ticks: u64,
    readback: FrameReadback,
}

impl<D: RenderDevice> RenderBackend<D> {
    /// Wrap `device`. `allocator` must be the one producers reserve from.
    pub fn new(device: D, allocator: Arc<HandleAllocator>, readback: FrameReadback) -> Self {
        Self {
            device,
            resources: HandleTable::new(allocator),
            bindings: Bindings::default(),
            frame: FrameStats::default(),
            frames: 0,
            ticks: 0,
            readback,
        }
    }

    /// The wrapped device.
    pub fn device(&self) -> &D {
        &self.device
    }

    /// Number of live buffers, textures and shaders.
    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    /// Whether `handle` names a live resource.
    pub fn has_resource(&self, handle: Handle) -> bool {
        self.resources.contains(handle)
    }

    /// Frames presented so far.
    pub fn frames_presented(&self) -> u64 {
        self.frames
    }

    /// Counters of the frame being recorded.
    pub fn current_frame(&self) -> &FrameStats {
        &self.frame
    }

    // -- creation -------------------------------------------------------------

    fn ensure_free(&self, handle: Handle) -> Result<(), CommandError> {
        if self.resources.contains(handle) {
            return Err(CommandError::HandleOccupied { handle });
        }
        if !self.resources.allocator().is_live(handle) {
            return Err(CommandError::StaleHandle { handle });
        }
        Ok(())
    }

    fn bind_new(&mut self, handle: Handle, resource: Resource) -> Result<(), CommandError> {
        if let Err(e) = self.resources.insert(handle, resource) {
            self.device.destroy(resource.device_id());
            return Err(e.into());
        }
        Ok(())
    }

    fn create_buffer(
        &mut self,
        handle: Handle,
        desc: BufferDesc,
        contents: Option<Vec<u8>>,
    ) -> Result<(), CommandError> {
        const OP: &str = "create_buffer";
        self.ensure_free(handle)?;
        if desc.size == 0 {
            return Err(invalid(OP, "buffer size must be non-zero"));
        }
        if let Some(bytes) = &contents {
            if bytes.len() as u64 > desc.size {
                return Err(invalid(
                    OP,
                    format!("{} initial bytes exceed size {}", bytes.len(), desc.size),
                ));
            }
        }
        let id = self.device.create_buffer(desc.size).map_err(device(OP))?;
        if let Some(bytes) = contents {
            if let Err(e) = self.device.write_buffer(id, 0, &bytes) {
                self.device.destroy(id);
                return Err(device(OP)(e));
            }
        }
        self.bind_new(
            handle,
            Resource::Buffer {
                id,
                usage: desc.usage,
                size: desc.size,
            },
        )
    }

    fn create_texture(
        &mut self,
        handle: Handle,
        desc: TextureDesc,
        pixels: Option<Vec<u8>>,
    ) -> Result<(), CommandError> {
        const OP: &str = "create_texture";
        self.ensure_free(handle)?;
        if desc.width == 0 || desc.height == 0 {
            return Err(invalid(OP, "texture dimensions must be non-zero"));
        }
        if let Some(p) = &pixels {
            if p.len() as u64 != desc.byte_len() {
                return Err(invalid(
                    OP,
                    format!("expected {} texel bytes, got {}", desc.byte_len(), p.len()),
                ));
            }
        }
        let id = self
            .device
            .create_texture(&desc, pixels.as_deref())
            .map_err(device(OP))?;
        self.bind_new(handle, Resource::Texture { id })
    }

    fn create_shader(&mut self, handle: Handle, desc: &ShaderDesc) -> Result<(), CommandError> {
        const OP: &str = "create_shader";
        self.ensure_free(handle)?;
        if desc.vertex_stride == 0 {
            return Err(invalid(OP, "vertex stride must be non-zero"));
        }
        if desc.vertex_entry.is_empty() || desc.fragment_entry.is_empty() {
            return Err(invalid(OP, "entry points must be named"));
        }
        let id = self.device.create_shader(desc).map_err(device(OP))?;
        self.bind_new(
            handle,
            Resource::Shader {
                id,
                stride: desc.vertex_stride,
            },
        )
    }

    fn release(&mut self, handle: Handle) -> Result<(), CommandError> {
        match self.resources.release(handle) {
            (Some(resource), _) => {
                self.bindings.unbind(handle);
                self.device.destroy(resource.device_id());
                Ok(())
            }
            // A creation that failed still holds its reservation.
            (None, true) => Ok(()),
            (None, false) => Err(CommandError::StaleHandle { handle }),
        }
    }

    // -- lookup ---------------------------------------------------------------

    fn resource(&self, handle: Handle) -> Result<Resource, CommandError> {
        self.resources
            .get(handle)
            .copied()
            .ok_or(CommandError::StaleHandle { handle })
    }

    fn buffer(&self, opcode: &'static str, handle: Handle) -> Result<(DeviceId, u64), CommandError> {
        match self.resource(handle)? {
            Resource::Buffer { id, size, .. } => Ok((id, size)),
            _ => Err(invalid(opcode, "handle is not a buffer")),
        }
    }

    fn buffer_with_usage(
        &self,
        opcode: &'static str,
        handle: Handle,
        wanted: BufferUsage,
    ) -> Result<u64, CommandError> {
        match self.resource(handle)? {
            Resource::Buffer { usage, size, .. } if usage == wanted => Ok(size),
            Resource::Buffer { usage, .. } => Err(invalid(
                opcode,
                format!("buffer usage is {usage:?}, expected {wanted:?}"),
            )),
            _ => Err(invalid(opcode, "handle is not a buffer")),
        }
    }

    // -- drawing --------------------------------------------------------------

    /// Stride of the bound shader, size of the bound vertex buffer and the
    /// device resources a draw reads.
    fn draw_state(&self, opcode: &'static str) -> Result<(u32, u64, DrawBindings), CommandError> {
        let shader = self
            .bindings
            .shader
            .ok_or_else(|| invalid(opcode, "no shader bound"))?;
        let (shader_id, stride) = match self.resource(shader)? {
            Resource::Shader { id, stride } => (id, stride),
            _ => return Err(invalid(opcode, "bound shader is not a shader")),
        };
        let vertex = self
            .bindings
            .vertex
            .ok_or_else(|| invalid(opcode, "no vertex buffer bound"))?;
        let size = self.buffer_with_usage(opcode, vertex, BufferUsage::Vertex)?;

        let mut textures = [None; TEXTURE_SLOTS as usize];
        for (slot, bound) in textures.iter_mut().zip(&self.bindings.textures) {
            if let Some(texture) = bound {
                *slot = Some(self.resource(*texture)?.device_id());
            }
        }
        let bindings = DrawBindings {
            shader: shader_id,
            vertex: self.resource(vertex)?.device_id(),
            index: None,
            textures,
        };
        Ok((stride, size, bindings))
    }

    fn draw(&mut self, first_vertex: u32, vertex_count: u32) -> Result<(), CommandError> {
        const OP: &str = "draw";
        if vertex_count == 0 {
            return Err(invalid(OP, "vertex count must be non-zero"));
        }
        let (stride, size, bindings) = self.draw_state(OP)?;
        let end = (u64::from(first_vertex) + u64::from(vertex_count)).saturating_mul(u64::from(stride));
        if end > size {
            return Err(invalid(
                OP,
                format!("vertices {first_vertex}+{vertex_count} read {end} bytes from a {size} byte buffer"),
            ));
        }
        self.device
            .submit(&DrawCall::Draw {
                bindings,
                first_vertex,
                vertex_count,
            })
            .map_err(device(OP))?;
        self.frame.draw_calls += 1;
        self.frame.vertices += u64::from(vertex_count);
        Ok(())
    }

    fn draw_indexed(&mut self, first_index: u32, index_count: u32) -> Result<(), CommandError> {
        const OP: &str = "draw_indexed";
        if index_count == 0 {
            return Err(invalid(OP, "index count must be non-zero"));
        }
        let (_, _, mut bindings) = self.draw_state(OP)?;
        let (index, format) = self
            .bindings
            .index
            .ok_or_else(|| invalid(OP, "no index buffer bound"))?;
        let size = self.buffer_with_usage(OP, index, BufferUsage::Index)?;
        let end = (u64::from(first_index) + u64::from(index_count)).saturating_mul(format.size());
        if end > size {
            return Err(invalid(
                OP,
                format!("indices {first_index}+{index_count} read {end} bytes from a {size} byte buffer"),
            ));
        }
        bindings.index = Some((self.resource(index)?.device_id(), format));
        self.device
            .submit(&DrawCall::DrawIndexed {
                bindings,
                first_index,
                index_count,
            })
            .map_err(device(OP))?;
        self.frame.draw_calls += 1;
        self.frame.indices += u64::from(index_count);
        Ok(())
    }

    fn present(&mut self) -> Result<(), CommandError> {
        let next = FrameStats {
            viewport: self.frame.viewport,
            ..Default::default()
        };
        let mut finished = std::mem::replace(&mut self.frame, next);
        self.frames += 1;
        finished.frame = self.frames;
        let result = self.device.present(&finished).map_err(device("present"));
        self.readback.publish(finished);
        result
    }
}

impl<D: RenderDevice> Backend for RenderBackend<D> {
    type Command = RenderCommand;

    fn name(&self) -> &str {
        RENDER_BACKEND_NAME
    }

    fn apply(&mut self, command: RenderCommand) -> Result<(), CommandError> {
        match command {
            RenderCommand::CreateBuffer {
                handle,
                desc,
                contents,
            } => self.create_buffer(handle, desc, contents),
            RenderCommand::UpdateBuffer {
                buffer,
                offset,
                data,
            } => {
                let (id, _) = self.buffer("update_buffer", buffer)?;
                self.device
                    .write_buffer(id, offset, &data)
                    .map_err(device("update_buffer"))
            }
            RenderCommand::CreateTexture {
                handle,
                desc,
                pixels,
            } => self.create_texture(handle, desc, pixels),
            RenderCommand::CreateShader { handle, desc } => self.create_shader(handle, &desc),
            RenderCommand::SetViewport { viewport } => {
                check_viewport(&viewport)?;
                self.device
                    .submit(&DrawCall::SetViewport { viewport })
                    .map_err(device("set_viewport"))?;
                self.frame.viewport = viewport;
                Ok(())
            }
            RenderCommand::Clear { color } => {
                check_color(&color)?;
                self.device
                    .submit(&DrawCall::Clear { color })
                    .map_err(device("clear"))?;
                self.frame.clears += 1;
                Ok(())
            }
            RenderCommand::BindVertexBuffer { buffer } => {
                self.buffer_with_usage("bind_vertex_buffer", buffer, BufferUsage::Vertex)?;
                self.bindings.vertex = Some(buffer);
                Ok(())
            }
            RenderCommand::BindIndexBuffer { buffer, format } => {
                self.buffer_with_usage("bind_index_buffer", buffer, BufferUsage::Index)?;
                self.bindings.index = Some((buffer, format));
                Ok(())
            }
            RenderCommand::BindShader { shader } => match self.resource(shader)? {
                Resource::Shader { .. } => {
                    self.bindings.shader = Some(shader);
                    Ok(())
                }
                _ => Err(invalid("bind_shader", "handle is not a shader")),
            },
            RenderCommand::BindTexture { slot, texture } => {
                if slot >= TEXTURE_SLOTS {
                    return Err(invalid(
                        "bind_texture",
                        format!("slot {slot} out of range (0..{TEXTURE_SLOTS})"),
                    ));
                }
                match self.resource(texture)? {
                    Resource::Texture { .. } => {
                        self.bindings.textures[slot as usize] = Some(texture);
                        Ok(())
                    }
                    _ => Err(invalid("bind_texture", "handle is not a texture")),
                }
            }
            RenderCommand::Draw {
                first_vertex,
                vertex_count,
            } => self.draw(first_vertex, vertex_count),
            RenderCommand::DrawIndexed {
                first_index,
                index_count,
            } => self.draw_indexed(first_index, index_count),
            RenderCommand::Present => self.present(),
            RenderCommand::ReadBuffer {
                buffer,
                offset,
                len,
                callback,
            } => {
                let read = self
                    .buffer("read_buffer", buffer)
                    .and_then(|(id, _)| {
                        self.device
                            .read_buffer(id, offset, len)
                            .map_err(device("read_buffer"))
                    });
                match read {
                    Ok(bytes) => {
                        callback.invoke(&Some(bytes));
                        Ok(())
                    }
                    Err(e) => {
                        callback.invoke(&None);
                        Err(e)
                    }
                }
            }
            RenderCommand::Release { handle } => self.release(handle),
        }
    }

    fn step(&mut self) {
        self.ticks += 1;
    }

    fn shutdown(&mut self) {
        let ids: Vec<DeviceId> = self.resources.iter().map(|(_, r)| r.device_id()).collect();
        for id in &ids {
            self.device.destroy(*id);
        }
        debug!(
            device = self.device.name(),
            resources = ids.len(),
            frames = self.frames,
            ticks = self.ticks,
            "render backend shut down"
        );
    }
}

// ---------------------------------------------------------------------------
// Validation helpers
// ---------------------------------------------------------------------------

fn invalid(opcode: &'static str, reason: impl Into<String>) -> CommandError {
    CommandError::InvalidParams {
        opcode,
        reason: reason.into(),
    }
}

fn device(opcode: &'static str) -> impl Fn(DeviceError) -> CommandError {
    move |e| invalid(opcode, e.to_string())
}

fn check_viewport(v: &Viewport) -> Result<(), CommandError> {
    let finite = [v.x, v.y, v.width, v.height].iter().all(|c| c.is_finite());
    if !finite || v.width <= 0.0 || v.height <= 0.0 {
        return Err(invalid(
            "set_viewport",
            format!("viewport must be finite with positive size, got {v:?}"),
        ));
    }
    Ok(())
}

fn check_color(c: &Color) -> Result<(), CommandError> {
    if [c.r, c.g, c.b, c.a].iter().all(|x| x.is_finite()) {
        Ok(())
    } else {
        Err(invalid("clear", format!("color must be finite, got {c:?}")))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{TextureFormat, Vertex};
    use crate::device::HeadlessDevice;
    use tandem_queue::callback::ConsumerCallback;

    struct Fixture {
        backend: RenderBackend<HeadlessDevice>,
        allocator: Arc<HandleAllocator>,
        readback: FrameReadback,
    }

    fn fixture() -> Fixture {
        let allocator = Arc::new(HandleAllocator::new(64));
        let readback = FrameReadback::new();
        Fixture {
            backend: RenderBackend::new(
                HeadlessDevice::default(),
                Arc::clone(&allocator),
                readback.clone(),
            ),
            allocator,
            readback,
        }
    }

    impl Fixture {
        fn apply(&mut self, cmd: RenderCommand) -> Result<(), CommandError> {
            self.backend.apply(cmd)
        }

        fn buffer(&mut self, usage: BufferUsage, size: u64) -> Handle {
            let handle = self.allocator.reserve().unwrap();
            self.apply(RenderCommand::CreateBuffer {
                handle,
                desc: BufferDesc { usage, size },
                contents: None,
            })
            .unwrap();
            handle
        }

        fn shader(&mut self) -> Handle {
            let handle = self.allocator.reserve().unwrap();
            self.apply(RenderCommand::CreateShader {
                handle,
                desc: Box::new(flat_shader()),
            })
            .unwrap();
            handle
        }

        /// Shader plus a three-vertex buffer, both bound.
        fn ready_to_draw(&mut self) -> (Handle, Handle) {
            let shader = self.shader();
            let vb = self.buffer(BufferUsage::Vertex, 3 * u64::from(Vertex::STRIDE));
            self.apply(RenderCommand::BindShader { shader }).unwrap();
            self.apply(RenderCommand::BindVertexBuffer { buffer: vb })
                .unwrap();
            (shader, vb)
        }
    }

    fn flat_shader() -> ShaderDesc {
        ShaderDesc {
            label: "flat".into(),
            source: "fn vs_main() {} fn fs_main() {}".into(),
            vertex_entry: "vs_main".into(),
            fragment_entry: "fs_main".into(),
            vertex_stride: Vertex::STRIDE,
        }
    }

    #[test]
    fn create_and_release_buffer() {
        let mut f = fixture();
        let h = f.buffer(BufferUsage::Vertex, 64);
        assert!(f.backend.has_resource(h));
        assert_eq!(f.backend.device().resource_count(), 1);

        f.apply(RenderCommand::Release { handle: h }).unwrap();
        assert!(!f.backend.has_resource(h));
        assert_eq!(f.backend.device().resource_count(), 0);
        assert!(!f.allocator.is_live(h));
    }

    #[test]
    fn update_after_release_is_stale() {
        let mut f = fixture();
        let h = f.buffer(BufferUsage::Uniform, 16);
        f.apply(RenderCommand::Release { handle: h }).unwrap();
        assert_eq!(
            f.apply(RenderCommand::UpdateBuffer {
                buffer: h,
                offset: 0,
                data: vec![1, 2],
            }),
            Err(CommandError::StaleHandle { handle: h })
        );
        assert_eq!(
            f.apply(RenderCommand::Release { handle: h }),
            Err(CommandError::StaleHandle { handle: h })
        );
    }

    #[test]
    fn initial_contents_are_uploaded() {
        let mut f = fixture();
        let handle = f.allocator.reserve().unwrap();
        f.apply(RenderCommand::CreateBuffer {
            handle,
            desc: BufferDesc {
                usage: BufferUsage::Index,
                size: 4,
            },
            contents: Some(vec![9, 8]),
        })
        .unwrap();

        let (cb, rx) = ConsumerCallback::channel();
        f.apply(RenderCommand::ReadBuffer {
            buffer: handle,
            offset: 0,
            len: 4,
            callback: cb,
        })
        .unwrap();
        assert_eq!(rx.try_recv().unwrap(), Some(vec![9, 8, 0, 0]));
    }

    #[test]
    fn oversized_contents_are_rejected_without_allocating() {
        let mut f = fixture();
        let handle = f.allocator.reserve().unwrap();
        let err = f
            .apply(RenderCommand::CreateBuffer {
                handle,
                desc: BufferDesc {
                    usage: BufferUsage::Vertex,
                    size: 2,
                },
                contents: Some(vec![0; 3]),
            })
            .unwrap_err();
        assert!(matches!(err, CommandError::InvalidParams { opcode: "create_buffer", .. }));
        assert_eq!(f.backend.device().resource_count(), 0);
        // Reservation survives until released.
        assert!(f.allocator.is_live(handle));
        f.apply(RenderCommand::Release { handle }).unwrap();
        assert!(!f.allocator.is_live(handle));
    }

    #[test]
    fn duplicate_creation_is_occupied() {
        let mut f = fixture();
        let h = f.buffer(BufferUsage::Vertex, 8);
        assert_eq!(
            f.apply(RenderCommand::CreateBuffer {
                handle: h,
                desc: BufferDesc {
                    usage: BufferUsage::Vertex,
                    size: 8,
                },
                contents: None,
            }),
            Err(CommandError::HandleOccupied { handle: h })
        );
        assert_eq!(f.backend.device().resource_count(), 1);
    }

    #[test]
    fn draw_requires_bindings_and_range() {
        let mut f = fixture();
        let draw = |first, count| RenderCommand::Draw {
            first_vertex: first,
            vertex_count: count,
        };
        assert!(f.apply(draw(0, 3)).is_err(), "nothing bound");

        f.ready_to_draw();
        f.apply(draw(0, 3)).unwrap();
        assert!(f.apply(draw(1, 3)).is_err(), "reads past the end");
        assert!(f.apply(draw(0, 0)).is_err());
        assert_eq!(f.backend.current_frame().draw_calls, 1);
        assert_eq!(f.backend.current_frame().vertices, 3);
    }

    #[test]
    fn release_unbinds() {
        let mut f = fixture();
        let (_, vb) = f.ready_to_draw();
        f.apply(RenderCommand::Release { handle: vb }).unwrap();
        let err = f
            .apply(RenderCommand::Draw {
                first_vertex: 0,
                vertex_count: 3,
            })
            .unwrap_err();
        assert_eq!(
            err,
            CommandError::InvalidParams {
                opcode: "draw",
                reason: "no vertex buffer bound".into()
            }
        );
    }

    #[test]
    fn binding_wrong_usage_fails() {
        let mut f = fixture();
        let ib = f.buffer(BufferUsage::Index, 12);
        assert!(matches!(
            f.apply(RenderCommand::BindVertexBuffer { buffer: ib }),
            Err(CommandError::InvalidParams { .. })
        ));
        let shader = f.shader();
        assert!(f
            .apply(RenderCommand::BindTexture {
                slot: 0,
                texture: shader
            })
            .is_err());
    }

    #[test]
    fn indexed_draw_checks_index_range() {
        let mut f = fixture();
        f.ready_to_draw();
        let ib = f.buffer(BufferUsage::Index, 6);
        f.apply(RenderCommand::BindIndexBuffer {
            buffer: ib,
            format: IndexFormat::U16,
        })
        .unwrap();
        f.apply(RenderCommand::DrawIndexed {
            first_index: 0,
            index_count: 3,
        })
        .unwrap();
        assert!(f
            .apply(RenderCommand::DrawIndexed {
                first_index: 2,
                index_count: 3,
            })
            .is_err());
        assert_eq!(f.backend.current_frame().indices, 3);
    }

    #[test]
    fn present_publishes_and_resets() {
        let mut f = fixture();
        f.ready_to_draw();
        let viewport = Viewport {
            x: 0.0,
            y: 0.0,
            width: 640.0,
            height: 480.0,
        };
        f.apply(RenderCommand::SetViewport { viewport }).unwrap();
        f.apply(RenderCommand::Clear {
            color: Color::BLACK,
        })
        .unwrap();
        f.apply(RenderCommand::Draw {
            first_vertex: 0,
            vertex_count: 3,
        })
        .unwrap();
        f.apply(RenderCommand::Present).unwrap();

        let stats = f.readback.load();
        assert_eq!(stats.frame, 1);
        assert_eq!(stats.draw_calls, 1);
        assert_eq!(stats.clears, 1);
        assert_eq!(stats.viewport, viewport);
        assert_eq!(f.backend.current_frame().draw_calls, 0);
        assert_eq!(f.backend.current_frame().viewport, viewport);
        assert_eq!(f.backend.device().presented().len(), 1);
    }

    #[test]
    fn device_receives_the_validated_draw_stream() {
        let mut f = fixture();
        let (shader, vb) = f.ready_to_draw();
        let ib = f.buffer(BufferUsage::Index, 6 * 2);
        let texture = f.allocator.reserve().unwrap();
        f.apply(RenderCommand::CreateTexture {
            handle: texture,
            desc: TextureDesc {
                width: 1,
                height: 1,
                format: TextureFormat::Rgba8,
            },
            pixels: None,
        })
        .unwrap();
        let id = |f: &Fixture, h: Handle| f.backend.resources.get(h).unwrap().device_id();
        let (shader_id, vb_id, ib_id, tex_id) =
            (id(&f, shader), id(&f, vb), id(&f, ib), id(&f, texture));

        let viewport = Viewport {
            x: 0.0,
            y: 0.0,
            width: 320.0,
            height: 240.0,
        };
        let red = Color::rgba(1.0, 0.0, 0.0, 1.0);
        f.apply(RenderCommand::SetViewport { viewport }).unwrap();
        f.apply(RenderCommand::Clear { color: red }).unwrap();
        f.apply(RenderCommand::Draw {
            first_vertex: 0,
            vertex_count: 3,
        })
        .unwrap();
        // Rejected: nothing reaches the device.
        assert!(f
            .apply(RenderCommand::Draw {
                first_vertex: 2,
                vertex_count: 3,
            })
            .is_err());
        f.apply(RenderCommand::BindTexture { slot: 2, texture })
            .unwrap();
        f.apply(RenderCommand::BindIndexBuffer {
            buffer: ib,
            format: IndexFormat::U16,
        })
        .unwrap();
        f.apply(RenderCommand::DrawIndexed {
            first_index: 3,
            index_count: 3,
        })
        .unwrap();
        assert_eq!(f.backend.device().pending_calls().len(), 4);
        f.apply(RenderCommand::Present).unwrap();

        let base = DrawBindings {
            shader: shader_id,
            vertex: vb_id,
            ..Default::default()
        };
        let mut textured = base;
        textured.textures[2] = Some(tex_id);
        textured.index = Some((ib_id, IndexFormat::U16));
        let frame = f.backend.device().last_presented().unwrap();
        assert_eq!(
            frame.calls,
            vec![
                DrawCall::SetViewport { viewport },
                DrawCall::Clear { color: red },
                DrawCall::Draw {
                    bindings: base,
                    first_vertex: 0,
                    vertex_count: 3,
                },
                DrawCall::DrawIndexed {
                    bindings: textured,
                    first_index: 3,
                    index_count: 3,
                },
            ]
        );
        assert_eq!(frame.stats.frame, 1);
        assert_eq!(frame.stats.draw_calls, 2);
        assert!(f.backend.device().pending_calls().is_empty());
    }

    #[test]
    fn device_history_stays_bounded() {
        let mut f = fixture();
        for _ in 0..1000 {
            f.apply(RenderCommand::Present).unwrap();
        }
        assert_eq!(
            f.backend.device().presented().len(),
            crate::device::DEFAULT_FRAME_HISTORY
        );
        assert_eq!(f.backend.device().frames_presented(), 1000);
        assert_eq!(f.readback.load().frame, 1000);
    }

    #[test]
    fn invalid_viewport_and_color() {
        let mut f = fixture();
        assert!(f
            .apply(RenderCommand::SetViewport {
                viewport: Viewport::default()
            })
            .is_err());
        assert!(f
            .apply(RenderCommand::Clear {
                color: Color::rgba(f32::NAN, 0.0, 0.0, 1.0)
            })
            .is_err());
    }

    #[test]
    fn texture_pixels_must_match_size() {
        let mut f = fixture();
        let desc = TextureDesc {
            width: 2,
            height: 2,
            format: TextureFormat::R8,
        };
        let bad = f.allocator.reserve().unwrap();
        assert!(f
            .apply(RenderCommand::CreateTexture {
                handle: bad,
                desc,
                pixels: Some(vec![0; 3]),
            })
            .is_err());
        let good = f.allocator.reserve().unwrap();
        f.apply(RenderCommand::CreateTexture {
            handle: good,
            desc,
            pixels: Some(vec![0; 4]),
        })
        .unwrap();
        f.apply(RenderCommand::BindTexture {
            slot: 7,
            texture: good,
        })
        .unwrap();
        assert!(f
            .apply(RenderCommand::BindTexture {
                slot: TEXTURE_SLOTS,
                texture: good,
            })
            .is_err());
    }

    #[test]
    fn bad_read_still_invokes_callback() {
        let mut f = fixture();
        let h = f.buffer(BufferUsage::Uniform, 4);
        let (cb, rx) = ConsumerCallback::channel();
        assert!(f
            .apply(RenderCommand::ReadBuffer {
                buffer: h,
                offset: 2,
                len: 4,
                callback: cb,
            })
            .is_err());
        assert_eq!(rx.try_recv().unwrap(), None);
    }

    #[test]
    fn shutdown_frees_device_resources() {
        let mut f = fixture();
        f.ready_to_draw();
        assert_eq!(f.backend.device().resource_count(), 2);
        f.backend.shutdown();
        assert_eq!(f.backend.device().resource_count(), 0);
        assert_eq!(f.backend.device().allocated_bytes(), 0);
    }

    proptest::proptest! {
        #[test]
        fn draw_accepts_exactly_the_ranges_inside_the_buffer(
            vertices in 1u32..32,
            first in 0u32..40,
            count in 0u32..40,
        ) {
            let mut f = fixture();
            let shader = f.shader();
            let vb = f.buffer(BufferUsage::Vertex, u64::from(vertices * Vertex::STRIDE));
            f.apply(RenderCommand::BindShader { shader }).unwrap();
            f.apply(RenderCommand::BindVertexBuffer { buffer: vb }).unwrap();

            let result = f.apply(RenderCommand::Draw {
                first_vertex: first,
                vertex_count: count,
            });
            let fits = count > 0 && first + count <= vertices;
            proptest::prop_assert_eq!(result.is_ok(), fits);
            f.apply(RenderCommand::Present).unwrap();
            proptest::prop_assert_eq!(f.readback.load().draw_calls, u32::from(fits));
        }
    }
}
