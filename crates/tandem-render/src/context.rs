//! Producer-side render API.
//!
//! [`RenderContext`] turns each call into one [`RenderCommand`]. Draw calls
//! recorded from a game thread are replayed on the render consumer in the
//! same order during its next tick.

use std::sync::Arc;

use bytemuck::Pod;
use tandem_queue::callback::ConsumerCallback;
use tandem_queue::handle::{Handle, HandleAllocator};
use tandem_queue::submit::Submitter;
use tandem_queue::threaded::{BackendInitError, ConsumerThread};
use tandem_queue::SubmitError;
use tandem_sync::job::JobSystem;
use tracing::debug;

use crate::backend::{FrameReadback, RenderBackend, RENDER_BACKEND_NAME};
use crate::command::{
    BufferDesc, BufferUsage, Color, IndexFormat, RenderCommand, ShaderDesc, TextureDesc, Viewport,
};
use crate::device::{FrameStats, HeadlessDevice, RenderDevice};
use crate::{RenderConfig, RenderError};

// ---------------------------------------------------------------------------
// RenderContext
// ---------------------------------------------------------------------------

/// Deferred access to the render device.
#[derive(Debug, Clone)]
pub struct RenderContext {
    submitter: Submitter<RenderCommand>,
    readback: FrameReadback,
}

impl RenderContext {
    /// Wrap a submitter and the frame readback its consumer publishes to.
    pub fn new(submitter: Submitter<RenderCommand>, readback: FrameReadback) -> Self {
        Self {
            submitter,
            readback,
        }
    }

    /// Queue the creation of a zero-filled buffer.
    pub fn create_buffer(&self, desc: BufferDesc) -> Result<Handle, SubmitError> {
        self.submitter
            .submit_create(|handle| RenderCommand::CreateBuffer {
                handle,
                desc,
                contents: None,
            })
    }

    /// Queue the creation of a buffer holding a copy of `data`.
    pub fn create_buffer_from_slice<T: Pod>(
        &self,
        usage: BufferUsage,
        data: &[T],
    ) -> Result<Handle, SubmitError> {
        let bytes: Vec<u8> = bytemuck::cast_slice(data).to_vec();
        let desc = BufferDesc {
            usage,
            size: bytes.len() as u64,
        };
        self.submitter
            .submit_create(|handle| RenderCommand::CreateBuffer {
                handle,
                desc,
                contents: Some(bytes),
            })
    }

    /// Overwrite part of a buffer with a copy of `data`.
    pub fn update_buffer<T: Pod>(
        &self,
        buffer: Handle,
        offset: u64,
        data: &[T],
    ) -> Result<(), SubmitError> {
        self.send(RenderCommand::UpdateBuffer {
            buffer,
            offset,
            data: bytemuck::cast_slice(data).to_vec(),
        })
    }

    /// Queue the creation of a texture.
    pub fn create_texture(
        &self,
        desc: TextureDesc,
        pixels: Option<Vec<u8>>,
    ) -> Result<Handle, SubmitError> {
        self.submitter
            .submit_create(|handle| RenderCommand::CreateTexture {
                handle,
                desc,
                pixels,
            })
    }

    /// Queue the compilation of a shader.
    pub fn create_shader(&self, desc: ShaderDesc) -> Result<Handle, SubmitError> {
        let desc = Box::new(desc);
        self.submitter
            .submit_create(|handle| RenderCommand::CreateShader { handle, desc })
    }

    /// Set the viewport for the following draws.
    pub fn set_viewport(&self, viewport: Viewport) -> Result<(), SubmitError> {
        self.send(RenderCommand::SetViewport { viewport })
    }

    /// Clear the frame.
    pub fn clear(&self, color: Color) -> Result<(), SubmitError> {
        self.send(RenderCommand::Clear { color })
    }

    /// Bind the vertex buffer for the following draws.
    pub fn bind_vertex_buffer(&self, buffer: Handle) -> Result<(), SubmitError> {
        self.send(RenderCommand::BindVertexBuffer { buffer })
    }

    /// Bind the index buffer for the following indexed draws.
    pub fn bind_index_buffer(&self, buffer: Handle, format: IndexFormat) -> Result<(), SubmitError> {
        self.send(RenderCommand::BindIndexBuffer { buffer, format })
    }

    /// Bind the shader for the following draws.
    pub fn bind_shader(&self, shader: Handle) -> Result<(), SubmitError> {
        self.send(RenderCommand::BindShader { shader })
    }

    /// Bind a texture to `slot`.
    pub fn bind_texture(&self, slot: u32, texture: Handle) -> Result<(), SubmitError> {
        self.send(RenderCommand::BindTexture { slot, texture })
    }

    /// Draw `vertex_count` vertices from the bound vertex buffer.
    pub fn draw(&self, first_vertex: u32, vertex_count: u32) -> Result<(), SubmitError> {
        self.send(RenderCommand::Draw {
            first_vertex,
            vertex_count,
        })
    }

    /// Draw through the bound index buffer.
    pub fn draw_indexed(&self, first_index: u32, index_count: u32) -> Result<(), SubmitError> {
        self.send(RenderCommand::DrawIndexed {
            first_index,
            index_count,
        })
    }

    /// Finish the current frame.
    pub fn present(&self) -> Result<(), SubmitError> {
        self.send(RenderCommand::Present)
    }

    /// Read `len` bytes of a buffer back.
    ///
    /// `callback` runs once on the render thread during the next tick, with
    /// `None` if the buffer is stale or the range is out of bounds.
    pub fn read_buffer<F>(
        &self,
        buffer: Handle,
        offset: u64,
        len: u64,
        callback: F,
    ) -> Result<(), SubmitError>
    where
        F: FnOnce(&Option<Vec<u8>>) + Send + 'static,
    {
        self.send(RenderCommand::ReadBuffer {
            buffer,
            offset,
            len,
            callback: ConsumerCallback::new(callback),
        })
    }

    /// Queue the destruction of a resource.
    pub fn release(&self, handle: Handle) -> Result<(), SubmitError> {
        self.send(RenderCommand::Release { handle })
    }

    /// Counters of the last presented frame.
    pub fn last_frame_stats(&self) -> FrameStats {
        self.readback.load()
    }

    /// Commands queued and not yet consumed.
    pub fn pending(&self) -> usize {
        self.submitter.pending()
    }

    fn send(&self, command: RenderCommand) -> Result<(), SubmitError> {
        self.submitter.submit(command).map(|_| ())
    }
}

// ---------------------------------------------------------------------------
// RenderSubsystem
// ---------------------------------------------------------------------------

/// A running render consumer thread and its producer-side context.
#[derive(Debug)]
pub struct RenderSubsystem {
    consumer: ConsumerThread<RenderCommand>,
    context: RenderContext,
}

impl RenderSubsystem {
    /// Start a render consumer backed by a [`HeadlessDevice`].
    pub fn start(jobs: &mut JobSystem, config: &RenderConfig) -> Result<Self, RenderError> {
        let budget = config.memory_budget;
        let history = config.frame_history;
        Self::start_with_device(jobs, config, move || {
            Ok(HeadlessDevice::new(budget).with_history(history))
        })
    }

    /// Start a render consumer whose device is built by `device_factory`.
    ///
    /// The factory runs on the render thread, so the device itself need not
    /// be `Send`. A factory error is returned as [`RenderError::Consumer`].
    pub fn start_with_device<D, F>(
        jobs: &mut JobSystem,
        config: &RenderConfig,
        device_factory: F,
    ) -> Result<Self, RenderError>
    where
        D: RenderDevice + 'static,
        F: FnOnce() -> Result<D, BackendInitError> + Send + 'static,
    {
        config.validate()?;
        let allocator = Arc::new(HandleAllocator::new(config.max_resources));
        let readback = FrameReadback::new();

        let backend_allocator = Arc::clone(&allocator);
        let backend_readback = readback.clone();
        let consumer = ConsumerThread::spawn(
            jobs,
            RENDER_BACKEND_NAME,
            config.stack_size,
            &config.queue,
            allocator,
            move || {
                let device = device_factory()?;
                debug!(device = device.name(), "render device created");
                Ok(RenderBackend::new(device, backend_allocator, backend_readback))
            },
        )?;
        debug!(
            capacity = config.queue.capacity,
            policy = ?config.queue.policy,
            max_resources = config.max_resources,
            "render subsystem started"
        );

        let context = RenderContext::new(consumer.submitter().clone(), readback);
        Ok(Self { consumer, context })
    }

    /// The producer-side API.
    pub fn context(&self) -> &RenderContext {
        &self.context
    }

    /// The consumer thread, for the host's tick scheduling.
    pub fn consumer(&self) -> &ConsumerThread<RenderCommand> {
        &self.consumer
    }

    /// Mutable access to the consumer thread.
    pub fn consumer_mut(&mut self) -> &mut ConsumerThread<RenderCommand> {
        &mut self.consumer
    }
}
