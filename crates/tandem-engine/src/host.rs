//! The host frame loop: the external scheduler for every consumer thread.
//!
//! An [`Engine`] owns the [`JobSystem`] and one consumer per enabled
//! subsystem. Each [`frame`](Engine::frame):
//!
//! 1. The registered systems run on the host thread, in registration order,
//!    submitting commands through the subsystem contexts.
//! 2. Every consumer is kicked (`begin_tick`). The consumers run in parallel
//!    with each other, each draining its queue in FIFO order and stepping its
//!    subsystem once.
//! 3. The host waits for every consumer (`end_tick`).
//! 4. Failures the consumers absorbed are drained into the frame's
//!    [`FrameDiagnostics`].
//!
//! Commands a system submits are therefore applied in the same frame.
//! Producers on other threads can hold clones of the subsystem contexts and
//! submit at any time; their commands are applied by the first tick that
//! starts after the submission returns.
//!
//! # Blocking queues
//!
//! Systems run on the host thread, so a system must not submit more than one
//! queue's capacity per frame into a queue configured with
//! [`OverflowPolicy::Block`](tandem_queue::ring::OverflowPolicy::Block): the
//! consumer only frees space while the host keeps ticking it.

use std::time::{Duration, Instant};

use tandem_physics::{PhysicsContext, PhysicsSubsystem};
use tandem_queue::consumer::ConsumerStatus;
use tandem_queue::diagnostics::{Diagnostic, DiagnosticSink};
use tandem_queue::threaded::ConsumerThread;
use tandem_render::{RenderContext, RenderSubsystem};
use tandem_sync::job::JobSystem;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::EngineError;

// ---------------------------------------------------------------------------
// FrameContext
// ---------------------------------------------------------------------------

/// What a system sees while it runs.
#[derive(Debug, Clone, Copy)]
pub struct FrameContext<'a> {
    frame: u64,
    physics: Option<&'a PhysicsContext>,
    render: Option<&'a RenderContext>,
}

impl<'a> FrameContext<'a> {
    /// 1-based index of the frame being run.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// The physics façade, if physics is enabled.
    pub fn physics(&self) -> Option<&'a PhysicsContext> {
        self.physics
    }

    /// The render façade, if rendering is enabled.
    pub fn render(&self) -> Option<&'a RenderContext> {
        self.render
    }
}

/// A host-thread system, called once per frame.
pub type SystemFn = Box<dyn FnMut(&FrameContext<'_>)>;

struct RegisteredSystem {
    name: String,
    func: SystemFn,
}

// ---------------------------------------------------------------------------
// FrameDiagnostics
// ---------------------------------------------------------------------------

/// What happened during one frame.
#[derive(Debug, Clone, Default)]
pub struct FrameDiagnostics {
    /// Index of the frame (1-based).
    pub frame: u64,
    /// Wall-clock time per system, in execution order.
    pub system_times: Vec<(String, Duration)>,
    /// Time from kicking the consumers until the last one finished.
    pub consumer_wait: Duration,
    /// Total frame time.
    pub total_time: Duration,
    /// Commands the consumers applied this frame.
    pub commands_applied: u64,
    /// Commands the consumers rejected this frame.
    pub commands_failed: u64,
    /// The rejected commands, per consumer, in sequence order.
    pub failures: Vec<Diagnostic>,
}

// ---------------------------------------------------------------------------
// Hosted consumers
// ---------------------------------------------------------------------------

/// The host's view of a consumer thread, whatever its command type.
trait HostedConsumer {
    fn name(&self) -> &str;
    fn begin_tick(&mut self);
    fn end_tick(&mut self) -> bool;
    fn shutdown(&mut self) -> bool;
    fn status(&self) -> &ConsumerStatus;
    fn diagnostics(&self) -> &DiagnosticSink;
}

impl<C> HostedConsumer for ConsumerThread<C> {
    fn name(&self) -> &str {
        ConsumerThread::name(self)
    }

    fn begin_tick(&mut self) {
        ConsumerThread::begin_tick(self)
    }

    fn end_tick(&mut self) -> bool {
        ConsumerThread::end_tick(self)
    }

    fn shutdown(&mut self) -> bool {
        ConsumerThread::shutdown(self)
    }

    fn status(&self) -> &ConsumerStatus {
        ConsumerThread::status(self)
    }

    fn diagnostics(&self) -> &DiagnosticSink {
        ConsumerThread::diagnostics(self)
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The host: job system, subsystem consumers and frame loop.
pub struct Engine {
    jobs: JobSystem,
    physics: Option<PhysicsSubsystem>,
    render: Option<RenderSubsystem>,
    systems: Vec<RegisteredSystem>,
    frame_counter: u64,
    shutdown_attempts: u32,
    shut_down: bool,
    last_diagnostics: FrameDiagnostics,
}

impl Engine {
    /// Validate `config` and start every enabled subsystem.
    ///
    /// If a later subsystem fails to start, the ones already running are
    /// shut down before the error is returned.
    pub fn start(config: &EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let mut engine = Self {
            jobs: JobSystem::new(config.jobs.clone()),
            physics: None,
            render: None,
            systems: Vec::new(),
            frame_counter: 0,
            shutdown_attempts: config.shutdown_attempts,
            shut_down: false,
            last_diagnostics: FrameDiagnostics::default(),
        };
        if let Some(physics) = &config.physics {
            engine.physics = Some(PhysicsSubsystem::start(&mut engine.jobs, physics)?);
        }
        if let Some(render) = &config.render {
            engine.render = Some(RenderSubsystem::start(&mut engine.jobs, render)?);
        }
        info!(
            physics = engine.physics.is_some(),
            render = engine.render.is_some(),
            "engine started"
        );
        Ok(engine)
    }

    /// Register a system to run on the host thread every frame.
    ///
    /// Systems run in registration order.
    ///
    /// # Panics
    ///
    /// Panics if a system with the same name is already registered.
    pub fn add_system<F>(&mut self, name: &str, func: F)
    where
        F: FnMut(&FrameContext<'_>) + 'static,
    {
        assert!(
            !self.systems.iter().any(|s| s.name == name),
            "duplicate system name: {name:?}"
        );
        self.systems.push(RegisteredSystem {
            name: name.to_owned(),
            func: Box::new(func),
        });
    }

    /// Run one frame. See the module docs for the phases.
    ///
    /// Fails if a consumer thread has ended; the engine should then be shut
    /// down.
    pub fn frame(&mut self) -> Result<&FrameDiagnostics, EngineError> {
        if self.shut_down {
            return Err(EngineError::ShutDown);
        }
        let frame_start = Instant::now();
        self.frame_counter += 1;

        let Self {
            physics,
            render,
            systems,
            frame_counter,
            ..
        } = self;
        // Phase 1: host systems.
        let ctx = FrameContext {
            frame: *frame_counter,
            physics: physics.as_ref().map(PhysicsSubsystem::context),
            render: render.as_ref().map(RenderSubsystem::context),
        };
        let mut system_times = Vec::with_capacity(systems.len());
        for system in systems.iter_mut() {
            let start = Instant::now();
            (system.func)(&ctx);
            system_times.push((system.name.clone(), start.elapsed()));
        }

        // Phase 2: kick every consumer.
        let wait_start = Instant::now();
        let mut consumers = hosted(physics, render);
        let before: Vec<(u64, u64)> = consumers.iter().map(|c| totals(c.status())).collect();
        for consumer in consumers.iter_mut() {
            consumer.begin_tick();
        }

        // Phase 3: wait for them.
        let mut lost = None;
        for consumer in consumers.iter_mut() {
            if !consumer.end_tick() && lost.is_none() {
                lost = Some(consumer.name().to_owned());
            }
        }
        let consumer_wait = wait_start.elapsed();

        // Phase 4: collect what the consumers absorbed.
        let mut diagnostics = FrameDiagnostics {
            frame: *frame_counter,
            system_times,
            consumer_wait,
            ..Default::default()
        };
        for (consumer, (applied, failed)) in consumers.iter().zip(before) {
            let (applied_now, failed_now) = totals(consumer.status());
            diagnostics.commands_applied += applied_now - applied;
            diagnostics.commands_failed += failed_now - failed;
            diagnostics.failures.extend(consumer.diagnostics().drain());
        }
        diagnostics.total_time = frame_start.elapsed();

        if !diagnostics.failures.is_empty() {
            debug!(
                frame = diagnostics.frame,
                failures = diagnostics.failures.len(),
                "frame had rejected commands"
            );
        }
        self.last_diagnostics = diagnostics;

        match lost {
            Some(name) => {
                warn!(consumer = %name, "consumer thread is gone");
                Err(EngineError::ConsumerLost { name })
            }
            None => Ok(&self.last_diagnostics),
        }
    }

    /// Run `count` frames. Returns the number of commands applied.
    pub fn run_frames(&mut self, count: u64) -> Result<u64, EngineError> {
        let mut applied = 0;
        for _ in 0..count {
            applied += self.frame()?.commands_applied;
        }
        Ok(applied)
    }

    /// Shut every consumer down and terminate the job system.
    ///
    /// Each consumer processes its terminate record in one final tick. Then
    /// `terminate_all` is attempted up to the configured number of times.
    /// Calling this again after success does nothing.
    pub fn shutdown(&mut self) -> Result<(), EngineError> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;
        for consumer in hosted(&mut self.physics, &mut self.render) {
            if !consumer.shutdown() {
                warn!(consumer = consumer.name(), "consumer did not report terminated");
            }
        }
        for attempt in 1..=self.shutdown_attempts {
            if self.jobs.terminate_all() {
                info!(frames = self.frame_counter, attempt, "engine shut down");
                return Ok(());
            }
            warn!(
                attempt,
                pending = self.jobs.job_count(),
                "jobs still running after terminate attempt"
            );
        }
        Err(EngineError::ShutdownIncomplete {
            pending: self.jobs.job_count(),
        })
    }

    // -- accessors ----------------------------------------------------------

    /// Frames run so far.
    pub fn frame_count(&self) -> u64 {
        self.frame_counter
    }

    /// Physics façade, if enabled. Clone it to submit from other threads.
    pub fn physics(&self) -> Option<&PhysicsContext> {
        self.physics.as_ref().map(PhysicsSubsystem::context)
    }

    /// Render façade, if enabled. Clone it to submit from other threads.
    pub fn render(&self) -> Option<&RenderContext> {
        self.render.as_ref().map(RenderSubsystem::context)
    }

    /// The physics subsystem, for direct consumer access.
    pub fn physics_subsystem(&self) -> Option<&PhysicsSubsystem> {
        self.physics.as_ref()
    }

    /// The render subsystem, for direct consumer access.
    pub fn render_subsystem(&self) -> Option<&RenderSubsystem> {
        self.render.as_ref()
    }

    /// Number of registered systems.
    pub fn system_count(&self) -> usize {
        self.systems.len()
    }

    /// Names of the registered systems, in execution order.
    pub fn system_names(&self) -> Vec<&str> {
        self.systems.iter().map(|s| s.name.as_str()).collect()
    }

    /// Diagnostics of the last frame.
    pub fn last_diagnostics(&self) -> &FrameDiagnostics {
        &self.last_diagnostics
    }

    /// Whether [`shutdown`](Self::shutdown) has run.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "engine dropped without a clean shutdown");
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("frame", &self.frame_counter)
            .field("physics", &self.physics.is_some())
            .field("render", &self.render.is_some())
            .field("systems", &self.system_names())
            .field("shut_down", &self.shut_down)
            .finish()
    }
}

fn hosted<'a>(
    physics: &'a mut Option<PhysicsSubsystem>,
    render: &'a mut Option<RenderSubsystem>,
) -> Vec<&'a mut dyn HostedConsumer> {
    let mut out: Vec<&'a mut dyn HostedConsumer> = Vec::with_capacity(2);
    if let Some(p) = physics {
        out.push(p.consumer_mut());
    }
    if let Some(r) = render {
        out.push(r.consumer_mut());
    }
    out
}

fn totals(status: &ConsumerStatus) -> (u64, u64) {
    (status.commands_applied(), status.commands_failed())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use tandem_physics::command::BodyDesc;

    fn physics_only() -> EngineConfig {
        EngineConfig {
            render: None,
            ..Default::default()
        }
    }

    #[test]
    fn systems_run_in_registration_order() {
        let mut engine = Engine::start(&physics_only()).unwrap();
        let log = Rc::new(RefCell::new(Vec::new()));
        for name in ["input", "gameplay", "draw"] {
            let log = Rc::clone(&log);
            engine.add_system(name, move |ctx| log.borrow_mut().push((ctx.frame(), name)));
        }
        engine.run_frames(2).unwrap();
        assert_eq!(
            *log.borrow(),
            vec![
                (1, "input"),
                (1, "gameplay"),
                (1, "draw"),
                (2, "input"),
                (2, "gameplay"),
                (2, "draw"),
            ]
        );
        assert_eq!(engine.system_names(), vec!["input", "gameplay", "draw"]);
        assert_eq!(engine.last_diagnostics().system_times.len(), 3);
        engine.shutdown().unwrap();
    }

    #[test]
    #[should_panic(expected = "duplicate system name")]
    fn duplicate_system_panics() {
        let mut engine = Engine::start(&physics_only()).unwrap();
        engine.add_system("a", |_| {});
        engine.add_system("a", |_| {});
    }

    #[test]
    fn commands_from_a_system_apply_same_frame() {
        let mut engine = Engine::start(&physics_only()).unwrap();
        let spawned = Rc::new(RefCell::new(None));
        let slot = Rc::clone(&spawned);
        engine.add_system("spawn", move |ctx| {
            if ctx.frame() == 1 {
                let physics = ctx.physics().unwrap();
                *slot.borrow_mut() = Some(physics.add_rigid_body(BodyDesc::default()).unwrap());
            }
        });

        assert_eq!(engine.frame().unwrap().commands_applied, 1);
        let body = spawned.borrow().unwrap();
        assert!(engine.physics().unwrap().has_body(body));

        assert_eq!(engine.frame().unwrap().commands_applied, 0);
        assert!(engine.physics().unwrap().has_body(body));
        engine.shutdown().unwrap();
    }

    #[test]
    fn frame_after_shutdown_fails() {
        let mut engine = Engine::start(&EngineConfig::default()).unwrap();
        engine.shutdown().unwrap();
        assert!(engine.is_shut_down());
        assert!(matches!(engine.frame(), Err(EngineError::ShutDown)));
        engine.shutdown().unwrap();
    }

    #[test]
    fn no_subsystems_still_runs_systems() {
        let mut engine = Engine::start(&EngineConfig {
            physics: None,
            render: None,
            ..Default::default()
        })
        .unwrap();
        let count = Rc::new(RefCell::new(0));
        let c = Rc::clone(&count);
        engine.add_system("tick", move |ctx| {
            assert!(ctx.physics().is_none() && ctx.render().is_none());
            *c.borrow_mut() += 1;
        });
        assert_eq!(engine.run_frames(5).unwrap(), 0);
        assert_eq!(*count.borrow(), 5);
        assert_eq!(engine.frame_count(), 5);
    }
}
