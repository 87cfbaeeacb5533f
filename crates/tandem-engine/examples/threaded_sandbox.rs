//! Threaded sandbox: a game thread feeds physics while the host draws.
//!
//! A producer thread drops balls into a walled box while a host system renders
//! one quad per body from the latest physics snapshot. At the end the sandbox
//! counts the balls resting on the floor.
//!
//! Run with:
//!
//! ```sh
//! RUST_LOG=info cargo run --example threaded_sandbox -p tandem-engine
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use tandem_engine::prelude::*;

const FRAMES: u64 = 120;
const BALLS: usize = 48;

fn wall(x: f64, y: f64, half_width: f64, half_height: f64) -> BodyDesc {
    BodyDesc {
        kind: BodyKind::Static,
        shape: Shape::Box {
            half_width,
            half_height,
        },
        transform: Transform {
            position: Vec2::new(x, y),
            rotation: 0.0,
        },
        ..Default::default()
    }
}

fn quad_vertices() -> Vec<Vertex> {
    let color = [0.9, 0.6, 0.2, 1.0];
    [
        [-0.5, -0.5],
        [0.5, -0.5],
        [0.5, 0.5],
        [-0.5, -0.5],
        [0.5, 0.5],
        [-0.5, 0.5],
    ]
    .into_iter()
    .map(|p| Vertex::new(p, color))
    .collect()
}

fn main() -> anyhow::Result<()> {
    tandem_engine::logging::init_tracing_with("info");

    let config = match std::env::args().nth(1) {
        Some(path) => EngineConfig::from_path(&path)
            .with_context(|| format!("loading engine config from {path}"))?,
        None => EngineConfig::default(),
    };
    let mut engine = Engine::start(&config).context("starting engine")?;
    let physics = engine
        .physics()
        .context("physics is disabled in this config")?
        .clone();
    let render = engine
        .render()
        .context("render is disabled in this config")?
        .clone();

    // Arena.
    physics.add_rigid_body(wall(0.0, -10.0, 12.0, 0.5))?;
    physics.add_rigid_body(wall(-12.0, 0.0, 0.5, 10.0))?;
    physics.add_rigid_body(wall(12.0, 0.0, 0.5, 10.0))?;

    let quad = render.create_buffer_from_slice(BufferUsage::Vertex, &quad_vertices())?;
    let shader = render.create_shader(ShaderDesc {
        label: "sprite".into(),
        source: "fn vs_main() {} fn fs_main() {}".into(),
        vertex_entry: "vs_main".into(),
        fragment_entry: "fs_main".into(),
        vertex_stride: Vertex::STRIDE,
    })?;
    render.set_viewport(Viewport {
        x: 0.0,
        y: 0.0,
        width: 1280.0,
        height: 720.0,
    })?;

    // Game thread: spawns balls at its own pace.
    let stop = Arc::new(AtomicBool::new(false));
    let game = {
        let physics = physics.clone();
        let stop = Arc::clone(&stop);
        std::thread::Builder::new()
            .name("game".into())
            .spawn(move || -> Result<usize, SubmitError> {
                let mut spawned = 0;
                while spawned < BALLS && !stop.load(Ordering::Relaxed) {
                    let x = (spawned % 12) as f64 * 1.5 - 8.0;
                    physics.add_rigid_body(BodyDesc {
                        transform: Transform {
                            position: Vec2::new(x, 8.0),
                            rotation: 0.0,
                        },
                        restitution: 0.4,
                        ..Default::default()
                    })?;
                    spawned += 1;
                    std::thread::sleep(Duration::from_millis(2));
                }
                Ok(spawned)
            })?
    };

    engine.add_system("draw", move |ctx| {
        let (Some(render), Some(physics)) = (ctx.render(), ctx.physics()) else {
            return;
        };
        let snapshot = physics.snapshot();
        let submitted = render
            .clear(Color::rgba(0.05, 0.05, 0.1, 1.0))
            .and_then(|()| render.bind_shader(shader))
            .and_then(|()| render.bind_vertex_buffer(quad))
            .and_then(|()| {
                snapshot
                    .bodies()
                    .try_for_each(|_| render.draw(0, 6))
            })
            .and_then(|()| render.present());
        if let Err(e) = submitted {
            tracing::warn!(frame = ctx.frame(), error = %e, "dropped draw commands");
        }
    });

    let started = Instant::now();
    let mut applied = 0;
    let mut failed = 0;
    for _ in 0..FRAMES {
        let frame = engine.frame()?;
        applied += frame.commands_applied;
        failed += frame.commands_failed;
        for failure in &frame.failures {
            tracing::warn!(
                subsystem = %failure.subsystem,
                opcode = failure.opcode,
                error = %failure.error,
                "command failed"
            );
        }
    }
    let elapsed = started.elapsed();

    stop.store(true, Ordering::Relaxed);
    let spawned = game
        .join()
        .map_err(|_| anyhow::anyhow!("game thread panicked"))??;

    let snapshot = physics.snapshot();
    let resting = snapshot
        .bodies()
        .filter(|(_, state)| state.transform.position.y < -8.0)
        .count();
    let stats = render.last_frame_stats();

    tracing::info!(
        frames = FRAMES,
        spawned,
        bodies = snapshot.body_count(),
        resting,
        applied,
        failed,
        draw_calls = stats.draw_calls,
        elapsed_ms = elapsed.as_secs_f64() * 1000.0,
        "sandbox finished"
    );
    println!(
        "{FRAMES} frames in {:.1} ms: {spawned} balls spawned, {resting} resting, \
         {applied} commands applied, {failed} failed, {} draws in the last frame",
        elapsed.as_secs_f64() * 1000.0,
        stats.draw_calls
    );

    engine.shutdown()?;
    Ok(())
}
