use std::env::args;

use grass_wind::*;
use indicatif::{ProgressBar, ProgressStyle};
use rand::{rngs::StdRng, Rng, SeedableRng};

const SIZE: u32 = 128;
const FRAMES_PER_FORCE: usize = 120;

fn create_forces(device: &Device, stream: &Stream) -> Result<[GridField; 2]> {
    // a strip of upward wind near the bottom edge
    let gust = GridField::create_owned(device, SIZE, SIZE, 2)?;
    gust.fill_with(stream, |x, y| {
        if y == 5 && (55..73).contains(&x) {
            [0.0, 30.0]
        } else {
            [0.0, 0.0]
        }
    })?;
    let calm = GridField::create_owned(device, SIZE, SIZE, 2)?;
    calm.zero(stream)?;
    Ok([calm, gust])
}

fn run(frames: usize, config: SolverConfig) -> Result<()> {
    let device = Device::new(DeviceConfig::default())?;
    let wind_texture = Surface::new(&device, SIZE, SIZE, TextureFormat::Rgba32F)?;
    let mut solver = FluidSolver::new(config);
    solver.create(&device, Some(&wind_texture), None)?;
    solver.config().save("wind.json")?;

    let stream = device.create_stream();
    let forces = create_forces(&device, &stream)?;
    let meadow = Meadow::scatter(&device, &stream, GrassConfig::default(), 7)?;
    stream.synchronize()?;
    let mut current = 0;
    let mut rng = StdRng::seed_from_u64(0);
    let mut time = 0.0f32;

    let progress = ProgressBar::new(frames as u64);
    progress.set_style(
        ProgressStyle::with_template("{bar:40} {pos}/{len} frames ({eta}) {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    for frame in 0..frames {
        if frame > 0 && frame % FRAMES_PER_FORCE == 0 {
            current ^= 1;
            log::info!("switched to force field {}", current);
        }
        // frame times wobble around 60 fps
        let dt = (1.0 + rng.gen_range(-0.1f32..0.1)) / 60.0;
        time += dt;
        solver.step(dt, Some(&forces[current]))?;

        let velocities = solver.velocities()?;
        let solver_stream = solver.stream()?;
        let access = SharingGate::acquire(solver_stream, &[velocities])?;
        meadow.react(access.stream(), velocities, time)?;
        access.release()?;

        let [ox, oy] = meadow.mean_offset(solver_stream)?;
        progress.set_message(format!("mean blade offset ({:.3}, {:.3})", ox, oy));
        progress.inc(1);
    }
    progress.finish();

    let velocities = solver.velocities()?;
    let solver_stream = solver.stream()?;
    let access = SharingGate::acquire(solver_stream, &[velocities])?;
    dump_velocity_magnitude_exr(velocities, solver_stream, "wind.exr")?;
    access.release()?;
    log::info!("wrote wind.exr and wind.json");
    solver.release()
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let frames = args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(600);
    let config = match args().nth(2) {
        Some(path) => match SolverConfig::load(&path) {
            Ok(config) => config,
            Err(e) => {
                log::error!("failed to load {}: {}", path, e);
                std::process::exit(1);
            }
        },
        None => SolverConfig {
            density: 3.0,
            grid_square_size: 0.03,
            ..SolverConfig::new(SIZE, SIZE)
        },
    };
    if let Err(e) = run(frames, config) {
        log::error!("{}", e);
        std::process::exit(1);
    }
}
