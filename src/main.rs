use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use nalgebra::Point2;
use tracing::{debug, info, warn};

use scope_servo::config::ScopeConfig;
use scope_servo::io::{save_canvas, save_stitched, FrameSource, ImageSequenceSource};
use scope_servo::stage::{
    lawnmower_pattern, AutoScan, MotorLink, MotorPreset, MoveToken, SimulatedFirmware,
};
use scope_servo::stitching::{StitchAccumulator, StitchOutcome};
use scope_servo::system::{ControlMsg, ScopeSystem, StatusEvent};

#[derive(Parser)]
#[command(name = "scope-servo")]
#[command(about = "Keep a moving organism centered under a motorized microscope, and stitch the view")]
#[command(version)]
struct Cli {
    /// JSON configuration file; missing fields keep their defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Serial device of the stage controller (overrides the config file).
    #[arg(long, global = true)]
    port: Option<String>,

    /// Talk to the built-in firmware emulator instead of a serial port.
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Direct stage control.
    Stage {
        #[command(subcommand)]
        action: StageAction,
    },

    /// Lawnmower scan over a grid of positions.
    Scan {
        #[arg(long, default_value = "3")]
        rows: usize,
        /// Positions per row.
        #[arg(long, default_value = "3")]
        steps_per_row: usize,
        /// Settle time after each move, seconds.
        #[arg(long, default_value = "2.0")]
        settle: f64,
        /// Declare the start position home, enabling soft limits.
        #[arg(long)]
        home: bool,
    },

    /// Stitch a directory of overlapping frames into one image.
    Stitch {
        #[arg(long)]
        frames: PathBuf,
        /// Output directory (defaults to the configured one).
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Replay frames through detection, tracking and the servo loop.
    Track {
        #[arg(long)]
        frames: PathBuf,
        /// Click-to-track position "x,y" in frame pixels.
        #[arg(long, value_parser = parse_point)]
        click: Option<(f64, f64)>,
        /// Frame index at which the click happens.
        #[arg(long, default_value = "5")]
        click_after: u64,
        /// Enable auto-centering from the start.
        #[arg(long)]
        auto_center: bool,
        /// Also stitch the replayed frames.
        #[arg(long)]
        stitch: bool,
    },
}

#[derive(Subcommand)]
enum StageAction {
    /// Query firmware settings and print the stage state.
    Status,
    /// Send one move token, e.g. UR, DS, SL.
    Move { token: String },
    /// Step delay in microseconds (larger is slower).
    Speed { value: u32 },
    /// Steps per move token.
    Steps { value: u32 },
    /// Step pulse width in microseconds.
    Pulse { value: u32 },
    /// Apply a speed / step-size preset.
    Preset {
        #[arg(value_enum)]
        preset: PresetArg,
    },
    /// Emergency stop.
    Stop,
}

#[derive(Clone, Copy, ValueEnum)]
enum PresetArg {
    Fine,
    Normal,
    Fast,
}

impl From<PresetArg> for MotorPreset {
    fn from(p: PresetArg) -> Self {
        match p {
            PresetArg::Fine => MotorPreset::Fine,
            PresetArg::Normal => MotorPreset::Normal,
            PresetArg::Fast => MotorPreset::Fast,
        }
    }
}

fn parse_point(s: &str) -> Result<(f64, f64), String> {
    let (x, y) = s
        .split_once(',')
        .ok_or_else(|| format!("expected x,y but got {:?}", s))?;
    let x = x.trim().parse().map_err(|e| format!("bad x: {}", e))?;
    let y = y.trim().parse().map_err(|e| format!("bad y: {}", e))?;
    Ok((x, y))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => ScopeConfig::load_json(path)?,
        None => ScopeConfig::default(),
    };
    if let Some(port) = &cli.port {
        config.stage.port = port.clone();
    }

    match cli.command {
        Commands::Stage { action } => run_stage(&config, cli.simulate, action),
        Commands::Scan {
            rows,
            steps_per_row,
            settle,
            home,
        } => run_scan(&config, cli.simulate, rows, steps_per_row, settle, home),
        Commands::Stitch { frames, out } => run_stitch(&config, frames, out),
        Commands::Track {
            frames,
            click,
            click_after,
            auto_center,
            stitch,
        } => run_track(config, cli.simulate, frames, click, click_after, auto_center, stitch),
    }
}

/// Open the configured stage, or an emulator when simulating. The emulator
/// handle is returned so it outlives the link.
fn open_motor(config: &ScopeConfig, simulate: bool) -> Result<(Arc<MotorLink>, Option<SimulatedFirmware>)> {
    if simulate {
        let fw = SimulatedFirmware::new();
        let (writer, reader) = fw.channel();
        let link = MotorLink::new(writer, reader, config.stage.clone());
        link.sync_settings();
        info!("Using simulated stage firmware");
        return Ok((Arc::new(link), Some(fw)));
    }
    let link = MotorLink::open(config.stage.clone())
        .with_context(|| format!("Failed to open stage on {}", config.stage.port))?;
    Ok((Arc::new(link), None))
}

fn run_stage(config: &ScopeConfig, simulate: bool, action: StageAction) -> Result<()> {
    let (link, _fw) = open_motor(config, simulate)?;
    match action {
        StageAction::Status => {
            let settings = link.query_status()?;
            println!("{}", link.status_line());
            println!(
                "  step delay {} us, {} steps/command, pulse {} us",
                settings.step_delay_us, settings.steps_per_command, settings.pulse_width_us
            );
        }
        StageAction::Move { token } => {
            let Some(token) = MoveToken::parse(&token) else {
                bail!("Invalid move token {:?}: expected [UDS][LRS]", token);
            };
            let position = link.send_move(token)?;
            println!("Moved {} -> {}", token, position);
        }
        StageAction::Speed { value } => println!("SPEED set to {}", link.set_speed(value)?),
        StageAction::Steps { value } => println!("STEPS set to {}", link.set_steps(value)?),
        StageAction::Pulse { value } => println!("PULSE set to {}", link.set_pulse(value)?),
        StageAction::Preset { preset } => {
            let settings = link.apply_preset(preset.into())?;
            println!(
                "Preset applied: delay {} us, {} steps/command",
                settings.step_delay_us, settings.steps_per_command
            );
        }
        StageAction::Stop => {
            link.emergency_stop()?;
            println!("Stop sent");
        }
    }
    Ok(())
}

fn run_scan(
    config: &ScopeConfig,
    simulate: bool,
    rows: usize,
    steps_per_row: usize,
    settle: f64,
    home: bool,
) -> Result<()> {
    let (link, _fw) = open_motor(config, simulate)?;
    if home {
        link.set_origin();
    }
    let pattern = lawnmower_pattern(steps_per_row, rows);
    let cancel = AtomicBool::new(false);
    let report = AutoScan::run(
        &link,
        &pattern,
        Duration::from_secs_f64(settle.max(0.0)),
        &cancel,
        |p| info!("Scan {}/{} at {}", p.completed, p.total, p.position),
    )?;
    println!(
        "Scan finished: {}/{} moves{}; stage at {}",
        report.completed,
        report.total,
        if report.cancelled { " (cancelled)" } else { "" },
        link.position()
    );
    Ok(())
}

fn unix_seconds() -> Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs())
}

fn run_stitch(config: &ScopeConfig, frames: PathBuf, out: Option<PathBuf>) -> Result<()> {
    let mut source = ImageSequenceSource::open(&frames, config.pipeline.frame_interval())?;
    let mut accumulator = StitchAccumulator::new(config.stitch.clone())?;

    while let Some(frame) = source.next_frame()? {
        match accumulator.ingest(&frame) {
            Ok(StitchOutcome::Seeded) => info!("Frame {} seeded the canvas", frame.seq),
            Ok(StitchOutcome::Blended { offset, inliers }) => info!(
                "Frame {} placed at ({:+.1}, {:+.1}) from {} inliers",
                frame.seq, offset.x, offset.y, inliers
            ),
            Err(e) if e.is_registration_failure() => warn!("Frame {} skipped: {}", frame.seq, e),
            Err(e) => return Err(e.into()),
        }
    }

    let Some(canvas) = accumulator.canvas() else {
        bail!("No frames were stitched");
    };
    let out_dir = out.unwrap_or_else(|| config.pipeline.output_dir.clone());
    let path = save_canvas(canvas, &out_dir, unix_seconds()?)?;
    println!(
        "Stitched {} frames ({} skipped) into {}",
        canvas.frame_count(),
        accumulator.skipped_frames(),
        path.display()
    );
    Ok(())
}

fn run_track(
    config: ScopeConfig,
    simulate: bool,
    frames: PathBuf,
    click: Option<(f64, f64)>,
    click_after: u64,
    auto_center: bool,
    stitch: bool,
) -> Result<()> {
    let (link, _fw) = open_motor(&config, simulate)?;
    let mut source = ImageSequenceSource::open(&frames, config.pipeline.frame_interval())?;
    let pace = config.pipeline.frame_interval();
    let out_dir = config.pipeline.output_dir.clone();

    let mut system = ScopeSystem::new(config, Some(Arc::clone(&link)))?;
    let status = system.status_receiver();
    let printer = thread::spawn(move || {
        for event in status.iter() {
            match event {
                StatusEvent::Tracking { .. } | StatusEvent::CanvasUpdated { .. } => debug!("{}", event),
                other => info!("{}", other),
            }
        }
    });

    system.start_tracking();
    if stitch {
        system.start_stitching();
    }
    if auto_center {
        system.send_control(ControlMsg::SetAutoCentering(true));
    }

    let mut index = 0u64;
    while let Some(frame) = source.next_frame()? {
        if index == click_after {
            if let Some((x, y)) = click {
                system.send_control(ControlMsg::LockOn(Point2::new(x, y)));
            }
        }
        system.push_frame(frame)?;
        index += 1;
        thread::sleep(pace);
    }

    system.stop_tracking();
    if stitch {
        match system.stop_stitching()? {
            Some(image) => {
                let path = save_stitched(&image, &out_dir, unix_seconds()?)?;
                println!("Stitched canvas saved to {}", path.display());
            }
            None => warn!("Stitching produced no canvas"),
        }
    }
    let last = system.last_update();
    let servo = system.servo_status();
    system.shutdown();
    drop(system);
    let _ = printer.join();

    println!("Processed {} frames; last tracker state: {:?}", index, last);
    if !servo.is_empty() {
        println!("{}", servo);
    }
    println!("{}", link.status_line());
    Ok(())
}
