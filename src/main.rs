use clap::Parser;
use log::{error, info};
use physics_prediction::session::{Session, SessionOptions};
use shared::PredictionConfig;
use tokio::time::{interval, Duration, MissedTickBehavior};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// One-way link latency in milliseconds
    #[arg(short = 'l', long, default_value = "0")]
    latency_ms: u64,

    /// Chance of losing an unreliable packet, between 0 and 1
    #[arg(long, default_value = "0.0")]
    loss: f64,

    /// Number of frames to run
    #[arg(short = 'f', long, default_value = "600")]
    frames: u64,

    /// Authority tick at which the player is knocked off its predicted path
    #[arg(short = 'd', long)]
    divergence_at: Option<i32>,

    /// Player jumps every this many ticks
    #[arg(short = 'j', long)]
    jump_every: Option<i32>,

    /// Send routine snapshots every this many ticks
    #[arg(long, default_value = "2")]
    cadence: i32,

    /// Inputs the authority buffers before it starts ticking
    #[arg(long, default_value = "3")]
    desired_buffer: usize,

    /// Seed for packet loss
    #[arg(long, default_value = "7")]
    seed: u64,

    /// Pace frames in real time instead of running flat out
    #[arg(long)]
    realtime: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let prediction = PredictionConfig {
        snapshot_send_cadence: args.cadence,
        desired_input_buffer_size: args.desired_buffer,
        ..PredictionConfig::default()
    };
    let frame_dt = prediction.fixed_dt;
    let options = SessionOptions {
        latency_frames: (args.latency_ms as f64 / 1000.0 / frame_dt).round() as u64,
        loss: args.loss,
        seed: args.seed,
        frame_dt,
        divergence_at: args.divergence_at,
        player_jump_every: args.jump_every,
        prediction,
    };

    info!(
        "Running {} frames with {}ms latency ({} frames) and {:.0}% loss",
        args.frames,
        args.latency_ms,
        options.latency_frames,
        args.loss * 100.0
    );

    let mut session = match Session::new(options) {
        Ok(session) => session,
        Err(e) => {
            error!("Invalid session setup: {}", e);
            return Err(e.into());
        }
    };

    if args.realtime {
        let mut ticker = interval(Duration::from_secs_f64(frame_dt));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        for _ in 0..args.frames {
            ticker.tick().await;
            session.frame();
        }
    } else {
        session.run(args.frames);
    }

    println!("{}", session.report());
    Ok(())
}
