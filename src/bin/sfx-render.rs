use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use sfx_recorder_core::params::{CRUNCH_MAX, CRUNCH_MIN};
use sfx_recorder_core::{EffectParameters, OfflineRenderer, RecorderConfig, RenderedSound, decoder, dsp, storage};

#[derive(Parser)]
#[command(name = "sfx-render", version, about = "Render sound effects offline with pitch, crunch and volume")]
struct Cli {
    /// JSON recorder configuration
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply the effect chain to an audio file (WAV, or a storable string with --storable)
    Render {
        input: PathBuf,
        #[arg(long, default_value_t = 1.0)]
        pitch: f64,
        #[arg(long, default_value_t = 0.0)]
        crunch: f64,
        #[arg(long, default_value_t = 1.0)]
        volume: f64,
        /// Where to write the rendered WAV
        #[arg(long)]
        out: Option<PathBuf>,
        /// Treat the input as a storable string and print a storable string
        #[arg(long)]
        storable: bool,
    },
    /// Print statistics of the distortion curve for a crunch value
    Curve { crunch: f64 },
    /// List audio devices
    #[cfg(feature = "cpal")]
    Devices,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => RecorderConfig::from_file(path)?,
        None => RecorderConfig::default(),
    };
    info!(?config, "configuration loaded");

    match cli.cmd {
        Command::Render {
            input,
            pitch,
            crunch,
            volume,
            out,
            storable,
        } => render(input, EffectParameters::new(pitch, crunch, volume), out, storable),
        Command::Curve { crunch } => {
            if !(CRUNCH_MIN..=CRUNCH_MAX).contains(&crunch) {
                bail!("crunch must be between {CRUNCH_MIN} and {CRUNCH_MAX}");
            }
            let curve = dsp::curve::generate(crunch);
            let table = curve.table();
            let (min, max) = table
                .iter()
                .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
            println!("crunch {crunch}: {} entries", curve.len());
            println!("  min {min:.6}  max {max:.6}");
            for x in [-1.0f32, -0.5, 0.0, 0.5, 1.0] {
                println!("  f({x:+.1}) = {:+.6}", curve.lookup(x));
            }
            Ok(())
        }
        #[cfg(feature = "cpal")]
        Command::Devices => {
            for dev in sfx_recorder_core::cpal_device::list_devices()? {
                let mut tags = Vec::new();
                if dev.is_default_input {
                    tags.push("default input");
                }
                if dev.is_default_output {
                    tags.push("default output");
                }
                if tags.is_empty() {
                    println!("{}", dev.name);
                } else {
                    println!("{} ({})", dev.name, tags.join(", "));
                }
            }
            Ok(())
        }
    }
}

fn render(input: PathBuf, params: EffectParameters, out: Option<PathBuf>, storable: bool) -> Result<()> {
    let bytes = if storable {
        let text = std::fs::read_to_string(&input).with_context(|| format!("reading {}", input.display()))?;
        storage::from_storable(&text)?
    } else {
        std::fs::read(&input).with_context(|| format!("reading {}", input.display()))?
    };

    let buffer = decoder::decode(&bytes).with_context(|| format!("decoding {}", input.display()))?;
    if buffer.is_empty() {
        bail!("{} contains no audio", input.display());
    }
    let rendered = OfflineRenderer::new().render(&buffer, params)?;
    let sound = RenderedSound::from_buffer(&rendered)?;
    info!(
        frames = rendered.frame_count(),
        duration = ?sound.duration(),
        "rendered"
    );

    match out {
        Some(path) => {
            std::fs::write(&path, sound.wav_bytes()?).with_context(|| format!("writing {}", path.display()))?;
            println!("wrote {}", path.display());
        }
        None if storable => println!("{}", sound.as_storable()),
        None => bail!("nothing to do: pass --out or --storable"),
    }
    Ok(())
}
