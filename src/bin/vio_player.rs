use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use env_logger::{Builder, Env};
use image::ImageReader;
use log::LevelFilter;
use vio::{create_camera_model, CameraModel, Config, Frame, VioError, VioPipeline};

#[derive(Parser, Debug)]
#[command(name = "vio_player")]
#[command(about = "Plays a folder of images through the VIO pipeline")]
struct Args {
    /// Path to a folder of image files
    #[arg(short = 'p', long = "path")]
    path: PathBuf,

    /// Image file extension, e.g. png or jpg
    #[arg(short = 'f', long = "format")]
    format: String,

    /// Interval between frames in milliseconds
    #[arg(short = 'i', long = "image-interval", default_value_t = 30)]
    image_interval: u64,

    /// Run the full cycle synchronously on the caller's thread
    #[arg(long = "use-single-thread", default_value_t = false)]
    use_single_thread: bool,
}

fn main() {
    Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .format(|buf, record| {
            use std::io::Write;
            let level = match record.level() {
                log::Level::Error => "\x1b[31mERROR\x1b[0m",
                log::Level::Warn => "\x1b[33mWARN\x1b[0m",
                log::Level::Info => "\x1b[32mINFO\x1b[0m",
                log::Level::Debug => "\x1b[34mDEBUG\x1b[0m",
                log::Level::Trace => "\x1b[36mTRACE\x1b[0m",
            };
            writeln!(
                buf,
                "[{}] [{}] {}",
                buf.timestamp_millis(),
                level,
                record.args()
            )
        })
        .filter_module("vio", LevelFilter::Debug)
        .init();

    let args = Args::parse();
    if let Err(e) = run(args) {
        log::error!("[Main] {e:#}");
        process::exit(-1);
    }
    log::info!("[Main] playback completed");
}

fn run(args: Args) -> Result<()> {
    let images = list_images(&args.path, &args.format)?;
    if images.len() < 2 {
        bail!("found only {} images in {}", images.len(), args.path.display());
    }
    log::info!("[Main] playing {} images", images.len());

    let (config, camera) = load_calibration(&args.path)?;

    let mut pipeline = VioPipeline::new(config, camera);
    pipeline.set_single_thread_mode(args.use_single_thread)?;
    pipeline.start()?;

    let interval_ns = (args.image_interval as i64) * 1_000_000;
    for (index, path) in images.iter().enumerate() {
        let image = ImageReader::open(path)
            .with_context(|| format!("open {}", path.display()))?
            .decode()
            .with_context(|| format!("decode {}", path.display()))?
            .to_luma8();

        let frame = Frame::new(index as i64 * interval_ns, image);
        if !pipeline.process_new_image(frame) {
            log::warn!("[Main] pipeline stopped accepting frames at {}", index);
            break;
        }
        thread::sleep(Duration::from_millis(args.image_interval));
    }

    pipeline.stop();

    let state = pipeline.current_state();
    log::info!(
        "[Main] final state: ts={} p=[{:.3}, {:.3}, {:.3}] tracked={} degraded={}",
        state.timestamp_ns,
        state.p.x,
        state.p.y,
        state.p.z,
        state.tracked_features,
        state.degraded
    );
    Ok(())
}

fn list_images(folder: &Path, format: &str) -> Result<Vec<PathBuf>> {
    let mut images: Vec<PathBuf> = std::fs::read_dir(folder)
        .with_context(|| format!("read directory {}", folder.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.extension()
                .map(|ext| ext.eq_ignore_ascii_case(format))
                .unwrap_or(false)
        })
        .collect();
    images.sort();
    Ok(images)
}

/// Load `calibration.yaml` from the dataset folder when present. A missing
/// file or incomplete calibration is a warning, not an error: the pipeline
/// runs without geometric undistortion. Only an unrecognized camera-model
/// family aborts.
fn load_calibration(folder: &Path) -> Result<(Config, Option<Arc<dyn CameraModel>>)> {
    let config_path = folder.join("calibration.yaml");
    if !config_path.exists() {
        log::warn!(
            "[Main] couldn't open config file {}, skipped",
            config_path.display()
        );
        return Ok((Config::default(), None));
    }

    let config = Config::load(config_path.to_str().unwrap_or_default())
        .with_context(|| format!("parse {}", config_path.display()))?;

    let camera = match &config.camera {
        Some(camera_config) => match create_camera_model(camera_config) {
            Ok(model) => Some(model),
            Err(e @ VioError::UnknownCameraModel(_)) => {
                return Err(e).context("couldn't create camera model");
            }
            Err(e) => {
                log::warn!("[Main] {e}; running without undistortion");
                None
            }
        },
        None => {
            log::warn!("[Main] no camera section in calibration file");
            None
        }
    };
    Ok((config, camera))
}
