//! rpicam-mjpeg
//!
//! Camera control daemon: drives preview, still, video and motion capture while accepting
//! commands over a named pipe, and reports its state through a status file.

mod capture;
mod config;
mod control;
mod crash;
mod error;
mod logging;
mod motion;
mod session;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use config::{CliOptions, Config};
use control::ControlChannel;
use session::{SessionController, ShutdownToken};

fn main() {
    match run() {
        Ok(()) => {}
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            std::process::exit(-1);
        }
    }
}

fn run() -> Result<()> {
    let opts = CliOptions::parse(std::env::args().skip(1))?;

    if opts.help {
        print_help();
        return Ok(());
    }

    let mut config = Config::load(opts.config_path.as_deref())?;
    opts.apply(&mut config);

    if opts.write_config {
        let path = config.save()?;
        println!("Configuration written to {:?}", path);
        return Ok(());
    }

    // Held until exit so buffered file logs are flushed
    let _log_guard = logging::init_logging(&config.logging, opts.verbose)?;

    info!("rpicam-mjpeg {} starting...", env!("CARGO_PKG_VERSION"));
    if let Ok(path) = config.config_path() {
        info!("Configuration from {:?}", path);
    }

    crash::init_crash_handler(
        logging::get_log_dir(&config.logging).as_deref(),
        config.output.status_file.as_deref(),
    );
    if let Some(path) = crash::get_crash_log_path() {
        info!("Crash reports go to {:?}", path);
    }

    config.validate()?;
    let settings = config.controller_settings()?;

    let shutdown = ShutdownToken::new();
    let ctrl_c = shutdown.clone();
    ctrlc::set_handler(move || {
        info!("Ctrl+C received, shutting down...");
        ctrl_c.request();
    })
    .context("Failed to install Ctrl+C handler")?;

    let pipeline = capture::create_pipeline(&config.camera, shutdown.clone())
        .context("Failed to open camera")?;

    let mut controller = SessionController::new(settings, pipeline, shutdown)?;

    if let Some(path) = &config.output.control_file {
        let channel = ControlChannel::open(path, config.output.create_fifo)?;
        controller = controller.with_control(channel);
    } else {
        warn!("No control file configured, commands are disabled");
    }

    controller.run()?;

    info!("Shutdown complete");
    Ok(())
}

fn print_help() {
    println!("rpicam-mjpeg - camera control daemon");
    println!();
    println!("USAGE:");
    println!("    rpicam-mjpeg [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    --config <path>          Configuration file (TOML)");
    println!("    --stream <name>          Mode to start: preview, still, video, motion (repeatable)");
    println!("    --control_file <path>    Control FIFO");
    println!("    --status_file <path>     Status file");
    println!("    --media_path <path>      Media root for relative templates and thumbnails");
    println!("    --image_path <template>  Still filename template");
    println!("    --video_path <template>  Video filename template");
    println!("    --preview_path <path>    Preview image");
    println!("    --motion_output <path>   Motion transition output");
    println!("    --device <device>        V4L2 device or stub://<name>");
    println!("    --write-config           Write the effective configuration and exit");
    println!("    -v, --verbose            Debug logging");
    println!("    -h, --help               Print this help message");
    println!();
    println!("TEMPLATES:");
    println!("    %Y %M %D %h %m %s date and time, %i image count, %v video count, %% percent");
    println!();
    println!("ENVIRONMENT:");
    println!("    RUST_LOG                 Set log level (e.g., debug, info, warn)");
    println!("    RPICAM_MJPEG_CONFIG      Configuration file");
    println!("    RPICAM_MJPEG_LOG_PATH    Directory for daily log files");
}
