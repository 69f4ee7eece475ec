#![windows_subsystem = "windows"]

mod config;
mod gfx;
mod runtime;

use std::process::ExitCode;

use log::{error, info};

use crate::runtime::OverlayApp;

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("starting holodesk");
    match OverlayApp::run() {
        Ok(()) => {
            info!("holodesk exited normally");
            ExitCode::SUCCESS
        }
        Err(e) => {
            // Startup configuration and device failures are fatal; everything
            // else is absorbed inside the render loop.
            error!("holodesk failed: {e}");
            ExitCode::FAILURE
        }
    }
}
