// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use lumen_core::init_tracing;
use lumen_platform::PlatformWindow;
use lumen_render::SurfaceWindow;
use lumen_render_vk::{RenderError, Renderer, VulkanContext};
use tracing::{error, info};

use config::{load_cfg, VsyncModeCfg, DEFAULT_CONFIG_PATH};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML config file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the configured vsync mode
    #[arg(long, value_enum)]
    vsync_mode: Option<VsyncModeCfg>,

    /// Disable vsync (prefers IMMEDIATE when the surface offers it)
    #[arg(long)]
    no_vsync: bool,

    /// Exit after this many presented frames
    #[arg(long)]
    max_frames: Option<u64>,
}

/// Clears the next swapchain image. `false` means the frame was skipped for
/// a swapchain rebuild.
fn draw_frame(
    renderer: &mut Renderer<VulkanContext>,
    window: &mut PlatformWindow,
) -> lumen_render_vk::Result<bool> {
    let Some(cmd) = renderer.begin_frame(window)? else {
        return Ok(false);
    };
    renderer.begin_swapchain_render_pass(cmd)?;
    renderer.end_swapchain_render_pass(cmd)?;
    renderer.end_frame(window)?;
    Ok(true)
}

fn run(args: Args) -> Result<()> {
    let mut cfg = load_cfg(&args.config);
    if let Some(mode) = args.vsync_mode {
        cfg.render.vsync_mode = mode;
    }
    if args.no_vsync {
        cfg.render.vsync = false;
    }
    info!(
        "vsync cfg = {} (mode {:?})",
        cfg.render.vsync, cfg.render.vsync_mode
    );

    let mut window = PlatformWindow::new(cfg.window_config())?;
    let native = window.window().context("window was not created")?;
    let context = Arc::new(VulkanContext::new(native, native).context("vulkan init")?);
    let mut renderer = Renderer::new(context.clone(), &mut window, cfg.renderer_config())
        .context("renderer init")?;

    let mut presented: u64 = 0;
    let mut frames: u32 = 0;
    let mut last_fps_instant = Instant::now();
    let mut paused = false;

    while window.poll_events() {
        let now_paused = window.extent().is_degenerate();
        if paused != now_paused {
            paused = now_paused;
            info!("paused={paused}");
        }
        if paused {
            // Minimized: sleep until the window changes.
            window.wait_events();
            frames = 0;
            continue;
        }

        match draw_frame(&mut renderer, &mut window) {
            Ok(true) => {
                frames = frames.saturating_add(1);
                presented += 1;
            }
            Ok(false) => {}
            Err(RenderError::WindowClosed) => break,
            Err(e) => return Err(e.into()),
        }

        if args.max_frames.is_some_and(|max| presented >= max) {
            break;
        }

        let now = Instant::now();
        if now.duration_since(last_fps_instant).as_secs_f32() >= 1.0 {
            info!("fps ~ {frames}");
            frames = 0;
            last_fps_instant = now;
        }
    }

    info!("exiting after {presented} frames");
    // Renderer waits for the device and releases the swapchain before the
    // context goes away.
    drop(renderer);
    drop(context);
    Ok(())
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    if let Err(e) = run(args) {
        error!("fatal: {e:#}");
        return Err(e);
    }
    Ok(())
}
