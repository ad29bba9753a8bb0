// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
//! Winit window driven by pumping the event loop from the caller's frame
//! loop instead of handing control to `run_app`.

use std::time::Duration;

use anyhow::{bail, Result};
use lumen_render::{RenderSize, SurfaceWindow};
use tracing::{error, info};
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, EventLoop};
use winit::platform::pump_events::{EventLoopExtPumpEvents, PumpStatus};
use winit::window::{Window, WindowId};

pub use winit;

#[derive(Clone, Debug)]
pub struct WindowConfig {
    pub width: u32,
    pub height: u32,
    pub title: String,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            width: 800,
            height: 600,
            title: "lumen".to_owned(),
        }
    }
}

struct WindowState {
    config: WindowConfig,
    window: Option<Window>,
    size: RenderSize,
    resized: bool,
    close_requested: bool,
}

impl ApplicationHandler for WindowState {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }
        let attributes = Window::default_attributes()
            .with_title(self.config.title.clone())
            .with_inner_size(PhysicalSize::new(self.config.width, self.config.height))
            .with_resizable(true);
        match event_loop.create_window(attributes) {
            Ok(window) => {
                let size = window.inner_size();
                self.size = RenderSize::new(size.width, size.height);
                info!("window created ({}x{})", size.width, size.height);
                self.window = Some(window);
            }
            Err(e) => {
                error!("create_window failed: {e}");
                self.close_requested = true;
            }
        }
    }

    fn window_event(&mut self, _event_loop: &ActiveEventLoop, window_id: WindowId, event: WindowEvent) {
        if let Some(window) = &self.window {
            if window_id != window.id() {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("CloseRequested");
                self.close_requested = true;
            }
            WindowEvent::Resized(new_size) => {
                self.size = RenderSize::new(new_size.width, new_size.height);
                self.resized = true;
                info!("Resized → {}x{}", new_size.width, new_size.height);
            }
            _ => {}
        }
    }
}

/// A single resizable window plus the event loop that feeds it.
pub struct PlatformWindow {
    event_loop: EventLoop<()>,
    state: WindowState,
}

impl PlatformWindow {
    /// Opens the window and pumps events until it exists.
    pub fn new(config: WindowConfig) -> Result<Self> {
        let event_loop = EventLoop::new()?;
        let mut platform = Self {
            event_loop,
            state: WindowState {
                config,
                window: None,
                size: RenderSize::default(),
                resized: false,
                close_requested: false,
            },
        };

        while platform.state.window.is_none() {
            if let PumpStatus::Exit(code) = platform.pump(Some(Duration::from_millis(16))) {
                bail!("event loop exited with code {code} before the window opened");
            }
            if platform.state.close_requested {
                bail!("window creation failed");
            }
        }
        Ok(platform)
    }

    fn pump(&mut self, timeout: Option<Duration>) -> PumpStatus {
        self.event_loop.pump_app_events(timeout, &mut self.state)
    }

    /// Handles pending events without blocking. Returns `false` once the
    /// window should close.
    pub fn poll_events(&mut self) -> bool {
        if let PumpStatus::Exit(_) = self.pump(Some(Duration::ZERO)) {
            self.state.close_requested = true;
        }
        !self.state.close_requested
    }

    /// The native window, for surface creation.
    pub fn window(&self) -> Option<&Window> {
        self.state.window.as_ref()
    }
}

impl SurfaceWindow for PlatformWindow {
    fn extent(&self) -> RenderSize {
        self.state.size
    }

    fn was_resized(&self) -> bool {
        self.state.resized
    }

    fn reset_resized_flag(&mut self) {
        self.state.resized = false;
    }

    fn close_requested(&self) -> bool {
        self.state.close_requested
    }

    fn wait_events(&mut self) {
        if let PumpStatus::Exit(_) = self.pump(None) {
            self.state.close_requested = true;
        }
    }
}
