// SPDX-License-Identifier: CEPL-1.0
//! Frame scheduler. Drives acquire, record, submit and present on top of a
//! [`SwapChain`] and decides when the swapchain has to be rebuilt.
//!
//! A frame moves through `Idle -> Recording -> InRenderPass -> Recording ->
//! Idle`. Calls made out of order return [`RenderError::Contract`].

use std::sync::Arc;

use ash::vk;
use lumen_render::{RenderSize, SurfaceWindow};
use tracing::{debug, info};

use crate::device::DeviceContext;
use crate::error::{RenderError, Result};
use crate::select::PresentPolicy;
use crate::swapchain::{AcquireOutcome, PresentOutcome, SwapChain, MAX_FRAMES_IN_FLIGHT};

pub const DEFAULT_CLEAR_COLOR: [f32; 4] = [0.01, 0.01, 0.01, 1.0];

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RendererConfig {
    pub clear_color: [f32; 4],
    pub present: PresentPolicy,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            clear_color: DEFAULT_CLEAR_COLOR,
            present: PresentPolicy::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    Recording,
    InRenderPass,
}

pub struct Renderer<D: DeviceContext> {
    device: Arc<D>,
    swapchain: SwapChain<D>,
    command_buffers: Vec<vk::CommandBuffer>,
    config: RendererConfig,
    current_image_index: u32,
    current_frame_index: usize,
    state: FrameState,
}

fn to_extent(size: RenderSize) -> vk::Extent2D {
    vk::Extent2D {
        width: size.width,
        height: size.height,
    }
}

/// Command buffers are indexed by frame slot but the pool tracks the image
/// count, so it never shrinks below either.
fn command_pool_size(image_count: usize) -> usize {
    image_count.max(MAX_FRAMES_IN_FLIGHT)
}

/// Blocks on window events until the drawable area is non-empty. Gives up
/// with [`RenderError::WindowClosed`] if the window closes first.
fn wait_for_drawable_extent(window: &mut impl SurfaceWindow) -> Result<RenderSize> {
    let mut size = window.extent();
    if size.is_degenerate() {
        info!("window is minimized, waiting for a drawable extent");
    }
    while size.is_degenerate() {
        if window.close_requested() {
            return Err(RenderError::WindowClosed);
        }
        window.wait_events();
        size = window.extent();
    }
    Ok(size)
}

impl<D: DeviceContext> Renderer<D> {
    pub fn new(device: Arc<D>, window: &mut impl SurfaceWindow, config: RendererConfig) -> Result<Self> {
        let size = wait_for_drawable_extent(window)?;
        let swapchain = SwapChain::new(device.clone(), to_extent(size), &config.present, None)?;

        let count = command_pool_size(swapchain.image_count());
        let command_buffers = unsafe { device.allocate_command_buffers(count as u32) }
            .map_err(RenderError::creation("command buffers"))?;

        Ok(Self {
            device,
            swapchain,
            command_buffers,
            config,
            current_image_index: 0,
            current_frame_index: 0,
            state: FrameState::Idle,
        })
    }

    /// Starts a frame. Returns `None` when the swapchain was out of date and
    /// has been rebuilt; the caller should skip this frame.
    pub fn begin_frame(
        &mut self,
        window: &mut impl SurfaceWindow,
    ) -> Result<Option<vk::CommandBuffer>> {
        if self.state != FrameState::Idle {
            return Err(RenderError::Contract(
                "begin_frame called while a frame is already in progress",
            ));
        }

        match self.swapchain.acquire_next_image(self.current_frame_index)? {
            AcquireOutcome::OutOfDate => {
                debug!("acquire reported out-of-date swapchain");
                self.recreate_swapchain(window)?;
                return Ok(None);
            }
            AcquireOutcome::Ready {
                image_index,
                suboptimal,
            } => {
                if suboptimal {
                    debug!("acquired image {image_index} is suboptimal, rebuilding after present");
                }
                self.current_image_index = image_index;
            }
        }

        let cmd = self.command_buffers[self.current_frame_index];
        unsafe { self.device.begin_command_buffer(cmd) }
            .map_err(RenderError::vulkan("begin command buffer"))?;
        self.state = FrameState::Recording;
        Ok(Some(cmd))
    }

    /// Ends recording, submits and presents. Rebuilds the swapchain when
    /// presentation reports it stale or the window was resized.
    pub fn end_frame(&mut self, window: &mut impl SurfaceWindow) -> Result<()> {
        match self.state {
            FrameState::Idle => {
                return Err(RenderError::Contract(
                    "end_frame called while no frame is in progress",
                ))
            }
            FrameState::InRenderPass => {
                return Err(RenderError::Contract(
                    "end_frame called with the swapchain render pass still open",
                ))
            }
            FrameState::Recording => {}
        }
        self.state = FrameState::Idle;

        let cmd = self.command_buffers[self.current_frame_index];
        unsafe { self.device.end_command_buffer(cmd) }
            .map_err(RenderError::vulkan("end command buffer"))?;

        let outcome = self.swapchain.submit_command_buffer(
            cmd,
            self.current_image_index,
            self.current_frame_index,
        )?;

        let resized = window.was_resized();
        if outcome != PresentOutcome::Presented || resized {
            debug!("rebuilding swapchain after present ({outcome:?}, resized={resized})");
            window.reset_resized_flag();
            self.recreate_swapchain(window)?;
        }

        self.current_frame_index = (self.current_frame_index + 1) % MAX_FRAMES_IN_FLIGHT;
        Ok(())
    }

    fn check_recording(&self, cmd: vk::CommandBuffer, expected: FrameState) -> Result<()> {
        if self.state == FrameState::Idle {
            return Err(RenderError::Contract("no frame is in progress"));
        }
        if cmd != self.command_buffers[self.current_frame_index] {
            return Err(RenderError::Contract(
                "command buffer does not belong to the current frame",
            ));
        }
        if self.state != expected {
            return Err(RenderError::Contract(match expected {
                FrameState::Recording => "swapchain render pass is already open",
                _ => "swapchain render pass is not open",
            }));
        }
        Ok(())
    }

    /// Opens the swapchain render pass on the current image and sets a
    /// full-extent viewport and scissor.
    pub fn begin_swapchain_render_pass(&mut self, cmd: vk::CommandBuffer) -> Result<()> {
        self.check_recording(cmd, FrameState::Recording)?;

        let framebuffer = self
            .swapchain
            .framebuffer(self.current_image_index as usize)
            .ok_or(RenderError::ImageIndexOutOfRange {
                index: self.current_image_index,
                count: self.swapchain.image_count(),
            })?;
        let extent = self.swapchain.extent();
        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: self.config.clear_color,
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
        ];
        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };
        let begin = vk::RenderPassBeginInfo::default()
            .render_pass(self.swapchain.render_pass())
            .framebuffer(framebuffer)
            .render_area(render_area)
            .clear_values(&clear_values);
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };

        unsafe {
            self.device.cmd_begin_render_pass(cmd, &begin);
            self.device.cmd_set_viewport(cmd, viewport);
            self.device.cmd_set_scissor(cmd, render_area);
        }
        self.state = FrameState::InRenderPass;
        Ok(())
    }

    pub fn end_swapchain_render_pass(&mut self, cmd: vk::CommandBuffer) -> Result<()> {
        self.check_recording(cmd, FrameState::InRenderPass)?;
        unsafe { self.device.cmd_end_render_pass(cmd) };
        self.state = FrameState::Recording;
        Ok(())
    }

    /// Rebuilds the swapchain for the window's current extent, waiting out a
    /// minimized window first. Format changes are fatal.
    pub fn recreate_swapchain(&mut self, window: &mut impl SurfaceWindow) -> Result<()> {
        let size = wait_for_drawable_extent(window)?;
        unsafe { self.device.wait_idle() }.map_err(RenderError::vulkan("device wait idle"))?;

        let next = SwapChain::new(
            self.device.clone(),
            to_extent(size),
            &self.config.present,
            Some(&self.swapchain),
        )?;
        if !self.swapchain.compare_formats(&next) {
            return Err(RenderError::FormatMismatch {
                old_color: self.swapchain.color_format(),
                new_color: next.color_format(),
                old_depth: self.swapchain.depth_format(),
                new_depth: next.depth_format(),
            });
        }
        let previous = std::mem::replace(&mut self.swapchain, next);
        drop(previous);

        let wanted = command_pool_size(self.swapchain.image_count());
        if wanted != self.command_buffers.len() {
            self.reallocate_command_buffers(wanted)?;
        }

        info!(
            "swapchain recreated at {}x{} with {} images",
            self.swapchain.width(),
            self.swapchain.height(),
            self.swapchain.image_count()
        );
        Ok(())
    }

    fn reallocate_command_buffers(&mut self, count: usize) -> Result<()> {
        unsafe {
            self.device.free_command_buffers(&self.command_buffers);
            self.command_buffers.clear();
            self.command_buffers = self
                .device
                .allocate_command_buffers(count as u32)
                .map_err(RenderError::creation("command buffers"))?;
        }
        debug!("reallocated {count} command buffers");
        Ok(())
    }

    pub fn current_command_buffer(&self) -> Result<vk::CommandBuffer> {
        if self.state == FrameState::Idle {
            return Err(RenderError::Contract(
                "no command buffer while no frame is in progress",
            ));
        }
        Ok(self.command_buffers[self.current_frame_index])
    }

    pub fn is_frame_in_progress(&self) -> bool {
        self.state != FrameState::Idle
    }

    pub fn frame_state(&self) -> FrameState {
        self.state
    }

    /// Frame slot in `0..MAX_FRAMES_IN_FLIGHT` used by the next or current frame.
    pub fn frame_index(&self) -> usize {
        self.current_frame_index
    }

    pub fn swapchain(&self) -> &SwapChain<D> {
        &self.swapchain
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.swapchain.render_pass()
    }

    pub fn swapchain_extent(&self) -> vk::Extent2D {
        self.swapchain.extent()
    }

    pub fn aspect_ratio(&self) -> f32 {
        self.swapchain.extent_aspect_ratio()
    }

    pub fn image_count(&self) -> usize {
        self.swapchain.image_count()
    }

    pub fn clear_color(&self) -> [f32; 4] {
        self.config.clear_color
    }

    #[cfg(test)]
    pub(crate) fn command_buffer_count(&self) -> usize {
        self.command_buffers.len()
    }
}

impl<D: DeviceContext> Drop for Renderer<D> {
    fn drop(&mut self) {
        unsafe {
            // Nothing may be in flight when the swapchain is torn down after this.
            self.device.wait_idle().ok();
            if !self.command_buffers.is_empty() {
                self.device.free_command_buffers(&self.command_buffers);
            }
        }
    }
}

#[cfg(test)]
#[path = "renderer_tests.rs"]
mod tests;
