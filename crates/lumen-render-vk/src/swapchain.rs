// SPDX-License-Identifier: CEPL-1.0
//! Presentation engine: the swapchain images, their depth buffers and
//! framebuffers, the render pass, and the per-frame-slot sync objects.
//!
//! ```text
//!   frame slot f                         image i
//!   ------------                         -------
//!   wait in_flight[f]            (acquire_next_image)
//!   acquire -> signal image_available[f]
//!                                        wait images_in_flight[i] if owned
//!                                        images_in_flight[i] = in_flight[f]
//!   reset in_flight[f]
//!   submit: wait image_available[f]
//!           signal render_finished[f], fence in_flight[f]
//!   present i: wait render_finished[f]
//! ```
//!
//! Fences are the only primitive the CPU observes. A slot fence starts
//! signaled so the first acquire on each slot does not block.

use std::sync::Arc;

use ash::vk;
use tracing::{debug, info};

use crate::device::{DeviceContext, Submission};
use crate::error::{RenderError, Result};
use crate::select::{
    choose_extent, choose_image_count, choose_present_mode, choose_surface_format,
    find_depth_format, PresentPolicy,
};

/// Number of frames the CPU may record ahead of the GPU.
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireOutcome {
    Ready { image_index: u32, suboptimal: bool },
    /// The surface changed; the swapchain must be rebuilt before rendering.
    OutOfDate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    Suboptimal,
    OutOfDate,
}

#[derive(Clone, Copy, Debug, Default)]
struct DepthAttachment {
    image: vk::Image,
    memory: vk::DeviceMemory,
    view: vk::ImageView,
}

#[derive(Clone, Copy, Debug, Default)]
struct FrameSync {
    image_available: vk::Semaphore,
    render_finished: vk::Semaphore,
    in_flight: vk::Fence,
}

pub struct SwapChain<D: DeviceContext> {
    device: Arc<D>,
    swapchain: vk::SwapchainKHR,
    color_format: vk::Format,
    color_space: vk::ColorSpaceKHR,
    depth_format: vk::Format,
    present_mode: vk::PresentModeKHR,
    extent: vk::Extent2D,

    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    depth: Vec<DepthAttachment>,
    render_pass: vk::RenderPass,
    framebuffers: Vec<vk::Framebuffer>,

    frames: Vec<FrameSync>,
    images_in_flight: Vec<Option<vk::Fence>>,
}

impl<D: DeviceContext> SwapChain<D> {
    /// Builds a complete swapchain for `window_extent`.
    ///
    /// When `previous` is given its handle is passed as `old_swapchain` so the
    /// driver can recycle resources. The borrow ends when this returns; the
    /// caller still owns and drops the previous instance.
    ///
    /// On failure every object created so far is destroyed before the error
    /// is returned.
    pub fn new(
        device: Arc<D>,
        window_extent: vk::Extent2D,
        policy: &PresentPolicy,
        previous: Option<&SwapChain<D>>,
    ) -> Result<Self> {
        let support = device
            .surface_support()
            .map_err(RenderError::vulkan("query surface support"))?;
        let surface_format = choose_surface_format(&support.formats)?;
        let present_mode = choose_present_mode(&support.present_modes, policy.priority());
        let extent = choose_extent(&support.capabilities, window_extent);
        let min_image_count = choose_image_count(&support.capabilities);
        let depth_format = find_depth_format(|format| device.format_properties(format))?;

        let mut chain = Self {
            device,
            swapchain: vk::SwapchainKHR::null(),
            color_format: surface_format.format,
            color_space: surface_format.color_space,
            depth_format,
            present_mode,
            extent,
            images: Vec::new(),
            image_views: Vec::new(),
            depth: Vec::new(),
            render_pass: vk::RenderPass::null(),
            framebuffers: Vec::new(),
            frames: Vec::new(),
            images_in_flight: Vec::new(),
        };

        let old_swapchain = previous.map_or(vk::SwapchainKHR::null(), |p| p.swapchain);
        chain.create_swapchain(&support.capabilities, min_image_count, old_swapchain)?;
        chain.create_image_views()?;
        chain.create_render_pass()?;
        chain.create_depth_resources()?;
        chain.create_framebuffers()?;
        chain.create_sync_objects()?;

        info!(
            "swapchain ready: {}x{}, format {:?} / {:?}, depth {:?}, present_mode {:?}, images {} (min {})",
            chain.extent.width,
            chain.extent.height,
            chain.color_format,
            chain.color_space,
            chain.depth_format,
            chain.present_mode,
            chain.images.len(),
            support.capabilities.min_image_count,
        );
        Ok(chain)
    }

    fn create_swapchain(
        &mut self,
        caps: &vk::SurfaceCapabilitiesKHR,
        min_image_count: u32,
        old_swapchain: vk::SwapchainKHR,
    ) -> Result<()> {
        let families = self.device.queue_families();
        let family_indices = [families.graphics, families.present];
        let shared_families: &[u32] = if families.is_shared() {
            &[]
        } else {
            &family_indices
        };
        let sharing_mode = if shared_families.is_empty() {
            vk::SharingMode::EXCLUSIVE
        } else {
            vk::SharingMode::CONCURRENT
        };

        let info = vk::SwapchainCreateInfoKHR::default()
            .min_image_count(min_image_count)
            .image_format(self.color_format)
            .image_color_space(self.color_space)
            .image_extent(self.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(shared_families)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(self.present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        unsafe {
            self.swapchain = self
                .device
                .create_swapchain(&info)
                .map_err(RenderError::creation("swapchain"))?;
            self.images = self
                .device
                .swapchain_images(self.swapchain)
                .map_err(RenderError::vulkan("get swapchain images"))?;
        }
        Ok(())
    }

    fn create_image_views(&mut self) -> Result<()> {
        self.image_views.reserve(self.images.len());
        for &image in &self.images {
            let info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(self.color_format)
                .subresource_range(subresource_range(vk::ImageAspectFlags::COLOR));
            let view = unsafe { self.device.create_image_view(&info) }
                .map_err(RenderError::creation("swapchain image view"))?;
            self.image_views.push(view);
        }
        Ok(())
    }

    fn create_render_pass(&mut self) -> Result<()> {
        let attachments = [
            vk::AttachmentDescription::default()
                .format(self.color_format)
                .samples(vk::SampleCountFlags::TYPE_1)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::STORE)
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .final_layout(vk::ImageLayout::PRESENT_SRC_KHR),
            vk::AttachmentDescription::default()
                .format(self.depth_format)
                .samples(vk::SampleCountFlags::TYPE_1)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::DONT_CARE)
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
        ];
        let color_refs = [vk::AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        }];
        let depth_ref = vk::AttachmentReference {
            attachment: 1,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        };
        let subpasses = [vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs)
            .depth_stencil_attachment(&depth_ref)];

        // Earlier GPU work must finish with the attachments before this
        // subpass writes color or depth.
        let dependencies = [vk::SubpassDependency::default()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .src_access_mask(vk::AccessFlags::empty())
            .dst_stage_mask(
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            )
            .dst_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            )];

        let info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);
        self.render_pass = unsafe { self.device.create_render_pass(&info) }
            .map_err(RenderError::creation("render pass"))?;
        Ok(())
    }

    fn create_depth_resources(&mut self) -> Result<()> {
        self.depth.reserve(self.images.len());
        for _ in 0..self.images.len() {
            let info = vk::ImageCreateInfo::default()
                .image_type(vk::ImageType::TYPE_2D)
                .format(self.depth_format)
                .extent(vk::Extent3D {
                    width: self.extent.width,
                    height: self.extent.height,
                    depth: 1,
                })
                .mip_levels(1)
                .array_layers(1)
                .samples(vk::SampleCountFlags::TYPE_1)
                .tiling(vk::ImageTiling::OPTIMAL)
                .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
                .sharing_mode(vk::SharingMode::EXCLUSIVE)
                .initial_layout(vk::ImageLayout::UNDEFINED);
            let (image, memory) = unsafe {
                self.device
                    .create_image_with_info(&info, vk::MemoryPropertyFlags::DEVICE_LOCAL)
            }
            .map_err(RenderError::creation("depth image"))?;
            self.depth.push(DepthAttachment {
                image,
                memory,
                view: vk::ImageView::null(),
            });

            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(self.depth_format)
                .subresource_range(subresource_range(vk::ImageAspectFlags::DEPTH));
            let view = unsafe { self.device.create_image_view(&view_info) }
                .map_err(RenderError::creation("depth image view"))?;
            if let Some(slot) = self.depth.last_mut() {
                slot.view = view;
            }
        }
        Ok(())
    }

    fn create_framebuffers(&mut self) -> Result<()> {
        self.framebuffers.reserve(self.image_views.len());
        for (color, depth) in self.image_views.iter().zip(&self.depth) {
            let attachments = [*color, depth.view];
            let info = vk::FramebufferCreateInfo::default()
                .render_pass(self.render_pass)
                .attachments(&attachments)
                .width(self.extent.width)
                .height(self.extent.height)
                .layers(1);
            let framebuffer = unsafe { self.device.create_framebuffer(&info) }
                .map_err(RenderError::creation("framebuffer"))?;
            self.framebuffers.push(framebuffer);
        }
        Ok(())
    }

    fn create_sync_objects(&mut self) -> Result<()> {
        for _ in 0..MAX_FRAMES_IN_FLIGHT {
            self.frames.push(FrameSync::default());
            let slot = self.frames.len() - 1;
            unsafe {
                self.frames[slot].image_available = self
                    .device
                    .create_semaphore()
                    .map_err(RenderError::creation("image-available semaphore"))?;
                self.frames[slot].render_finished = self
                    .device
                    .create_semaphore()
                    .map_err(RenderError::creation("render-finished semaphore"))?;
                self.frames[slot].in_flight = self
                    .device
                    .create_fence(true)
                    .map_err(RenderError::creation("in-flight fence"))?;
            }
        }
        self.images_in_flight = vec![None; self.images.len()];
        Ok(())
    }

    fn frame(&self, frame_index: usize) -> Result<FrameSync> {
        self.frames
            .get(frame_index)
            .copied()
            .ok_or(RenderError::Contract("frame index out of range"))
    }

    fn check_image_index(&self, index: u32) -> Result<usize> {
        let slot = index as usize;
        if slot < self.images.len() {
            Ok(slot)
        } else {
            Err(RenderError::ImageIndexOutOfRange {
                index,
                count: self.images.len(),
            })
        }
    }

    /// Waits for frame slot `frame_index` to retire, then acquires the next
    /// presentable image. The wait has no timeout.
    pub fn acquire_next_image(&self, frame_index: usize) -> Result<AcquireOutcome> {
        let frame = self.frame(frame_index)?;
        unsafe { self.device.wait_for_fence(frame.in_flight) }
            .map_err(RenderError::vulkan("wait for in-flight fence"))?;

        match unsafe {
            self.device
                .acquire_next_image(self.swapchain, frame.image_available)
        } {
            Ok((image_index, suboptimal)) => {
                self.check_image_index(image_index)?;
                Ok(AcquireOutcome::Ready {
                    image_index,
                    suboptimal,
                })
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(result) => Err(RenderError::Vulkan {
                op: "acquire next image",
                result,
            }),
        }
    }

    /// Submits `cmd` for `image_index` using frame slot `frame_index`, then
    /// queues the image for presentation.
    ///
    /// Blocks first if an earlier frame still owns the image.
    pub fn submit_command_buffer(
        &mut self,
        cmd: vk::CommandBuffer,
        image_index: u32,
        frame_index: usize,
    ) -> Result<PresentOutcome> {
        let image = self.check_image_index(image_index)?;
        let frame = self.frame(frame_index)?;

        if let Some(owner) = self.images_in_flight[image] {
            unsafe { self.device.wait_for_fence(owner) }
                .map_err(RenderError::vulkan("wait for image fence"))?;
        }
        self.images_in_flight[image] = Some(frame.in_flight);

        let submission = Submission {
            command_buffer: cmd,
            wait_semaphore: frame.image_available,
            wait_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            signal_semaphore: frame.render_finished,
            fence: frame.in_flight,
        };
        unsafe {
            self.device
                .reset_fence(frame.in_flight)
                .map_err(RenderError::vulkan("reset in-flight fence"))?;
            self.device
                .queue_submit(&submission)
                .map_err(RenderError::vulkan("submit draw command buffer"))?;
        }

        let presented = unsafe {
            self.device
                .queue_present(self.swapchain, image_index, frame.render_finished)
        };
        match presented {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(result) => Err(RenderError::Vulkan {
                op: "present swapchain image",
                result,
            }),
        }
    }

    /// True when color and depth formats both match `other`.
    pub fn compare_formats(&self, other: &SwapChain<D>) -> bool {
        self.color_format == other.color_format && self.depth_format == other.depth_format
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    pub fn framebuffer(&self, index: usize) -> Option<vk::Framebuffer> {
        self.framebuffers.get(index).copied()
    }

    pub fn image_view(&self, index: usize) -> Option<vk::ImageView> {
        self.image_views.get(index).copied()
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn color_format(&self) -> vk::Format {
        self.color_format
    }

    pub fn depth_format(&self) -> vk::Format {
        self.depth_format
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn width(&self) -> u32 {
        self.extent.width
    }

    pub fn height(&self) -> u32 {
        self.extent.height
    }

    pub fn extent_aspect_ratio(&self) -> f32 {
        self.extent.width as f32 / self.extent.height as f32
    }

    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    #[cfg(test)]
    pub(crate) fn in_flight_fence(&self, frame_index: usize) -> vk::Fence {
        self.frames[frame_index].in_flight
    }

    #[cfg(test)]
    pub(crate) fn image_owner(&self, image_index: usize) -> Option<vk::Fence> {
        self.images_in_flight[image_index]
    }
}

// Teardown order:
// - framebuffers, then the render pass they reference
// - depth views, images and memory
// - swapchain image views, then the swapchain itself
// - per-slot semaphores and fences
// Null handles are skipped so a partially built chain unwinds cleanly.
// The caller must make sure the device is idle first.
impl<D: DeviceContext> Drop for SwapChain<D> {
    fn drop(&mut self) {
        unsafe {
            let d = &self.device;

            for &fb in &self.framebuffers {
                d.destroy_framebuffer(fb);
            }
            if self.render_pass != vk::RenderPass::null() {
                d.destroy_render_pass(self.render_pass);
            }

            for attachment in &self.depth {
                if attachment.view != vk::ImageView::null() {
                    d.destroy_image_view(attachment.view);
                }
                d.destroy_image(attachment.image, attachment.memory);
            }

            for &view in &self.image_views {
                d.destroy_image_view(view);
            }
            if self.swapchain != vk::SwapchainKHR::null() {
                d.destroy_swapchain(self.swapchain);
            }

            for frame in &self.frames {
                if frame.image_available != vk::Semaphore::null() {
                    d.destroy_semaphore(frame.image_available);
                }
                if frame.render_finished != vk::Semaphore::null() {
                    d.destroy_semaphore(frame.render_finished);
                }
                if frame.in_flight != vk::Fence::null() {
                    d.destroy_fence(frame.in_flight);
                }
            }
        }
        debug!("swapchain destroyed");
    }
}

fn subresource_range(aspect_mask: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

#[cfg(test)]
#[path = "swapchain_tests.rs"]
mod tests;
