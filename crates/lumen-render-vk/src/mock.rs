// SPDX-License-Identifier: CEPL-1.0
//! In-memory device and window for GPU-free tests.
//!
//! `MockDevice` hands out unique handles, tracks which objects are alive,
//! simulates fences with a `Condvar` so another thread can play the GPU,
//! and records every queue-level call for ordering assertions.

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard};

use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use lumen_render::{RenderSize, SurfaceWindow};

use crate::device::{DeviceContext, QueueFamilies, Submission, SurfaceSupport};

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Call {
    CreateSwapchain {
        handle: vk::SwapchainKHR,
        old: vk::SwapchainKHR,
        extent: vk::Extent2D,
        min_image_count: u32,
        sharing_mode: vk::SharingMode,
        present_mode: vk::PresentModeKHR,
    },
    DestroySwapchain(vk::SwapchainKHR),
    CreateImage {
        extent: vk::Extent3D,
        format: vk::Format,
    },
    CreateFramebuffer {
        width: u32,
        height: u32,
        attachments: u32,
    },
    WaitFence(vk::Fence),
    ResetFence(vk::Fence),
    Acquire {
        swapchain: vk::SwapchainKHR,
        semaphore: vk::Semaphore,
    },
    Submit(Submission),
    Present {
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    },
    WaitIdle,
    AllocateCommandBuffers(u32),
    FreeCommandBuffers(usize),
    BeginCommandBuffer(vk::CommandBuffer),
    EndCommandBuffer(vk::CommandBuffer),
    BeginRenderPass {
        cmd: vk::CommandBuffer,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        clear_color: [f32; 4],
        clear_depth: f32,
        clear_stencil: u32,
    },
    EndRenderPass(vk::CommandBuffer),
    SetViewport {
        cmd: vk::CommandBuffer,
        width: f32,
        height: f32,
        min_depth: f32,
        max_depth: f32,
    },
    SetScissor {
        cmd: vk::CommandBuffer,
        extent: vk::Extent2D,
    },
}

struct State {
    next_handle: u64,
    support: SurfaceSupport,
    families: QueueFamilies,
    depth_formats: Vec<vk::Format>,
    live: HashMap<u64, &'static str>,
    fences: HashMap<vk::Fence, bool>,
    swapchain_images: HashMap<vk::SwapchainKHR, u32>,
    next_image: HashMap<vk::SwapchainKHR, u32>,
    auto_signal: bool,
    acquire_script: VecDeque<VkResult<(u32, bool)>>,
    present_script: VecDeque<VkResult<bool>>,
    failures: HashMap<&'static str, u32>,
    calls: Vec<Call>,
}

impl State {
    fn alloc<H: Handle>(&mut self, kind: &'static str) -> VkResult<H> {
        if self.should_fail(kind) {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        self.next_handle += 1;
        self.live.insert(self.next_handle, kind);
        Ok(H::from_raw(self.next_handle))
    }

    fn release<H: Handle>(&mut self, handle: H, kind: &'static str) {
        let raw = handle.as_raw();
        match self.live.remove(&raw) {
            Some(found) => assert_eq!(found, kind, "handle {raw} destroyed as the wrong kind"),
            None => panic!("{kind} {raw} destroyed twice or never created"),
        }
    }

    fn should_fail(&mut self, kind: &'static str) -> bool {
        let Some(remaining) = self.failures.get_mut(kind) else {
            return false;
        };
        if *remaining > 1 {
            *remaining -= 1;
            return false;
        }
        self.failures.remove(kind);
        true
    }
}

pub(crate) struct MockDevice {
    state: Mutex<State>,
    fence_signaled: Condvar,
}

impl MockDevice {
    /// Free-size surface (min 2 images, max 8), BGRA sRGB, FIFO + MAILBOX,
    /// D32 depth, one shared queue family. Submissions complete instantly.
    pub fn new() -> Self {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 8,
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            ..Default::default()
        };
        let support = SurfaceSupport {
            capabilities,
            formats: vec![
                vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_UNORM,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                },
                vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_SRGB,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                },
            ],
            present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
        };
        Self {
            state: Mutex::new(State {
                next_handle: 0,
                support,
                families: QueueFamilies {
                    graphics: 0,
                    present: 0,
                },
                depth_formats: vec![vk::Format::D32_SFLOAT],
                live: HashMap::new(),
                fences: HashMap::new(),
                swapchain_images: HashMap::new(),
                next_image: HashMap::new(),
                auto_signal: true,
                acquire_script: VecDeque::new(),
                present_script: VecDeque::new(),
                failures: HashMap::new(),
                calls: Vec::new(),
            }),
            fence_signaled: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    // --- configuration ---

    pub fn set_image_limits(&self, min: u32, max: u32) {
        let mut s = self.lock();
        s.support.capabilities.min_image_count = min;
        s.support.capabilities.max_image_count = max;
    }

    pub fn set_current_extent(&self, width: u32, height: u32) {
        self.lock().support.capabilities.current_extent = vk::Extent2D { width, height };
    }

    pub fn set_formats(&self, formats: Vec<vk::SurfaceFormatKHR>) {
        self.lock().support.formats = formats;
    }

    pub fn set_present_modes(&self, modes: Vec<vk::PresentModeKHR>) {
        self.lock().support.present_modes = modes;
    }

    pub fn set_depth_formats(&self, formats: Vec<vk::Format>) {
        self.lock().depth_formats = formats;
    }

    pub fn set_queue_families(&self, graphics: u32, present: u32) {
        self.lock().families = QueueFamilies { graphics, present };
    }

    /// When off, submitted fences stay unsignaled until `signal_fence`.
    pub fn set_auto_signal(&self, on: bool) {
        self.lock().auto_signal = on;
    }

    pub fn script_acquire(&self, result: VkResult<(u32, bool)>) {
        self.lock().acquire_script.push_back(result);
    }

    pub fn script_present(&self, result: VkResult<bool>) {
        self.lock().present_script.push_back(result);
    }

    /// The `nth` next creation of `kind` fails with out-of-device-memory.
    pub fn fail_nth(&self, kind: &'static str, nth: u32) {
        self.lock().failures.insert(kind, nth);
    }

    // --- GPU side ---

    pub fn signal_fence(&self, fence: vk::Fence) {
        let mut s = self.lock();
        if let Some(signaled) = s.fences.get_mut(&fence) {
            *signaled = true;
        }
        self.fence_signaled.notify_all();
    }

    pub fn fence_is_signaled(&self, fence: vk::Fence) -> bool {
        self.lock().fences.get(&fence).copied().unwrap_or(false)
    }

    // --- inspection ---

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn live_count(&self) -> usize {
        self.lock().live.len()
    }

    pub fn live_of(&self, kind: &str) -> usize {
        self.lock().live.values().filter(|k| **k == kind).count()
    }

    pub fn created_swapchains(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, Call::CreateSwapchain { .. }))
            .collect()
    }

    fn record(&self, call: Call) {
        self.lock().calls.push(call);
    }
}

impl DeviceContext for MockDevice {
    fn surface_support(&self) -> VkResult<SurfaceSupport> {
        Ok(self.lock().support.clone())
    }

    fn queue_families(&self) -> QueueFamilies {
        self.lock().families
    }

    fn format_properties(&self, format: vk::Format) -> vk::FormatProperties {
        let mut props = vk::FormatProperties::default();
        if self.lock().depth_formats.contains(&format) {
            props.optimal_tiling_features = vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT;
        }
        props
    }

    unsafe fn create_swapchain(
        &self,
        info: &vk::SwapchainCreateInfoKHR<'_>,
    ) -> VkResult<vk::SwapchainKHR> {
        let mut s = self.lock();
        let handle: vk::SwapchainKHR = s.alloc("swapchain")?;
        s.swapchain_images.insert(handle, info.min_image_count);
        s.calls.push(Call::CreateSwapchain {
            handle,
            old: info.old_swapchain,
            extent: info.image_extent,
            min_image_count: info.min_image_count,
            sharing_mode: info.image_sharing_mode,
            present_mode: info.present_mode,
        });
        Ok(handle)
    }

    unsafe fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>> {
        let mut s = self.lock();
        let count = s.swapchain_images.get(&swapchain).copied().unwrap_or(0);
        Ok((0..count)
            .map(|_| {
                // Owned by the swapchain, so not tracked as live.
                s.next_handle += 1;
                vk::Image::from_raw(s.next_handle)
            })
            .collect())
    }

    unsafe fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut s = self.lock();
        s.release(swapchain, "swapchain");
        s.swapchain_images.remove(&swapchain);
        s.calls.push(Call::DestroySwapchain(swapchain));
    }

    unsafe fn create_image_view(
        &self,
        _info: &vk::ImageViewCreateInfo<'_>,
    ) -> VkResult<vk::ImageView> {
        self.lock().alloc("image_view")
    }

    unsafe fn destroy_image_view(&self, view: vk::ImageView) {
        self.lock().release(view, "image_view");
    }

    unsafe fn create_image_with_info(
        &self,
        info: &vk::ImageCreateInfo<'_>,
        _properties: vk::MemoryPropertyFlags,
    ) -> VkResult<(vk::Image, vk::DeviceMemory)> {
        let mut s = self.lock();
        let image: vk::Image = s.alloc("image")?;
        let memory = match s.alloc::<vk::DeviceMemory>("memory") {
            Ok(memory) => memory,
            Err(e) => {
                s.release(image, "image");
                return Err(e);
            }
        };
        s.calls.push(Call::CreateImage {
            extent: info.extent,
            format: info.format,
        });
        Ok((image, memory))
    }

    unsafe fn destroy_image(&self, image: vk::Image, memory: vk::DeviceMemory) {
        let mut s = self.lock();
        s.release(image, "image");
        s.release(memory, "memory");
    }

    unsafe fn create_render_pass(
        &self,
        _info: &vk::RenderPassCreateInfo<'_>,
    ) -> VkResult<vk::RenderPass> {
        self.lock().alloc("render_pass")
    }

    unsafe fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        self.lock().release(render_pass, "render_pass");
    }

    unsafe fn create_framebuffer(
        &self,
        info: &vk::FramebufferCreateInfo<'_>,
    ) -> VkResult<vk::Framebuffer> {
        let mut s = self.lock();
        let fb = s.alloc("framebuffer")?;
        s.calls.push(Call::CreateFramebuffer {
            width: info.width,
            height: info.height,
            attachments: info.attachment_count,
        });
        Ok(fb)
    }

    unsafe fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        self.lock().release(framebuffer, "framebuffer");
    }

    unsafe fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        self.lock().alloc("semaphore")
    }

    unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.lock().release(semaphore, "semaphore");
    }

    unsafe fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let mut s = self.lock();
        let fence = s.alloc("fence")?;
        s.fences.insert(fence, signaled);
        Ok(fence)
    }

    unsafe fn destroy_fence(&self, fence: vk::Fence) {
        let mut s = self.lock();
        s.release(fence, "fence");
        s.fences.remove(&fence);
    }

    unsafe fn wait_for_fence(&self, fence: vk::Fence) -> VkResult<()> {
        let mut s = self.lock();
        s.calls.push(Call::WaitFence(fence));
        while !s.fences.get(&fence).copied().unwrap_or(true) {
            s = self.fence_signaled.wait(s).unwrap();
        }
        Ok(())
    }

    unsafe fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        let mut s = self.lock();
        s.calls.push(Call::ResetFence(fence));
        match s.fences.get_mut(&fence) {
            Some(signaled) => {
                *signaled = false;
                Ok(())
            }
            None => Err(vk::Result::ERROR_DEVICE_LOST),
        }
    }

    unsafe fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        signal: vk::Semaphore,
    ) -> VkResult<(u32, bool)> {
        let mut s = self.lock();
        s.calls.push(Call::Acquire {
            swapchain,
            semaphore: signal,
        });
        if let Some(scripted) = s.acquire_script.pop_front() {
            return scripted;
        }
        let count = s.swapchain_images.get(&swapchain).copied().unwrap_or(0);
        if count == 0 {
            return Err(vk::Result::ERROR_SURFACE_LOST_KHR);
        }
        let next = s.next_image.entry(swapchain).or_insert(0);
        let index = *next;
        *next = (index + 1) % count;
        Ok((index, false))
    }

    unsafe fn queue_submit(&self, submission: &Submission) -> VkResult<()> {
        let mut s = self.lock();
        s.calls.push(Call::Submit(*submission));
        if s.auto_signal {
            if let Some(signaled) = s.fences.get_mut(&submission.fence) {
                *signaled = true;
            }
            self.fence_signaled.notify_all();
        }
        Ok(())
    }

    unsafe fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> VkResult<bool> {
        let mut s = self.lock();
        s.calls.push(Call::Present {
            swapchain,
            image_index,
            wait,
        });
        s.present_script.pop_front().unwrap_or(Ok(false))
    }

    unsafe fn wait_idle(&self) -> VkResult<()> {
        self.record(Call::WaitIdle);
        Ok(())
    }

    unsafe fn allocate_command_buffers(&self, count: u32) -> VkResult<Vec<vk::CommandBuffer>> {
        let mut s = self.lock();
        s.calls.push(Call::AllocateCommandBuffers(count));
        (0..count).map(|_| s.alloc("command_buffer")).collect()
    }

    unsafe fn free_command_buffers(&self, buffers: &[vk::CommandBuffer]) {
        let mut s = self.lock();
        for &cmd in buffers {
            s.release(cmd, "command_buffer");
        }
        s.calls.push(Call::FreeCommandBuffers(buffers.len()));
    }

    unsafe fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        self.record(Call::BeginCommandBuffer(cmd));
        Ok(())
    }

    unsafe fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        self.record(Call::EndCommandBuffer(cmd));
        Ok(())
    }

    unsafe fn cmd_begin_render_pass(
        &self,
        cmd: vk::CommandBuffer,
        info: &vk::RenderPassBeginInfo<'_>,
    ) {
        let clears =
            std::slice::from_raw_parts(info.p_clear_values, info.clear_value_count as usize);
        self.record(Call::BeginRenderPass {
            cmd,
            framebuffer: info.framebuffer,
            extent: info.render_area.extent,
            clear_color: clears[0].color.float32,
            clear_depth: clears[1].depth_stencil.depth,
            clear_stencil: clears[1].depth_stencil.stencil,
        });
    }

    unsafe fn cmd_end_render_pass(&self, cmd: vk::CommandBuffer) {
        self.record(Call::EndRenderPass(cmd));
    }

    unsafe fn cmd_set_viewport(&self, cmd: vk::CommandBuffer, viewport: vk::Viewport) {
        self.record(Call::SetViewport {
            cmd,
            width: viewport.width,
            height: viewport.height,
            min_depth: viewport.min_depth,
            max_depth: viewport.max_depth,
        });
    }

    unsafe fn cmd_set_scissor(&self, cmd: vk::CommandBuffer, scissor: vk::Rect2D) {
        self.record(Call::SetScissor {
            cmd,
            extent: scissor.extent,
        });
    }
}

/// Window whose size changes only when a test says so. `wait_events` moves
/// to the next queued size, if any.
pub(crate) struct MockWindow {
    pub size: RenderSize,
    pub resized: bool,
    pub queued_sizes: VecDeque<RenderSize>,
    pub wait_calls: usize,
    pub closed: bool,
    /// Close the window on this `wait_events` call (1-based).
    pub close_on_wait: Option<usize>,
}

impl MockWindow {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            size: RenderSize::new(width, height),
            resized: false,
            queued_sizes: VecDeque::new(),
            wait_calls: 0,
            closed: false,
            close_on_wait: None,
        }
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        self.size = RenderSize::new(width, height);
        self.resized = true;
    }
}

impl SurfaceWindow for MockWindow {
    fn extent(&self) -> RenderSize {
        self.size
    }

    fn was_resized(&self) -> bool {
        self.resized
    }

    fn reset_resized_flag(&mut self) {
        self.resized = false;
    }

    fn close_requested(&self) -> bool {
        self.closed
    }

    fn wait_events(&mut self) {
        self.wait_calls += 1;
        assert!(self.wait_calls < 1_000, "window never became drawable");
        if self.close_on_wait == Some(self.wait_calls) {
            self.closed = true;
        }
        if let Some(next) = self.queued_sizes.pop_front() {
            self.size = next;
        }
    }
}
