// SPDX-License-Identifier: CEPL-1.0
//! Vulkan presentation engine and frame scheduler.
//!
//! [`SwapChain`] owns everything tied to the surface's images; [`Renderer`]
//! drives frames across it and rebuilds it when the surface goes stale.
//! Both are generic over [`DeviceContext`], implemented for real hardware by
//! [`VulkanContext`].

mod context;
mod device;
mod error;
mod renderer;
mod select;
mod swapchain;

#[cfg(test)]
mod mock;

pub use context::VulkanContext;
pub use device::{DeviceContext, QueueFamilies, Submission, SurfaceSupport};
pub use error::{RenderError, Result};
pub use renderer::{FrameState, Renderer, RendererConfig, DEFAULT_CLEAR_COLOR};
pub use select::{
    choose_extent, choose_image_count, choose_present_mode, choose_surface_format,
    find_depth_format, find_supported_format, PresentPolicy, VsyncMode,
    DEPTH_FORMAT_CANDIDATES, SURFACE_FORMAT_PREFERENCES,
};
pub use swapchain::{AcquireOutcome, PresentOutcome, SwapChain, MAX_FRAMES_IN_FLIGHT};

pub use ash::vk;
