// SPDX-License-Identifier: CEPL-1.0
//! Swapchain parameter selection. Pure functions over the capability data a
//! surface reports, so they can be exercised without a GPU.

use ash::vk;

use crate::error::{RenderError, Result};

/// Color formats tried in order before falling back to whatever the surface
/// lists first.
pub const SURFACE_FORMAT_PREFERENCES: [vk::SurfaceFormatKHR; 2] = [
    vk::SurfaceFormatKHR {
        format: vk::Format::B8G8R8A8_SRGB,
        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
    },
    vk::SurfaceFormatKHR {
        format: vk::Format::R8G8B8A8_SRGB,
        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
    },
];

pub const DEPTH_FORMAT_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VsyncMode {
    Fifo,
    #[default]
    Mailbox,
}

/// How present modes are ranked when a swapchain is built.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PresentPolicy {
    pub vsync: bool,
    pub vsync_mode: VsyncMode,
}

impl Default for PresentPolicy {
    fn default() -> Self {
        Self {
            vsync: true,
            vsync_mode: VsyncMode::Mailbox,
        }
    }
}

impl PresentPolicy {
    pub fn priority(&self) -> &'static [vk::PresentModeKHR] {
        const NO_VSYNC: &[vk::PresentModeKHR] = &[
            vk::PresentModeKHR::IMMEDIATE,
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::FIFO,
        ];
        const MAILBOX: &[vk::PresentModeKHR] =
            &[vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::FIFO];
        const FIFO: &[vk::PresentModeKHR] = &[vk::PresentModeKHR::FIFO];

        match (self.vsync, self.vsync_mode) {
            (false, _) => NO_VSYNC,
            (true, VsyncMode::Mailbox) => MAILBOX,
            (true, VsyncMode::Fifo) => FIFO,
        }
    }
}

pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Result<vk::SurfaceFormatKHR> {
    let first = formats.first().copied().ok_or(RenderError::NoSurfaceFormats)?;
    Ok(SURFACE_FORMAT_PREFERENCES
        .into_iter()
        .find(|want| {
            formats
                .iter()
                .any(|f| f.format == want.format && f.color_space == want.color_space)
        })
        .unwrap_or(first))
}

/// First mode of `priority` the surface offers. FIFO is always available.
pub fn choose_present_mode(
    available: &[vk::PresentModeKHR],
    priority: &[vk::PresentModeKHR],
) -> vk::PresentModeKHR {
    priority
        .iter()
        .copied()
        .find(|m| available.contains(m))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// A surface with a fixed `current_extent` dictates the size; otherwise
/// `current_extent.width == u32::MAX` and the window size is clamped.
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, window: vk::Extent2D) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    vk::Extent2D {
        width: window
            .width
            .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: window
            .height
            .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

/// One more than the minimum; `max_image_count == 0` means no upper bound.
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let wanted = caps.min_image_count + 1;
    if caps.max_image_count == 0 {
        wanted
    } else {
        wanted.min(caps.max_image_count)
    }
}

pub fn find_supported_format(
    candidates: &[vk::Format],
    tiling: vk::ImageTiling,
    features: vk::FormatFeatureFlags,
    properties: impl Fn(vk::Format) -> vk::FormatProperties,
) -> Option<vk::Format> {
    candidates.iter().copied().find(|&format| {
        let props = properties(format);
        match tiling {
            vk::ImageTiling::LINEAR => props.linear_tiling_features.contains(features),
            vk::ImageTiling::OPTIMAL => props.optimal_tiling_features.contains(features),
            _ => false,
        }
    })
}

pub fn find_depth_format(
    properties: impl Fn(vk::Format) -> vk::FormatProperties,
) -> Result<vk::Format> {
    find_supported_format(
        &DEPTH_FORMAT_CANDIDATES,
        vk::ImageTiling::OPTIMAL,
        vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
        properties,
    )
    .ok_or(RenderError::NoDepthFormat)
}

#[cfg(test)]
#[path = "select_tests.rs"]
mod tests;
