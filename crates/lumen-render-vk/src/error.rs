// SPDX-License-Identifier: CEPL-1.0
use ash::vk;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RenderError>;

#[derive(Debug, Error)]
pub enum RenderError {
    /// The driver refused to create a GPU object.
    #[error("failed to create {what}: {result}")]
    Creation {
        what: &'static str,
        result: vk::Result,
    },

    #[error("{op} failed: {result}")]
    Vulkan {
        op: &'static str,
        result: vk::Result,
    },

    #[error("surface reports no supported formats")]
    NoSurfaceFormats,

    #[error("no supported depth format among candidates")]
    NoDepthFormat,

    /// Formats must survive swapchain recreation unchanged.
    #[error(
        "swapchain format changed across recreation: color {old_color:?} -> {new_color:?}, depth {old_depth:?} -> {new_depth:?}"
    )]
    FormatMismatch {
        old_color: vk::Format,
        new_color: vk::Format,
        old_depth: vk::Format,
        new_depth: vk::Format,
    },

    #[error("image index {index} out of range for {count} swapchain images")]
    ImageIndexOutOfRange { index: u32, count: usize },

    #[error("window closed while waiting for a drawable extent")]
    WindowClosed,

    #[error("frame contract violated: {0}")]
    Contract(&'static str),

    #[error("vulkan initialization failed: {0}")]
    Initialization(String),
}

impl RenderError {
    pub(crate) fn creation(what: &'static str) -> impl FnOnce(vk::Result) -> Self {
        move |result| Self::Creation { what, result }
    }

    pub(crate) fn vulkan(op: &'static str) -> impl FnOnce(vk::Result) -> Self {
        move |result| Self::Vulkan { op, result }
    }
}
