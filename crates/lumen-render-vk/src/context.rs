// SPDX-License-Identifier: CEPL-1.0
use std::ffi::CStr;

use ash::khr::{surface, swapchain};
use ash::prelude::VkResult;
use ash::{vk, Entry, Instance};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle};
use tracing::{debug, info, warn};

use crate::device::{DeviceContext, QueueFamilies, Submission, SurfaceSupport};
use crate::error::{RenderError, Result};

#[cfg(debug_assertions)]
use ash::ext::debug_utils as ext_debug;

#[cfg(debug_assertions)]
const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

#[cfg(debug_assertions)]
type DebugState = (ext_debug::Instance, vk::DebugUtilsMessengerEXT);
#[cfg(not(debug_assertions))]
type DebugState = ();

/// Instance, surface, logical device and queues for one window.
pub struct VulkanContext {
    _entry: Entry,
    instance: Instance,
    debug: DebugState,
    surface_loader: surface::Instance,
    surface: vk::SurfaceKHR,

    phys: vk::PhysicalDevice,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    device: ash::Device,
    families: QueueFamilies,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,

    swapchain_loader: swapchain::Device,
    command_pool: vk::CommandPool,
}

#[cfg(debug_assertions)]
unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user: *mut std::os::raw::c_void,
) -> vk::Bool32 {
    if data.is_null() || (*data).p_message.is_null() {
        return vk::FALSE;
    }
    let msg = CStr::from_ptr((*data).p_message).to_string_lossy();
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        tracing::error!("[vulkan] {msg}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        warn!("[vulkan] {msg}");
    } else {
        debug!("[vulkan] {msg}");
    }
    vk::FALSE
}

#[cfg(debug_assertions)]
unsafe fn create_debug_messenger(entry: &Entry, instance: &Instance) -> Result<DebugState> {
    let loader = ext_debug::Instance::new(entry, instance);
    let info = vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback));
    let messenger = loader
        .create_debug_utils_messenger(&info, None)
        .map_err(RenderError::creation("debug messenger"))?;
    Ok((loader, messenger))
}

#[cfg(not(debug_assertions))]
unsafe fn create_debug_messenger(_entry: &Entry, _instance: &Instance) -> Result<DebugState> {
    Ok(())
}

#[cfg(debug_assertions)]
unsafe fn destroy_debug_messenger(debug: &DebugState) {
    debug.0.destroy_debug_utils_messenger(debug.1, None);
}

#[cfg(not(debug_assertions))]
unsafe fn destroy_debug_messenger(_debug: &DebugState) {}

unsafe fn create_instance(entry: &Entry, display_raw: RawDisplayHandle) -> Result<Instance> {
    let app_info = vk::ApplicationInfo::default()
        .application_name(c"lumen")
        .engine_name(c"lumen")
        .api_version(vk::API_VERSION_1_0);

    let required = ash_window::enumerate_required_extensions(display_raw)
        .map_err(RenderError::vulkan("enumerate required instance extensions"))?;
    #[allow(unused_mut)]
    let mut extensions = required.to_vec();
    #[cfg(debug_assertions)]
    extensions.push(ext_debug::NAME.as_ptr());

    #[cfg(debug_assertions)]
    let layers = [VALIDATION_LAYER.as_ptr()];
    #[cfg(not(debug_assertions))]
    let layers: [*const std::os::raw::c_char; 0] = [];

    let info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extensions)
        .enabled_layer_names(&layers);

    entry
        .create_instance(&info, None)
        .map_err(RenderError::creation("instance"))
}

/// Graphics and present families for `phys`, if the device can do both.
unsafe fn find_queue_families(
    instance: &Instance,
    surface_loader: &surface::Instance,
    surface: vk::SurfaceKHR,
    phys: vk::PhysicalDevice,
) -> Option<QueueFamilies> {
    let props = instance.get_physical_device_queue_family_properties(phys);
    let mut graphics = None;
    let mut present = None;
    for (i, family) in props.iter().enumerate() {
        let i = i as u32;
        if family.queue_count == 0 {
            continue;
        }
        let can_draw = family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
        let can_present = surface_loader
            .get_physical_device_surface_support(phys, i, surface)
            .unwrap_or(false);
        // A single family that does both wins outright.
        if can_draw && can_present {
            return Some(QueueFamilies {
                graphics: i,
                present: i,
            });
        }
        if can_draw && graphics.is_none() {
            graphics = Some(i);
        }
        if can_present && present.is_none() {
            present = Some(i);
        }
    }
    Some(QueueFamilies {
        graphics: graphics?,
        present: present?,
    })
}

unsafe fn supports_swapchain(instance: &Instance, phys: vk::PhysicalDevice) -> bool {
    instance
        .enumerate_device_extension_properties(phys)
        .map(|exts| {
            exts.iter()
                .any(|e| e.extension_name_as_c_str() == Ok(swapchain::NAME))
        })
        .unwrap_or(false)
}

unsafe fn query_surface_support(
    surface_loader: &surface::Instance,
    surface: vk::SurfaceKHR,
    phys: vk::PhysicalDevice,
) -> VkResult<SurfaceSupport> {
    Ok(SurfaceSupport {
        capabilities: surface_loader.get_physical_device_surface_capabilities(phys, surface)?,
        formats: surface_loader.get_physical_device_surface_formats(phys, surface)?,
        present_modes: surface_loader.get_physical_device_surface_present_modes(phys, surface)?,
    })
}

unsafe fn pick_physical_device(
    instance: &Instance,
    surface_loader: &surface::Instance,
    surface: vk::SurfaceKHR,
) -> Result<(vk::PhysicalDevice, QueueFamilies)> {
    let devices = instance
        .enumerate_physical_devices()
        .map_err(RenderError::vulkan("enumerate physical devices"))?;
    info!("{} physical device(s) found", devices.len());

    for phys in devices {
        let Some(families) = find_queue_families(instance, surface_loader, surface, phys) else {
            continue;
        };
        if !supports_swapchain(instance, phys) {
            continue;
        }
        let adequate = query_surface_support(surface_loader, surface, phys)
            .map(|s| !s.formats.is_empty() && !s.present_modes.is_empty())
            .unwrap_or(false);
        if !adequate {
            continue;
        }

        let props = instance.get_physical_device_properties(phys);
        let name = props
            .device_name_as_c_str()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "<unnamed>".to_owned());
        info!(
            "using device '{name}' (graphics family {}, present family {})",
            families.graphics, families.present
        );
        return Ok((phys, families));
    }
    Err(RenderError::Initialization(
        "no physical device with graphics, present and swapchain support".into(),
    ))
}

impl VulkanContext {
    pub fn new(window: &dyn HasWindowHandle, display: &dyn HasDisplayHandle) -> Result<Self> {
        let display_raw = display
            .display_handle()
            .map_err(|e| RenderError::Initialization(format!("display handle: {e}")))?
            .as_raw();
        let window_raw = window
            .window_handle()
            .map_err(|e| RenderError::Initialization(format!("window handle: {e}")))?
            .as_raw();

        // STRICT ORDER: entry -> instance -> debug -> surface -> device.
        // Each step cleans up the earlier ones if it fails.
        unsafe {
            let entry = Entry::linked();
            let instance = create_instance(&entry, display_raw)?;

            let debug = match create_debug_messenger(&entry, &instance) {
                Ok(debug) => debug,
                Err(e) => {
                    instance.destroy_instance(None);
                    return Err(e);
                }
            };
            let surface_loader = surface::Instance::new(&entry, &instance);

            let surface =
                match ash_window::create_surface(&entry, &instance, display_raw, window_raw, None)
                {
                    Ok(surface) => surface,
                    Err(result) => {
                        destroy_debug_messenger(&debug);
                        instance.destroy_instance(None);
                        return Err(RenderError::Creation {
                            what: "surface",
                            result,
                        });
                    }
                };

            let device_parts = pick_physical_device(&instance, &surface_loader, surface)
                .and_then(|(phys, families)| {
                    let device = create_logical_device(&instance, phys, families)?;
                    Ok((phys, families, device))
                });
            let (phys, families, device) = match device_parts {
                Ok(parts) => parts,
                Err(e) => {
                    surface_loader.destroy_surface(surface, None);
                    destroy_debug_messenger(&debug);
                    instance.destroy_instance(None);
                    return Err(e);
                }
            };

            let pool_info = vk::CommandPoolCreateInfo::default()
                .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
                .queue_family_index(families.graphics);
            let command_pool = match device.create_command_pool(&pool_info, None) {
                Ok(pool) => pool,
                Err(result) => {
                    device.destroy_device(None);
                    surface_loader.destroy_surface(surface, None);
                    destroy_debug_messenger(&debug);
                    instance.destroy_instance(None);
                    return Err(RenderError::Creation {
                        what: "command pool",
                        result,
                    });
                }
            };

            let memory_properties = instance.get_physical_device_memory_properties(phys);
            let graphics_queue = device.get_device_queue(families.graphics, 0);
            let present_queue = device.get_device_queue(families.present, 0);
            let swapchain_loader = swapchain::Device::new(&instance, &device);

            Ok(Self {
                _entry: entry,
                instance,
                debug,
                surface_loader,
                surface,
                phys,
                memory_properties,
                device,
                families,
                graphics_queue,
                present_queue,
                swapchain_loader,
                command_pool,
            })
        }
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.phys
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    pub fn present_queue(&self) -> vk::Queue {
        self.present_queue
    }

    pub fn command_pool(&self) -> vk::CommandPool {
        self.command_pool
    }

    fn find_memory_type(&self, type_bits: u32, req: vk::MemoryPropertyFlags) -> Option<u32> {
        let mem = &self.memory_properties;
        (0..mem.memory_type_count).find(|&i| {
            (type_bits & (1 << i)) != 0
                && mem.memory_types[i as usize].property_flags.contains(req)
        })
    }
}

unsafe fn create_logical_device(
    instance: &Instance,
    phys: vk::PhysicalDevice,
    families: QueueFamilies,
) -> Result<ash::Device> {
    let priorities = [1.0_f32];
    let mut queue_infos = vec![vk::DeviceQueueCreateInfo::default()
        .queue_family_index(families.graphics)
        .queue_priorities(&priorities)];
    if !families.is_shared() {
        queue_infos.push(
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(families.present)
                .queue_priorities(&priorities),
        );
    }

    let extensions = [swapchain::NAME.as_ptr()];
    let info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_infos)
        .enabled_extension_names(&extensions);
    instance
        .create_device(phys, &info, None)
        .map_err(RenderError::creation("logical device"))
}

impl DeviceContext for VulkanContext {
    fn surface_support(&self) -> VkResult<SurfaceSupport> {
        unsafe { query_surface_support(&self.surface_loader, self.surface, self.phys) }
    }

    fn queue_families(&self) -> QueueFamilies {
        self.families
    }

    fn format_properties(&self, format: vk::Format) -> vk::FormatProperties {
        unsafe {
            self.instance
                .get_physical_device_format_properties(self.phys, format)
        }
    }

    unsafe fn create_swapchain(
        &self,
        info: &vk::SwapchainCreateInfoKHR<'_>,
    ) -> VkResult<vk::SwapchainKHR> {
        let info = info.surface(self.surface);
        self.swapchain_loader.create_swapchain(&info, None)
    }

    unsafe fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>> {
        self.swapchain_loader.get_swapchain_images(swapchain)
    }

    unsafe fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        self.swapchain_loader.destroy_swapchain(swapchain, None);
    }

    unsafe fn create_image_view(
        &self,
        info: &vk::ImageViewCreateInfo<'_>,
    ) -> VkResult<vk::ImageView> {
        self.device.create_image_view(info, None)
    }

    unsafe fn destroy_image_view(&self, view: vk::ImageView) {
        self.device.destroy_image_view(view, None);
    }

    unsafe fn create_image_with_info(
        &self,
        info: &vk::ImageCreateInfo<'_>,
        properties: vk::MemoryPropertyFlags,
    ) -> VkResult<(vk::Image, vk::DeviceMemory)> {
        let image = self.device.create_image(info, None)?;
        let req = self.device.get_image_memory_requirements(image);
        let Some(memory_type_index) = self.find_memory_type(req.memory_type_bits, properties)
        else {
            self.device.destroy_image(image, None);
            // No compatible memory type reads as an allocation failure.
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        };

        let alloc = vk::MemoryAllocateInfo::default()
            .allocation_size(req.size)
            .memory_type_index(memory_type_index);
        let memory = match self.device.allocate_memory(&alloc, None) {
            Ok(memory) => memory,
            Err(e) => {
                self.device.destroy_image(image, None);
                return Err(e);
            }
        };
        if let Err(e) = self.device.bind_image_memory(image, memory, 0) {
            self.device.destroy_image(image, None);
            self.device.free_memory(memory, None);
            return Err(e);
        }
        Ok((image, memory))
    }

    unsafe fn destroy_image(&self, image: vk::Image, memory: vk::DeviceMemory) {
        self.device.destroy_image(image, None);
        self.device.free_memory(memory, None);
    }

    unsafe fn create_render_pass(
        &self,
        info: &vk::RenderPassCreateInfo<'_>,
    ) -> VkResult<vk::RenderPass> {
        self.device.create_render_pass(info, None)
    }

    unsafe fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        self.device.destroy_render_pass(render_pass, None);
    }

    unsafe fn create_framebuffer(
        &self,
        info: &vk::FramebufferCreateInfo<'_>,
    ) -> VkResult<vk::Framebuffer> {
        self.device.create_framebuffer(info, None)
    }

    unsafe fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        self.device.destroy_framebuffer(framebuffer, None);
    }

    unsafe fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        self.device
            .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
    }

    unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.device.destroy_semaphore(semaphore, None);
    }

    unsafe fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        self.device
            .create_fence(&vk::FenceCreateInfo::default().flags(flags), None)
    }

    unsafe fn destroy_fence(&self, fence: vk::Fence) {
        self.device.destroy_fence(fence, None);
    }

    unsafe fn wait_for_fence(&self, fence: vk::Fence) -> VkResult<()> {
        self.device.wait_for_fences(&[fence], true, u64::MAX)
    }

    unsafe fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        self.device.reset_fences(&[fence])
    }

    unsafe fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        signal: vk::Semaphore,
    ) -> VkResult<(u32, bool)> {
        self.swapchain_loader
            .acquire_next_image(swapchain, u64::MAX, signal, vk::Fence::null())
    }

    unsafe fn queue_submit(&self, submission: &Submission) -> VkResult<()> {
        let wait_semaphores = [submission.wait_semaphore];
        let wait_stages = [submission.wait_stage];
        let command_buffers = [submission.command_buffer];
        let signal_semaphores = [submission.signal_semaphore];
        let submit = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);
        self.device
            .queue_submit(self.graphics_queue, &[submit], submission.fence)
    }

    unsafe fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> VkResult<bool> {
        let wait_semaphores = [wait];
        let swapchains = [swapchain];
        let image_indices = [image_index];
        let present = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);
        self.swapchain_loader
            .queue_present(self.present_queue, &present)
    }

    unsafe fn wait_idle(&self) -> VkResult<()> {
        self.device.device_wait_idle()
    }

    unsafe fn allocate_command_buffers(&self, count: u32) -> VkResult<Vec<vk::CommandBuffer>> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);
        self.device.allocate_command_buffers(&info)
    }

    unsafe fn free_command_buffers(&self, buffers: &[vk::CommandBuffer]) {
        self.device.free_command_buffers(self.command_pool, buffers);
    }

    unsafe fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        self.device
            .begin_command_buffer(cmd, &vk::CommandBufferBeginInfo::default())
    }

    unsafe fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        self.device.end_command_buffer(cmd)
    }

    unsafe fn cmd_begin_render_pass(
        &self,
        cmd: vk::CommandBuffer,
        info: &vk::RenderPassBeginInfo<'_>,
    ) {
        self.device
            .cmd_begin_render_pass(cmd, info, vk::SubpassContents::INLINE);
    }

    unsafe fn cmd_end_render_pass(&self, cmd: vk::CommandBuffer) {
        self.device.cmd_end_render_pass(cmd);
    }

    unsafe fn cmd_set_viewport(&self, cmd: vk::CommandBuffer, viewport: vk::Viewport) {
        self.device.cmd_set_viewport(cmd, 0, &[viewport]);
    }

    unsafe fn cmd_set_scissor(&self, cmd: vk::CommandBuffer, scissor: vk::Rect2D) {
        self.device.cmd_set_scissor(cmd, 0, &[scissor]);
    }
}

// STRICT TEARDOWN ORDER:
// - device_wait_idle()
// - command pool (frees any buffers still allocated from it)
// - device, then surface, then debug messenger, instance last
// Swapchains and renderers hold an Arc to this context, so they are gone by now.
impl Drop for VulkanContext {
    fn drop(&mut self) {
        unsafe {
            self.device.device_wait_idle().ok();
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);
            destroy_debug_messenger(&self.debug);
            self.instance.destroy_instance(None);
        }
        debug!("vulkan context destroyed");
    }
}
