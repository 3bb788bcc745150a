//! Instance creation. With validation on, driver messages are forwarded to `log`.

use std::ffi::{c_char, c_void, CStr, CString};

use ash::ext::debug_utils;
use ash::vk;
use raw_window_handle::RawDisplayHandle;

use crate::error::{EngineError, EngineResult};

const KHRONOS_VALIDATION: &CStr = c"VK_LAYER_KHRONOS_validation";
const ENGINE_NAME: &CStr = c"Lumen";

type Severity = vk::DebugUtilsMessageSeverityFlagsEXT;

/// Messenger handle together with the loader that destroys it.
pub struct DebugMessenger {
    loader: debug_utils::Instance,
    handle: vk::DebugUtilsMessengerEXT,
}

impl DebugMessenger {
    fn new(entry: &ash::Entry, instance: &ash::Instance) -> EngineResult<Self> {
        let loader = debug_utils::Instance::new(entry, instance);
        let info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(Severity::ERROR | Severity::WARNING | Severity::INFO)
            .message_type(vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE)
            .pfn_user_callback(Some(forward_to_log));
        let handle = unsafe { loader.create_debug_utils_messenger(&info, None) }
            .map_err(EngineError::vk("create debug messenger"))?;
        Ok(Self { loader, handle })
    }

    /// # Safety
    /// Must run before the owning instance is destroyed, and only once.
    pub unsafe fn destroy(&self) {
        self.loader.destroy_debug_utils_messenger(self.handle, None);
    }
}

fn has_layer(entry: &ash::Entry, wanted: &CStr) -> bool {
    unsafe { entry.enumerate_instance_layer_properties() }
        .map(|layers| {
            layers
                .iter()
                .any(|layer| layer.layer_name_as_c_str().is_ok_and(|name| name == wanted))
        })
        .unwrap_or(false)
}

/// Create the instance, plus a messenger when validation was asked for and the
/// layer is installed.
pub fn create_instance(
    entry: &ash::Entry,
    app_name: &str,
    display: RawDisplayHandle,
    validation: bool,
) -> EngineResult<(ash::Instance, Option<DebugMessenger>)> {
    let validation = validation && {
        let found = has_layer(entry, KHRONOS_VALIDATION);
        if !found {
            log::warn!("{KHRONOS_VALIDATION:?} is not installed, continuing without validation");
        }
        found
    };

    let app_name = CString::new(app_name)
        .map_err(|e| EngineError::Initialization(format!("Invalid application name: {e}")))?;
    let version = vk::make_api_version(0, 0, 1, 0);
    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(version)
        .engine_name(ENGINE_NAME)
        .engine_version(version)
        .api_version(vk::API_VERSION_1_2);

    let mut extensions: Vec<*const c_char> = ash_window::enumerate_required_extensions(display)
        .map_err(EngineError::vk("enumerate surface extensions"))?
        .to_vec();
    let mut flags = vk::InstanceCreateFlags::empty();
    if cfg!(target_os = "macos") {
        extensions.push(ash::khr::portability_enumeration::NAME.as_ptr());
        flags |= vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    }
    let mut layers: Vec<*const c_char> = Vec::new();
    if validation {
        extensions.push(debug_utils::NAME.as_ptr());
        layers.push(KHRONOS_VALIDATION.as_ptr());
    }

    let info = vk::InstanceCreateInfo::default()
        .flags(flags)
        .application_info(&app_info)
        .enabled_extension_names(&extensions)
        .enabled_layer_names(&layers);
    let instance = unsafe { entry.create_instance(&info, None) }.map_err(EngineError::vk("create instance"))?;

    let messenger = if validation {
        match DebugMessenger::new(entry, &instance) {
            Ok(messenger) => Some(messenger),
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                return Err(e);
            }
        }
    } else {
        None
    };
    log::debug!("Vulkan instance created (validation: {validation})");
    Ok((instance, messenger))
}

/// Map a driver message severity onto a log level. Driver info is chatty, so it
/// goes to debug.
fn level_for(severity: Severity) -> log::Level {
    if severity.contains(Severity::ERROR) {
        log::Level::Error
    } else if severity.contains(Severity::WARNING) {
        log::Level::Warn
    } else if severity.contains(Severity::INFO) {
        log::Level::Debug
    } else {
        log::Level::Trace
    }
}

unsafe extern "system" fn forward_to_log(
    severity: Severity,
    kind: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _: *mut c_void,
) -> vk::Bool32 {
    // SAFETY: the driver passes null or a pointer valid for the call.
    if let Some(data) = unsafe { data.as_ref() } {
        let text = unsafe { data.message_as_c_str() }
            .map(CStr::to_string_lossy)
            .unwrap_or_default();
        log::log!(target: "vulkan", level_for(severity), "{kind:?}: {text}");
    }
    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_most_severe_bit_wins() {
        assert_eq!(level_for(Severity::ERROR | Severity::INFO), log::Level::Error);
        assert_eq!(level_for(Severity::WARNING), log::Level::Warn);
        assert_eq!(level_for(Severity::INFO), log::Level::Debug);
        assert_eq!(level_for(Severity::VERBOSE), log::Level::Trace);
    }
}
