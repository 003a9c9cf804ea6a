use crate::platform::ash::{AshCreateInfo, AshExtensions};
use anyhow::anyhow;
use ash::ext::debug_utils;
use ash::vk::{
	ApplicationInfo, Bool32, DebugUtilsMessageSeverityFlagsEXT, DebugUtilsMessageTypeFlagsEXT,
	DebugUtilsMessengerCallbackDataEXT, DebugUtilsMessengerCreateInfoEXT, DeviceCreateInfo, DeviceQueueCreateInfo,
	InstanceCreateInfo, PhysicalDeviceFeatures, PhysicalDeviceType, PhysicalDeviceVulkan12Features, QueueFlags,
	ValidationFeatureEnableEXT, ValidationFeaturesEXT,
};
use ash::Entry;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::borrow::Cow;
use std::ffi::{c_void, CStr};

pub fn required_features_vk12() -> PhysicalDeviceVulkan12Features<'static> {
	// query pools are reset from the host when they get recycled
	PhysicalDeviceVulkan12Features::default().host_query_reset(true)
}

pub const LAYER_VALIDATION: &CStr = c"VK_LAYER_KHRONOS_validation";

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum Debuggers {
	#[default]
	None,
	Validation,
	GpuAssistedValidation,
}

pub struct AppConfig<'a> {
	pub name: &'a CStr,
	pub version: u32,
}

impl Default for AppConfig<'_> {
	fn default() -> Self {
		Self {
			name: c"Unknown App",
			version: 0,
		}
	}
}

pub struct AshSingleGraphicsQueueCreateInfo<'a> {
	pub app: AppConfig<'a>,
	pub instance_extensions: &'a [&'a CStr],
	pub extensions: &'a [&'a CStr],
	pub features: PhysicalDeviceFeatures,
	pub features_vk12: PhysicalDeviceVulkan12Features<'static>,
	pub debug: Debuggers,
	pub debug_callback: Option<&'a DebugUtilsMessengerCreateInfoEXT<'a>>,
}

impl Default for AshSingleGraphicsQueueCreateInfo<'_> {
	fn default() -> Self {
		Self {
			app: Default::default(),
			instance_extensions: &[],
			extensions: &[],
			features: PhysicalDeviceFeatures::default(),
			features_vk12: required_features_vk12(),
			debug: Debuggers::default(),
			debug_callback: None,
		}
	}
}

/// Creates an [`AshCreateInfo`] with any GPU (preferring dedicated) and it's single graphics + compute queue, which
/// all [`CommandTarget`](crate::platform::CommandTarget)s submit to.
///
/// If any of the steps were to fail during initialization, this method currently does not clean up after itself
/// correctly. It will only destroy itself correctly if the entire initialization succeeds.
pub fn ash_init_single_graphics_queue(
	mut create_info: AshSingleGraphicsQueueCreateInfo,
) -> anyhow::Result<AshCreateInfo> {
	unsafe {
		let entry = Entry::load()?;

		let instance = {
			let mut layers = SmallVec::<[_; 1]>::new();
			let mut validation_features = SmallVec::<[_; 2]>::new();
			match create_info.debug {
				Debuggers::None => (),
				Debuggers::Validation => layers.push(LAYER_VALIDATION.as_ptr()),
				Debuggers::GpuAssistedValidation => {
					layers.push(LAYER_VALIDATION.as_ptr());
					validation_features.extend_from_slice(&[
						ValidationFeatureEnableEXT::GPU_ASSISTED,
						ValidationFeatureEnableEXT::GPU_ASSISTED_RESERVE_BINDING_SLOT,
					]);
				}
			}

			let extensions = create_info
				.instance_extensions
				.iter()
				.copied()
				.chain([debug_utils::NAME])
				.map(|c| c.as_ptr())
				.collect::<SmallVec<[_; 3]>>();

			entry.create_instance(
				&InstanceCreateInfo::default()
					.application_info(
						&ApplicationInfo::default()
							.application_name(create_info.app.name)
							.application_version(create_info.app.version)
							.engine_name(c"rust-gpu-lifetime")
							.engine_version(1)
							.api_version(ash::vk::make_api_version(0, 1, 2, 0)),
					)
					.enabled_extension_names(&extensions)
					.enabled_layer_names(&layers)
					.push_next(&mut ValidationFeaturesEXT::default().enabled_validation_features(&validation_features)),
				None,
			)?
		};

		let debug_instance = debug_utils::Instance::new(&entry, &instance);
		let debug_messager = {
			let default_callback = DebugUtilsMessengerCreateInfoEXT::default()
				.message_severity(
					DebugUtilsMessageSeverityFlagsEXT::ERROR
						| DebugUtilsMessageSeverityFlagsEXT::WARNING
						| DebugUtilsMessageSeverityFlagsEXT::INFO,
				)
				.message_type(
					DebugUtilsMessageTypeFlagsEXT::GENERAL
						| DebugUtilsMessageTypeFlagsEXT::VALIDATION
						| DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
				)
				.pfn_user_callback(Some(default_debug_callback));
			debug_instance
				.create_debug_utils_messenger(create_info.debug_callback.unwrap_or(&default_callback), None)?
		};

		let physical_device = instance
			.enumerate_physical_devices()?
			.into_iter()
			.min_by_key(|phy| match instance.get_physical_device_properties(*phy).device_type {
				PhysicalDeviceType::DISCRETE_GPU => 1,
				PhysicalDeviceType::VIRTUAL_GPU => 2,
				PhysicalDeviceType::INTEGRATED_GPU => 3,
				PhysicalDeviceType::CPU => 4,
				_ => 5,
			})
			.ok_or(anyhow!("No physical devices available"))?;

		let queue_family_index = instance
			.get_physical_device_queue_family_properties(physical_device)
			.into_iter()
			.enumerate()
			.find(|(_, prop)| prop.queue_flags.contains(QueueFlags::GRAPHICS | QueueFlags::COMPUTE))
			.ok_or(anyhow!("No graphics + compute queues on physical device available"))?
			.0 as u32;

		let device = {
			let extensions = create_info.extensions.iter().map(|x| x.as_ptr()).collect::<Vec<_>>();
			instance.create_device(
				physical_device,
				&DeviceCreateInfo::default()
					.enabled_features(&create_info.features)
					.enabled_extension_names(&extensions)
					.push_next(&mut create_info.features_vk12)
					.queue_create_infos(&[DeviceQueueCreateInfo::default()
						.queue_family_index(queue_family_index)
						.queue_priorities(&[1.])]),
				None,
			)?
		};

		let queue = device.get_device_queue(queue_family_index, 0);
		let debug_utils = Some(debug_utils::Device::new(&instance, &device));

		Ok(AshCreateInfo {
			entry,
			instance,
			physical_device,
			device,
			queue_family_index,
			queue: Mutex::new(queue),
			extensions: AshExtensions { debug_utils },
			destroy: Some(Box::new(move |create_info| {
				create_info.extensions = AshExtensions::default();
				create_info.device.destroy_device(None);
				debug_instance.destroy_debug_utils_messenger(debug_messager, None);
				create_info.instance.destroy_instance(None);
			})),
		})
	}
}

/// All child objects created on device must have been destroyed prior to destroying device
/// https://vulkan.lunarg.com/doc/view/1.3.296.0/linux/1.3-extensions/vkspec.html#VUID-vkDestroyDevice-device-05137
const VUID_VK_DESTROY_DEVICE_DEVICE_05137: i32 = 0x4872eaa0;

const IGNORED_MSG_IDS: &[i32] = &[VUID_VK_DESTROY_DEVICE_DEVICE_05137];

unsafe extern "system" fn default_debug_callback(
	message_severity: DebugUtilsMessageSeverityFlagsEXT,
	message_type: DebugUtilsMessageTypeFlagsEXT,
	callback_data: *const DebugUtilsMessengerCallbackDataEXT<'_>,
	_p_user_data: *mut c_void,
) -> Bool32 {
	unsafe {
		let callback_data = *callback_data;
		let message_id_number = callback_data.message_id_number;
		if IGNORED_MSG_IDS.contains(&message_id_number) {
			return false.into();
		}
		let message_id_name = callback_data
			.message_id_name_as_c_str()
			.map_or(Cow::Borrowed(""), CStr::to_string_lossy);
		let message = callback_data
			.message_as_c_str()
			.map_or(Cow::Borrowed("No message"), CStr::to_string_lossy);

		if message_severity.contains(DebugUtilsMessageSeverityFlagsEXT::ERROR) {
			tracing::error!(?message_type, %message_id_name, message_id_number, "{}", message);
		} else if message_severity.contains(DebugUtilsMessageSeverityFlagsEXT::WARNING) {
			tracing::warn!(?message_type, %message_id_name, message_id_number, "{}", message);
		} else {
			tracing::debug!(?message_type, %message_id_name, message_id_number, "{}", message);
		}
		false.into()
	}
}
