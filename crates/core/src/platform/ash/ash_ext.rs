use ash::prelude::VkResult;
use ash::vk::{CommandBuffer, CommandBufferAllocateInfo, DescriptorSet, DescriptorSetAllocateInfo};
use std::mem::MaybeUninit;

/// Single object allocations, without the `Vec` ash returns.
pub trait DeviceExt {
	unsafe fn allocate_command_buffer(&self, allocate_info: &CommandBufferAllocateInfo<'_>) -> VkResult<CommandBuffer>;

	unsafe fn allocate_descriptor_set(&self, allocate_info: &DescriptorSetAllocateInfo<'_>) -> VkResult<DescriptorSet>;
}

impl DeviceExt for ash::Device {
	unsafe fn allocate_command_buffer(&self, allocate_info: &CommandBufferAllocateInfo<'_>) -> VkResult<CommandBuffer> {
		unsafe {
			assert_eq!(allocate_info.command_buffer_count, 1);
			let mut buffer = MaybeUninit::uninit();
			(self.fp_v1_0().allocate_command_buffers)(self.handle(), allocate_info, buffer.as_mut_ptr())
				.assume_init_on_success(buffer)
		}
	}

	unsafe fn allocate_descriptor_set(&self, allocate_info: &DescriptorSetAllocateInfo<'_>) -> VkResult<DescriptorSet> {
		unsafe {
			assert_eq!(allocate_info.descriptor_set_count, 1);
			let mut set = MaybeUninit::uninit();
			(self.fp_v1_0().allocate_descriptor_sets)(self.handle(), allocate_info, set.as_mut_ptr())
				.assume_init_on_success(set)
		}
	}
}
