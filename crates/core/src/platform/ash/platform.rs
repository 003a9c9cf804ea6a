use crate::platform::ash::DeviceExt;
use crate::platform::{
	CommandBufferLevel, CommandTarget, DescriptorPoolSizes, LifetimePlatform, MemoryProperties, MemoryPropertyFlags,
	MemoryType, PipelineStageFlags, QueryType,
};
use ash::ext::debug_utils;
use ash::prelude::VkResult;
use ash::vk;
use ash::vk::{
	CommandBufferAllocateInfo, CommandBufferBeginInfo, CommandBufferInheritanceInfo, CommandBufferResetFlags,
	CommandBufferUsageFlags, CommandPoolCreateFlags, CommandPoolCreateInfo, CommandPoolResetFlags,
	DescriptorPoolCreateInfo, DescriptorPoolResetFlags, DescriptorPoolSize, DescriptorSetAllocateInfo,
	DescriptorType, FenceCreateInfo, MemoryAllocateInfo, MemoryMapFlags, QueryControlFlags, QueryPoolCreateInfo,
	QueryResultFlags, SemaphoreCreateInfo, SubmitInfo,
};
use parking_lot::Mutex;
use smallvec::SmallVec;
use static_assertions::assert_impl_all;
use std::ops::Deref;
use std::ptr::NonNull;

/// The Vulkan backend. Every [`CommandTarget`] submits to the single queue of [`AshCreateInfo`].
pub struct Ash {
	pub create_info: AshCreateInfo,
	memory_properties: MemoryProperties,
}
assert_impl_all!(Ash: Send, Sync);

impl Ash {
	pub fn new(create_info: AshCreateInfo) -> Self {
		let memory_properties = unsafe {
			let vk_memory = create_info
				.instance
				.get_physical_device_memory_properties(create_info.physical_device);
			let limits = create_info
				.instance
				.get_physical_device_properties(create_info.physical_device)
				.limits;
			MemoryProperties {
				memory_types: vk_memory.memory_types[..vk_memory.memory_type_count as usize]
					.iter()
					.map(|ty| MemoryType {
						property_flags: MemoryPropertyFlags::from_bits_truncate(ty.property_flags.as_raw()),
						heap_index: ty.heap_index,
					})
					.collect(),
				min_memory_map_alignment: limits.min_memory_map_alignment as u64,
			}
		};
		Self {
			create_info,
			memory_properties,
		}
	}
}

impl Deref for Ash {
	type Target = AshCreateInfo;

	fn deref(&self) -> &Self::Target {
		&self.create_info
	}
}

impl Drop for Ash {
	fn drop(&mut self) {
		unsafe {
			if let Err(e) = self.device.device_wait_idle() {
				tracing::error!("device_wait_idle failed while dropping Ash: {}", e);
			}
		}
	}
}

pub struct AshCreateInfo {
	pub entry: ash::Entry,
	pub instance: ash::Instance,
	pub physical_device: vk::PhysicalDevice,
	pub device: ash::Device,
	pub queue_family_index: u32,
	pub queue: Mutex<vk::Queue>,
	pub extensions: AshExtensions,
	pub destroy: Option<AshDestroyFn>,
}

pub type AshDestroyFn = Box<dyn FnOnce(&mut AshCreateInfo) + Send + Sync>;

#[derive(Default)]
#[non_exhaustive]
pub struct AshExtensions {
	pub debug_utils: Option<debug_utils::Device>,
}

impl AshExtensions {
	pub fn debug_utils(&self) -> &debug_utils::Device {
		self.debug_utils.as_ref().expect("missing ext_debug_utils")
	}
}

impl Drop for AshCreateInfo {
	fn drop(&mut self) {
		if let Some(destroy) = self.destroy.take() {
			destroy(self);
		}
	}
}

fn descriptor_pool_sizes(sizes: &DescriptorPoolSizes, max_sets: u32) -> SmallVec<[DescriptorPoolSize; 6]> {
	[
		(DescriptorType::UNIFORM_BUFFER, sizes.uniform_buffers),
		(DescriptorType::STORAGE_BUFFER, sizes.storage_buffers),
		(DescriptorType::SAMPLED_IMAGE, sizes.sampled_images),
		(DescriptorType::STORAGE_IMAGE, sizes.storage_images),
		(DescriptorType::SAMPLER, sizes.samplers),
		(DescriptorType::COMBINED_IMAGE_SAMPLER, sizes.combined_image_samplers),
	]
	.into_iter()
	.filter(|(_, count)| *count > 0)
	.map(|(ty, count)| DescriptorPoolSize {
		ty,
		descriptor_count: count.saturating_mul(max_sets),
	})
	.collect()
}

fn query_type_to_vk(ty: QueryType) -> vk::QueryType {
	match ty {
		QueryType::Timestamp => vk::QueryType::TIMESTAMP,
		QueryType::Occlusion => vk::QueryType::OCCLUSION,
	}
}

fn stage_to_vk(stage: PipelineStageFlags) -> vk::PipelineStageFlags {
	vk::PipelineStageFlags::from_raw(stage.bits())
}

unsafe impl LifetimePlatform for Ash {
	type PlatformCreateInfo = AshCreateInfo;
	type PlatformCreateError = vk::Result;
	type Error = vk::Result;
	type DeviceMemory = vk::DeviceMemory;
	type Fence = vk::Fence;
	type Semaphore = vk::Semaphore;
	type CommandPool = vk::CommandPool;
	type CommandBuffer = vk::CommandBuffer;
	type DescriptorPool = vk::DescriptorPool;
	type DescriptorSetLayout = vk::DescriptorSetLayout;
	type DescriptorSet = vk::DescriptorSet;
	type QueryPool = vk::QueryPool;

	unsafe fn create_platform(create_info: Self::PlatformCreateInfo) -> VkResult<Self> {
		Ok(Ash::new(create_info))
	}

	fn memory_properties(&self) -> &MemoryProperties {
		&self.memory_properties
	}

	unsafe fn device_wait_idle(&self) -> VkResult<()> {
		unsafe { self.device.device_wait_idle() }
	}

	unsafe fn allocate_memory(&self, size: u64, memory_type_index: u32) -> VkResult<vk::DeviceMemory> {
		unsafe {
			self.device.allocate_memory(
				&MemoryAllocateInfo::default()
					.allocation_size(size)
					.memory_type_index(memory_type_index),
				None,
			)
		}
	}

	unsafe fn free_memory(&self, memory: vk::DeviceMemory) {
		unsafe { self.device.free_memory(memory, None) }
	}

	unsafe fn map_memory(&self, memory: vk::DeviceMemory, offset: u64, size: u64) -> VkResult<NonNull<u8>> {
		unsafe {
			let ptr = self
				.device
				.map_memory(memory, offset, size, MemoryMapFlags::empty())?;
			NonNull::new(ptr.cast::<u8>()).ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)
		}
	}

	unsafe fn unmap_memory(&self, memory: vk::DeviceMemory) {
		unsafe { self.device.unmap_memory(memory) }
	}

	unsafe fn create_fence(&self) -> VkResult<vk::Fence> {
		unsafe { self.device.create_fence(&FenceCreateInfo::default(), None) }
	}

	unsafe fn destroy_fence(&self, fence: vk::Fence) {
		unsafe { self.device.destroy_fence(fence, None) }
	}

	unsafe fn fence_status(&self, fence: vk::Fence) -> VkResult<bool> {
		unsafe { self.device.get_fence_status(fence) }
	}

	unsafe fn wait_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<bool> {
		unsafe {
			match self.device.wait_for_fences(&[fence], true, timeout_ns) {
				Ok(()) => Ok(true),
				Err(vk::Result::TIMEOUT) => Ok(false),
				Err(e) => Err(e),
			}
		}
	}

	unsafe fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
		unsafe { self.device.reset_fences(&[fence]) }
	}

	unsafe fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
		unsafe { self.device.create_semaphore(&SemaphoreCreateInfo::default(), None) }
	}

	unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
		unsafe { self.device.destroy_semaphore(semaphore, None) }
	}

	unsafe fn create_command_pool(&self, _target: CommandTarget) -> VkResult<vk::CommandPool> {
		unsafe {
			self.device.create_command_pool(
				&CommandPoolCreateInfo::default()
					.flags(CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
					.queue_family_index(self.queue_family_index),
				None,
			)
		}
	}

	unsafe fn reset_command_pool(&self, pool: vk::CommandPool) -> VkResult<()> {
		unsafe { self.device.reset_command_pool(pool, CommandPoolResetFlags::empty()) }
	}

	unsafe fn destroy_command_pool(&self, pool: vk::CommandPool) {
		unsafe { self.device.destroy_command_pool(pool, None) }
	}

	unsafe fn allocate_command_buffer(
		&self,
		pool: vk::CommandPool,
		level: CommandBufferLevel,
	) -> VkResult<vk::CommandBuffer> {
		let level = match level {
			CommandBufferLevel::Primary => vk::CommandBufferLevel::PRIMARY,
			CommandBufferLevel::Secondary => vk::CommandBufferLevel::SECONDARY,
		};
		unsafe {
			self.device.allocate_command_buffer(
				&CommandBufferAllocateInfo::default()
					.command_pool(pool)
					.level(level)
					.command_buffer_count(1),
			)
		}
	}

	unsafe fn free_command_buffer(&self, pool: vk::CommandPool, cmd: vk::CommandBuffer) {
		unsafe { self.device.free_command_buffers(pool, &[cmd]) }
	}

	unsafe fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
		unsafe { self.device.reset_command_buffer(cmd, CommandBufferResetFlags::empty()) }
	}

	unsafe fn begin_command_buffer(&self, cmd: vk::CommandBuffer, level: CommandBufferLevel) -> VkResult<()> {
		unsafe {
			let inheritance = CommandBufferInheritanceInfo::default();
			let mut begin_info = CommandBufferBeginInfo::default().flags(CommandBufferUsageFlags::ONE_TIME_SUBMIT);
			if level == CommandBufferLevel::Secondary {
				begin_info = begin_info.inheritance_info(&inheritance);
			}
			self.device.begin_command_buffer(cmd, &begin_info)
		}
	}

	unsafe fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
		unsafe { self.device.end_command_buffer(cmd) }
	}

	unsafe fn cmd_execute_commands(&self, cmd: vk::CommandBuffer, secondaries: &[vk::CommandBuffer]) {
		unsafe { self.device.cmd_execute_commands(cmd, secondaries) }
	}

	unsafe fn submit(
		&self,
		_target: CommandTarget,
		cmd: vk::CommandBuffer,
		wait_semaphores: &[(vk::Semaphore, PipelineStageFlags)],
		signal_semaphores: &[vk::Semaphore],
		fence: vk::Fence,
	) -> VkResult<()> {
		let (wait, stages): (SmallVec<[_; 4]>, SmallVec<[_; 4]>) = wait_semaphores
			.iter()
			.map(|(semaphore, stage)| (*semaphore, stage_to_vk(*stage)))
			.unzip();
		let queue = self.queue.lock();
		unsafe {
			self.device.queue_submit(
				*queue,
				&[SubmitInfo::default()
					.wait_semaphores(&wait)
					.wait_dst_stage_mask(&stages)
					.command_buffers(&[cmd])
					.signal_semaphores(signal_semaphores)],
				fence,
			)
		}
	}

	unsafe fn create_descriptor_pool(&self, sizes: &DescriptorPoolSizes, max_sets: u32) -> VkResult<vk::DescriptorPool> {
		let pool_sizes = descriptor_pool_sizes(sizes, max_sets);
		unsafe {
			self.device.create_descriptor_pool(
				&DescriptorPoolCreateInfo::default()
					.max_sets(max_sets)
					.pool_sizes(&pool_sizes),
				None,
			)
		}
	}

	unsafe fn allocate_descriptor_set(
		&self,
		pool: vk::DescriptorPool,
		layout: vk::DescriptorSetLayout,
	) -> VkResult<Option<vk::DescriptorSet>> {
		let layouts = [layout];
		let result = unsafe {
			self.device.allocate_descriptor_set(
				&DescriptorSetAllocateInfo::default()
					.descriptor_pool(pool)
					.set_layouts(&layouts),
			)
		};
		match result {
			Ok(set) => Ok(Some(set)),
			Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL) => Ok(None),
			Err(e) => Err(e),
		}
	}

	unsafe fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> VkResult<()> {
		unsafe { self.device.reset_descriptor_pool(pool, DescriptorPoolResetFlags::empty()) }
	}

	unsafe fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
		unsafe { self.device.destroy_descriptor_pool(pool, None) }
	}

	unsafe fn create_query_pool(&self, ty: QueryType, count: u32) -> VkResult<vk::QueryPool> {
		unsafe {
			self.device.create_query_pool(
				&QueryPoolCreateInfo::default()
					.query_type(query_type_to_vk(ty))
					.query_count(count),
				None,
			)
		}
	}

	unsafe fn reset_query_pool(&self, pool: vk::QueryPool, first: u32, count: u32) {
		// requires Vulkan 1.2 `hostQueryReset`
		unsafe { self.device.reset_query_pool(pool, first, count) }
	}

	unsafe fn destroy_query_pool(&self, pool: vk::QueryPool) {
		unsafe { self.device.destroy_query_pool(pool, None) }
	}

	unsafe fn cmd_reset_query_pool(&self, cmd: vk::CommandBuffer, pool: vk::QueryPool, first: u32, count: u32) {
		unsafe { self.device.cmd_reset_query_pool(cmd, pool, first, count) }
	}

	unsafe fn cmd_begin_query(&self, cmd: vk::CommandBuffer, pool: vk::QueryPool, query: u32) {
		unsafe { self.device.cmd_begin_query(cmd, pool, query, QueryControlFlags::empty()) }
	}

	unsafe fn cmd_end_query(&self, cmd: vk::CommandBuffer, pool: vk::QueryPool, query: u32) {
		unsafe { self.device.cmd_end_query(cmd, pool, query) }
	}

	unsafe fn cmd_write_timestamp(
		&self,
		cmd: vk::CommandBuffer,
		stage: PipelineStageFlags,
		pool: vk::QueryPool,
		query: u32,
	) {
		unsafe { self.device.cmd_write_timestamp(cmd, stage_to_vk(stage), pool, query) }
	}

	unsafe fn query_results(&self, pool: vk::QueryPool, first: u32, out: &mut [u64], wait: bool) -> VkResult<bool> {
		let mut flags = QueryResultFlags::TYPE_64;
		if wait {
			flags |= QueryResultFlags::WAIT;
		}
		unsafe {
			match self.device.get_query_pool_results(pool, first, out, flags) {
				Ok(()) => Ok(true),
				Err(vk::Result::NOT_READY) => Ok(false),
				Err(e) => Err(e),
			}
		}
	}
}
