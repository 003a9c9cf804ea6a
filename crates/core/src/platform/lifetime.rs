use crate::platform::{
	CommandBufferLevel, CommandTarget, DescriptorPoolSizes, MemoryProperties, PipelineStageFlags, QueryType,
};
use std::error::Error;
use std::fmt::Debug;
use std::hash::Hash;
use std::ptr::NonNull;

/// Internal interface to the graphics API, may change at any time!
///
/// All handles are plain copyable values, ownership of the objects behind them is tracked by the managers of this
/// crate. Every method taking a handle requires the handle to have been created by this same platform instance and
/// not been destroyed yet.
pub unsafe trait LifetimePlatform: Sized + Send + Sync + 'static {
	type PlatformCreateInfo: 'static;
	type PlatformCreateError: Error + Send + Sync + 'static;
	type Error: Error + Send + Sync + 'static;
	type DeviceMemory: Copy + Debug + Send + Sync + 'static;
	type Fence: Copy + Debug + Send + Sync + 'static;
	type Semaphore: Copy + Debug + Send + Sync + 'static;
	type CommandPool: Copy + Debug + Send + Sync + 'static;
	type CommandBuffer: Copy + Debug + Send + Sync + 'static;
	type DescriptorPool: Copy + Debug + Send + Sync + 'static;
	type DescriptorSetLayout: Copy + Debug + Eq + Hash + Send + Sync + 'static;
	type DescriptorSet: Copy + Debug + Send + Sync + 'static;
	type QueryPool: Copy + Debug + Send + Sync + 'static;

	/// Create the platform from its create info. Typically, the create info wraps the implementation's device and
	/// other objects required to be initialized by the end user.
	unsafe fn create_platform(create_info: Self::PlatformCreateInfo) -> Result<Self, Self::PlatformCreateError>;

	fn memory_properties(&self) -> &MemoryProperties;

	unsafe fn device_wait_idle(&self) -> Result<(), Self::Error>;

	// memory
	unsafe fn allocate_memory(&self, size: u64, memory_type_index: u32) -> Result<Self::DeviceMemory, Self::Error>;

	unsafe fn free_memory(&self, memory: Self::DeviceMemory);

	/// Map `size` bytes starting at `offset` of `memory`. The returned pointer stays valid until
	/// [`Self::unmap_memory`] is called.
	unsafe fn map_memory(&self, memory: Self::DeviceMemory, offset: u64, size: u64) -> Result<NonNull<u8>, Self::Error>;

	unsafe fn unmap_memory(&self, memory: Self::DeviceMemory);

	// fences and semaphores
	unsafe fn create_fence(&self) -> Result<Self::Fence, Self::Error>;

	unsafe fn destroy_fence(&self, fence: Self::Fence);

	/// Non-blocking poll, `true` if the fence has signaled.
	unsafe fn fence_status(&self, fence: Self::Fence) -> Result<bool, Self::Error>;

	/// Block until the fence signals or `timeout_ns` passes. Returns `false` if the timeout elapsed.
	unsafe fn wait_fence(&self, fence: Self::Fence, timeout_ns: u64) -> Result<bool, Self::Error>;

	unsafe fn reset_fence(&self, fence: Self::Fence) -> Result<(), Self::Error>;

	unsafe fn create_semaphore(&self) -> Result<Self::Semaphore, Self::Error>;

	unsafe fn destroy_semaphore(&self, semaphore: Self::Semaphore);

	// command buffers
	unsafe fn create_command_pool(&self, target: CommandTarget) -> Result<Self::CommandPool, Self::Error>;

	unsafe fn reset_command_pool(&self, pool: Self::CommandPool) -> Result<(), Self::Error>;

	unsafe fn destroy_command_pool(&self, pool: Self::CommandPool);

	unsafe fn allocate_command_buffer(
		&self,
		pool: Self::CommandPool,
		level: CommandBufferLevel,
	) -> Result<Self::CommandBuffer, Self::Error>;

	unsafe fn free_command_buffer(&self, pool: Self::CommandPool, cmd: Self::CommandBuffer);

	unsafe fn reset_command_buffer(&self, cmd: Self::CommandBuffer) -> Result<(), Self::Error>;

	unsafe fn begin_command_buffer(&self, cmd: Self::CommandBuffer, level: CommandBufferLevel)
	-> Result<(), Self::Error>;

	unsafe fn end_command_buffer(&self, cmd: Self::CommandBuffer) -> Result<(), Self::Error>;

	unsafe fn cmd_execute_commands(&self, cmd: Self::CommandBuffer, secondaries: &[Self::CommandBuffer]);

	/// Submit a primary command buffer to the queue of `target`. `fence` must be signaled once all work including
	/// the executed secondary command buffers has completed.
	unsafe fn submit(
		&self,
		target: CommandTarget,
		cmd: Self::CommandBuffer,
		wait_semaphores: &[(Self::Semaphore, PipelineStageFlags)],
		signal_semaphores: &[Self::Semaphore],
		fence: Self::Fence,
	) -> Result<(), Self::Error>;

	// descriptors
	unsafe fn create_descriptor_pool(
		&self,
		sizes: &DescriptorPoolSizes,
		max_sets: u32,
	) -> Result<Self::DescriptorPool, Self::Error>;

	/// Allocate a set from the pool. `Ok(None)` signals that the pool is exhausted or fragmented and a new pool
	/// should be used.
	unsafe fn allocate_descriptor_set(
		&self,
		pool: Self::DescriptorPool,
		layout: Self::DescriptorSetLayout,
	) -> Result<Option<Self::DescriptorSet>, Self::Error>;

	unsafe fn reset_descriptor_pool(&self, pool: Self::DescriptorPool) -> Result<(), Self::Error>;

	unsafe fn destroy_descriptor_pool(&self, pool: Self::DescriptorPool);

	// queries
	unsafe fn create_query_pool(&self, ty: QueryType, count: u32) -> Result<Self::QueryPool, Self::Error>;

	/// Reset queries from the host, without recording into a command buffer.
	unsafe fn reset_query_pool(&self, pool: Self::QueryPool, first: u32, count: u32);

	unsafe fn destroy_query_pool(&self, pool: Self::QueryPool);

	unsafe fn cmd_reset_query_pool(&self, cmd: Self::CommandBuffer, pool: Self::QueryPool, first: u32, count: u32);

	unsafe fn cmd_begin_query(&self, cmd: Self::CommandBuffer, pool: Self::QueryPool, query: u32);

	unsafe fn cmd_end_query(&self, cmd: Self::CommandBuffer, pool: Self::QueryPool, query: u32);

	unsafe fn cmd_write_timestamp(
		&self,
		cmd: Self::CommandBuffer,
		stage: PipelineStageFlags,
		pool: Self::QueryPool,
		query: u32,
	);

	/// Read 64-bit results of `out.len()` queries starting at `first`. Returns `false` if any result is not yet
	/// available, in which case `out` is unspecified. With `wait` set, blocks until the results are available.
	unsafe fn query_results(
		&self,
		pool: Self::QueryPool,
		first: u32,
		out: &mut [u64],
		wait: bool,
	) -> Result<bool, Self::Error>;
}
