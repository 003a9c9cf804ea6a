mod device;

pub use device::*;

use crate::command::{
	CommandBuffer, CommandBufferError, CommandBufferId, CommandBufferManager, PooledSemaphore, SemaphoreManager,
};
use crate::deleter::{DeletionOutcome, PendingDeletion, ResourceDeleter};
use crate::memory::{AllocationError, AllocationRequest, AllocatorStrategy, MemoryAllocation, MemoryAllocator};
use crate::platform::{CommandBufferLevel, CommandTarget, DescriptorPoolSizes, LifetimePlatform};
use crate::resource::Resource;
use crate::rotation::{
	DescriptorError, DescriptorPoolStrategy, DescriptorSetAllocator, QueryError, QueryPoolManager,
	UniformBufferManager, UniformError,
};
use std::borrow::Cow;
use std::fmt::{Debug, Display, Formatter};
use std::ops::Deref;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, trace};

#[derive(Copy, Clone, Debug)]
pub struct LifetimeConfig {
	/// Frames that may be in flight at once. Work captured in frame `f` is retired no earlier than frame
	/// `f + swapchain_image_count + 1`.
	pub swapchain_image_count: u32,
	pub allocator: AllocatorStrategy,
	pub descriptor_pool_strategy: DescriptorPoolStrategy,
	pub descriptor_pool_sizes: DescriptorPoolSizes,
	pub descriptor_max_sets: u32,
	pub query_pool_capacity: u32,
	pub uniform_pool_size: u64,
	pub uniform_alignment: u64,
	/// Free pools kept around per pool ring, any beyond are destroyed on [`GpuContextInner::tick`].
	pub max_free_pools: usize,
}

impl Default for LifetimeConfig {
	fn default() -> Self {
		Self {
			swapchain_image_count: 3,
			allocator: AllocatorStrategy::default(),
			descriptor_pool_strategy: DescriptorPoolStrategy::default(),
			descriptor_pool_sizes: DescriptorPoolSizes::REASONABLE_DEFAULTS,
			descriptor_max_sets: 256,
			query_pool_capacity: 64,
			uniform_pool_size: 64 * 1024,
			uniform_alignment: 256,
			max_free_pools: 8,
		}
	}
}

#[derive(Error)]
#[non_exhaustive]
pub enum ContextError<P: LifetimePlatform> {
	#[error("Platform creation failed: {0}")]
	PlatformCreate(#[source] P::PlatformCreateError),
	#[error("Platform Error: {0}")]
	Platform(#[source] P::Error),
	#[error("{0}")]
	CommandBuffer(#[from] CommandBufferError<P>),
	#[error("{0}")]
	Allocation(#[from] AllocationError<P>),
	#[error("{0}")]
	Descriptor(#[from] DescriptorError<P>),
	#[error("{0}")]
	Query(#[from] QueryError<P>),
	#[error("{0}")]
	Uniform(#[from] UniformError<P>),
}

impl<P: LifetimePlatform> Debug for ContextError<P> {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		Display::fmt(self, f)
	}
}

/// Handle to the owner of every lifetime manager. Cloning creates another handle, the managers are shut down once
/// the last handle is dropped.
pub struct GpuContext<P: LifetimePlatform>(Arc<GpuContextInner<P>>);

impl<P: LifetimePlatform> Clone for GpuContext<P> {
	fn clone(&self) -> Self {
		Self(self.0.clone())
	}
}

impl<P: LifetimePlatform> Deref for GpuContext<P> {
	type Target = GpuContextInner<P>;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}

pub struct GpuContextInner<P: LifetimePlatform> {
	config: LifetimeConfig,
	managers: [CommandBufferManager<P>; 3],
	semaphores: SemaphoreManager<P>,
	descriptor_sets: DescriptorSetAllocator<P>,
	queries: QueryPoolManager<P>,
	uniforms: UniformBufferManager<P>,
	deleter: ResourceDeleter<P>,
	allocator: Arc<MemoryAllocator<P>>,
	device: Arc<Device<P>>,
}

impl<P: LifetimePlatform> GpuContext<P> {
	/// Create the platform and every manager on top of it.
	///
	/// # Safety
	/// There must only be one `GpuContext` for each backend device.
	pub unsafe fn new(
		create_info: P::PlatformCreateInfo,
		config: &LifetimeConfig,
	) -> Result<Self, ContextError<P>> {
		let platform = unsafe { P::create_platform(create_info) }.map_err(|e| {
			error!("failed to create platform: {}", e);
			ContextError::PlatformCreate(e)
		})?;
		let device = Device::new(platform, config.swapchain_image_count);
		let allocator = Arc::new(MemoryAllocator::new(device.clone(), config.allocator));
		let [draw, upload, transition] = CommandTarget::ALL;
		let managers = [
			CommandBufferManager::new(device.clone(), draw)?,
			CommandBufferManager::new(device.clone(), upload)?,
			CommandBufferManager::new(device.clone(), transition)?,
		];
		info!(
			swapchain_image_count = config.swapchain_image_count,
			allocator = ?config.allocator,
			descriptor_pool_strategy = ?config.descriptor_pool_strategy,
			"created gpu context"
		);
		Ok(Self(Arc::new(GpuContextInner {
			config: *config,
			managers,
			semaphores: SemaphoreManager::new(device.clone()),
			descriptor_sets: DescriptorSetAllocator::new(
				device.clone(),
				config.descriptor_pool_strategy,
				config.descriptor_pool_sizes,
				config.descriptor_max_sets,
			),
			queries: QueryPoolManager::new(device.clone(), config.query_pool_capacity),
			uniforms: UniformBufferManager::new(
				device.clone(),
				allocator.clone(),
				config.uniform_pool_size,
				config.uniform_alignment,
			),
			deleter: ResourceDeleter::new(device.clone(), allocator.clone()),
			allocator,
			device,
		})))
	}
}

/// Remember the first error of a sequence of steps that all have to run.
fn keep_first<P: LifetimePlatform, T, E: Into<ContextError<P>>>(
	first_err: &mut Option<ContextError<P>>,
	result: Result<T, E>,
) -> Option<T> {
	match result {
		Ok(t) => Some(t),
		Err(e) => {
			first_err.get_or_insert(e.into());
			None
		}
	}
}

impl<P: LifetimePlatform> GpuContextInner<P> {
	#[inline]
	pub fn device(&self) -> &Arc<Device<P>> {
		&self.device
	}

	#[inline]
	pub fn platform(&self) -> &P {
		&self.device.platform
	}

	#[inline]
	pub fn config(&self) -> &LifetimeConfig {
		&self.config
	}

	#[inline]
	pub fn frame(&self) -> u64 {
		self.device.frame()
	}

	/// Create a new [`Resource`] to track the GPU usage of some object.
	pub fn create_resource(&self, name: impl Into<Cow<'static, str>>) -> Resource {
		self.device.resources().create(name)
	}

	#[inline]
	pub fn command_manager(&self, target: CommandTarget) -> &CommandBufferManager<P> {
		&self.managers[target.to_usize()]
	}

	pub fn command_buffer(&self, id: CommandBufferId) -> Option<Arc<CommandBuffer<P>>> {
		self.command_manager(id.target()).command_buffer(id)
	}

	#[inline]
	pub fn semaphores(&self) -> &SemaphoreManager<P> {
		&self.semaphores
	}

	#[inline]
	pub fn descriptor_sets(&self) -> &DescriptorSetAllocator<P> {
		&self.descriptor_sets
	}

	#[inline]
	pub fn queries(&self) -> &QueryPoolManager<P> {
		&self.queries
	}

	#[inline]
	pub fn uniforms(&self) -> &UniformBufferManager<P> {
		&self.uniforms
	}

	#[inline]
	pub fn allocator(&self) -> &MemoryAllocator<P> {
		&self.allocator
	}

	#[inline]
	pub fn deleter(&self) -> &ResourceDeleter<P> {
		&self.deleter
	}

	/// Capture `resource` on `cmd` in `frame`, 0 being the current frame.
	pub fn capture(&self, cmd: &CommandBuffer<P>, resource: &Resource, frame: u64) -> Result<(), ContextError<P>> {
		Ok(cmd.capture(resource, frame)?)
	}

	pub fn acquire_command_buffer(
		&self,
		target: CommandTarget,
		level: CommandBufferLevel,
	) -> Result<Arc<CommandBuffer<P>>, ContextError<P>> {
		Ok(self.command_manager(target).acquire(level)?)
	}

	/// Acquire a secondary command buffer to be executed within `primary`. Captures on it are forwarded to
	/// `primary`.
	pub fn acquire_secondary_command_buffer(
		&self,
		primary: &Arc<CommandBuffer<P>>,
	) -> Result<Arc<CommandBuffer<P>>, ContextError<P>> {
		Ok(self.command_manager(primary.target()).acquire_secondary(primary)?)
	}

	pub fn begin_command_buffer(&self, cmd: &CommandBuffer<P>) -> Result<(), ContextError<P>> {
		Ok(cmd.begin()?)
	}

	pub fn end_command_buffer(&self, cmd: &CommandBuffer<P>) -> Result<(), ContextError<P>> {
		Ok(cmd.end()?)
	}

	pub fn submit(
		&self,
		cmd: &Arc<CommandBuffer<P>>,
		signal_semaphores: &[&PooledSemaphore<P>],
	) -> Result<(), ContextError<P>> {
		Ok(self.command_manager(cmd.target()).submit(cmd, signal_semaphores)?)
	}

	/// See [`CommandBuffer::wait_complete`].
	pub fn wait_complete(&self, cmd: &CommandBuffer<P>, timeout_ns: u64) -> Result<bool, ContextError<P>> {
		Ok(cmd.wait_complete(timeout_ns)?)
	}

	pub fn allocate(&self, request: &AllocationRequest) -> Result<MemoryAllocation<P>, ContextError<P>> {
		Ok(self.allocator.allocate(request)?)
	}

	/// Free an allocation right away. Use [`Self::add_resource_to_delete`] for memory the GPU may still access.
	pub fn free(&self, allocation: MemoryAllocation<P>) {
		self.allocator.free(allocation)
	}

	/// Destroy an object once `resource` is not captured anymore, see [`ResourceDeleter::add_resource_to_delete`].
	pub fn add_resource_to_delete(
		&self,
		resource: Resource,
		deletion: PendingDeletion<P>,
		force_wait: bool,
	) -> DeletionOutcome {
		self.deleter
			.add_resource_to_delete(resource, deletion, force_wait, &self.managers[..])
	}

	fn delete_all(&self, pools: Vec<(Resource, PendingDeletion<P>)>, force_wait: bool) {
		for (resource, deletion) in pools {
			self.add_resource_to_delete(resource, deletion, force_wait);
		}
	}

	/// Advance to the next frame: retire completed command buffers, rotate the pools and run deferred deletions.
	/// Every step runs even if an earlier one fails, the first error is returned. Returns the new frame index.
	pub fn tick(&self) -> Result<u64, ContextError<P>> {
		profiling::function_scope!();
		let mut first_err: Option<ContextError<P>> = None;
		let mut retired = 0;
		for manager in &self.managers {
			retired += keep_first(&mut first_err, manager.update()).unwrap_or(0);
		}
		let semaphores = self.semaphores.update();

		keep_first(&mut first_err, self.descriptor_sets.update());
		self.delete_all(self.descriptor_sets.trim(self.config.max_free_pools), false);

		keep_first(&mut first_err, self.queries.update_render_queries());
		self.delete_all(self.queries.trim(self.config.max_free_pools), false);

		self.uniforms.update();
		self.delete_all(self.uniforms.trim(self.config.max_free_pools), false);

		let deleted = self.deleter.update(false, &self.managers[..]);
		let frame = self.device.advance_frame();
		trace!(frame, retired, semaphores, deleted, "tick");
		match first_err {
			None => Ok(frame),
			Some(e) => Err(e),
		}
	}

	/// Block until the GPU is idle, then retire every command buffer and run every deferred deletion regardless of
	/// the frame-pipelining window.
	pub fn wait_idle(&self) -> Result<(), ContextError<P>> {
		profiling::function_scope!();
		let mut first_err: Option<ContextError<P>> = None;
		keep_first(
			&mut first_err,
			unsafe { self.device.device_wait_idle() }.map_err(ContextError::Platform),
		);

		let bypass = self.device.bypass_pipelining_window();
		for manager in &self.managers {
			keep_first(&mut first_err, manager.wait_complete_all(0));
			keep_first(&mut first_err, manager.update());
		}
		self.semaphores.update();
		keep_first(&mut first_err, self.descriptor_sets.update());
		keep_first(&mut first_err, self.queries.update_render_queries());
		self.uniforms.update();
		self.deleter.update(true, &self.managers[..]);
		drop(bypass);

		match first_err {
			None => Ok(()),
			Some(e) => Err(e),
		}
	}
}

impl<P: LifetimePlatform> Drop for GpuContextInner<P> {
	fn drop(&mut self) {
		if let Err(e) = self.wait_idle() {
			error!("failed to wait for the device to become idle during shutdown: {}", e);
		}
		self.delete_all(self.descriptor_sets.drain(), true);
		self.delete_all(self.queries.drain(), true);
		self.delete_all(self.uniforms.drain(), true);
		let drained = self.deleter.drain_all();
		let released = self.allocator.as_pool().map_or(0, |pool| pool.release_all());
		debug!(drained, released, "gpu context shut down");
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::platform::headless::{Headless, HeadlessCreateInfo};
	use crate::platform::MemoryPropertyFlags;
	use std::sync::atomic::AtomicUsize;
	use std::sync::atomic::Ordering::Relaxed;

	fn context(swapchain_image_count: u32) -> anyhow::Result<GpuContext<Headless>> {
		let config = LifetimeConfig {
			swapchain_image_count,
			..LifetimeConfig::default()
		};
		crate::init_test_logging();
		Ok(unsafe { GpuContext::new(HeadlessCreateInfo::default(), &config)? })
	}

	#[test]
	fn tick_retires_after_swapchain_frames() -> anyhow::Result<()> {
		let ctx = context(2)?;
		let resource = ctx.create_resource("texture");
		let cmd = ctx.acquire_command_buffer(CommandTarget::Draw, CommandBufferLevel::Primary)?;
		ctx.begin_command_buffer(&cmd)?;
		ctx.capture(&cmd, &resource, 0)?;
		ctx.end_command_buffer(&cmd)?;
		ctx.submit(&cmd, &[])?;
		ctx.platform().complete_all();

		// captured in frame 1, safe once the frame exceeds 1 + 2
		assert_eq!(ctx.tick()?, 2);
		assert_eq!(ctx.tick()?, 3);
		assert!(resource.is_captured());
		assert_eq!(ctx.tick()?, 4);
		assert!(resource.is_captured());
		ctx.tick()?;
		assert!(!resource.is_captured());
		Ok(())
	}

	#[test]
	fn wait_idle_keeps_frame_counter() -> anyhow::Result<()> {
		let ctx = context(2)?;
		ctx.tick()?;
		ctx.wait_idle()?;
		assert_eq!(ctx.frame(), 2);

		let resource = ctx.create_resource("texture");
		let cmd = ctx.acquire_command_buffer(CommandTarget::Draw, CommandBufferLevel::Primary)?;
		ctx.begin_command_buffer(&cmd)?;
		ctx.capture(&cmd, &resource, 0)?;
		ctx.end_command_buffer(&cmd)?;
		ctx.submit(&cmd, &[])?;
		assert_eq!(cmd.captured_frame(), 2);
		ctx.platform().complete_all();

		// the window applies again once wait_idle returned
		for _ in 0..3 {
			ctx.tick()?;
			assert!(resource.is_captured());
		}
		ctx.tick()?;
		assert!(!resource.is_captured());
		Ok(())
	}

	#[test]
	fn deferred_deletion_runs_on_tick() -> anyhow::Result<()> {
		let ctx = context(0)?;
		let deleted = Arc::new(AtomicUsize::new(0));
		let resource = ctx.create_resource("buffer");
		let cmd = ctx.acquire_command_buffer(CommandTarget::Upload, CommandBufferLevel::Primary)?;
		ctx.begin_command_buffer(&cmd)?;
		ctx.capture(&cmd, &resource, 0)?;
		ctx.end_command_buffer(&cmd)?;
		ctx.submit(&cmd, &[])?;

		let counter = deleted.clone();
		let outcome = ctx.add_resource_to_delete(
			resource,
			PendingDeletion::Custom(Box::new(move |_| {
				counter.fetch_add(1, Relaxed);
			})),
			false,
		);
		assert_eq!(outcome, DeletionOutcome::Deferred);
		ctx.tick()?;
		assert_eq!(deleted.load(Relaxed), 0);

		ctx.platform().complete_all();
		ctx.tick()?;
		assert_eq!(deleted.load(Relaxed), 1);
		Ok(())
	}

	#[test]
	fn drop_releases_every_backend_object() -> anyhow::Result<()> {
		let platform_counts;
		{
			let ctx = context(3)?;
			let allocation = ctx.allocate(&AllocationRequest::new(1024, 256, MemoryPropertyFlags::DEVICE_LOCAL))?;
			let resource = ctx.create_resource("buffer");
			let cmd = ctx.acquire_command_buffer(CommandTarget::Draw, CommandBufferLevel::Primary)?;
			ctx.begin_command_buffer(&cmd)?;
			ctx.capture(&cmd, &resource, 0)?;
			ctx.descriptor_sets()
				.allocate(crate::platform::headless::HeadlessDescriptorSetLayout::new(0))?;
			ctx.queries().allocate(crate::platform::QueryType::Timestamp, 4)?;
			ctx.uniforms().write(&[1u32, 2, 3, 4])?;
			ctx.end_command_buffer(&cmd)?;
			let semaphore = ctx.semaphores().acquire()?;
			ctx.submit(&cmd, &[&semaphore])?;
			ctx.add_resource_to_delete(resource, PendingDeletion::Memory(allocation), false);
			assert_eq!(ctx.deleter().pending(), 1);

			ctx.wait_idle()?;
			assert_eq!(ctx.deleter().pending(), 0);
			assert_eq!(ctx.frame(), 1);
			platform_counts = ctx.device().clone();
		}
		let counts = platform_counts.object_counts();
		assert_eq!(counts.memory, 0);
		assert_eq!(counts.descriptor_pools, 0);
		assert_eq!(counts.query_pools, 0);
		assert_eq!(counts.semaphores, 0);
		assert_eq!(counts.fences, 0);
		assert_eq!(counts.command_pools, 0);
		Ok(())
	}
}
