use crate::context::Device;
use crate::deleter::PendingDeletion;
use crate::memory::{align_up, AllocationError, AllocationRequest, MemoryAllocation, MemoryAllocator};
use crate::platform::{LifetimePlatform, MemoryPropertyFlags};
use crate::resource::Resource;
use crate::rotation::{PoolRing, RotatingPool};
use bytemuck::Pod;
use parking_lot::Mutex;
use std::convert::Infallible;
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error};

pub struct UniformPool<P: LifetimePlatform> {
	allocation: MemoryAllocation<P>,
	resource: Resource,
	cursor: u64,
	alignment: u64,
}

impl<P: LifetimePlatform> RotatingPool for UniformPool<P> {
	fn resource(&self) -> &Resource {
		&self.resource
	}

	fn has_capacity_for(&self, request: u64) -> bool {
		align_up(self.cursor, self.alignment) + request <= self.allocation.size()
	}
}

/// A range of uniform data written into a host visible pool. Command buffers reading it must capture the resource.
pub struct UniformSlice<P: LifetimePlatform> {
	memory: P::DeviceMemory,
	offset: u64,
	size: u64,
	resource: Resource,
}

impl<P: LifetimePlatform> UniformSlice<P> {
	#[inline]
	pub fn memory(&self) -> P::DeviceMemory {
		self.memory
	}

	/// Offset within [`Self::memory`].
	#[inline]
	pub fn offset(&self) -> u64 {
		self.offset
	}

	#[inline]
	pub fn size(&self) -> u64 {
		self.size
	}

	#[inline]
	pub fn resource(&self) -> &Resource {
		&self.resource
	}
}

impl<P: LifetimePlatform> Clone for UniformSlice<P> {
	fn clone(&self) -> Self {
		Self {
			memory: self.memory,
			offset: self.offset,
			size: self.size,
			resource: self.resource.clone(),
		}
	}
}

impl<P: LifetimePlatform> Debug for UniformSlice<P> {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("UniformSlice")
			.field("memory", &self.memory)
			.field("offset", &self.offset)
			.field("size", &self.size)
			.finish()
	}
}

#[derive(Error)]
#[non_exhaustive]
pub enum UniformError<P: LifetimePlatform> {
	#[error("Allocation Error: {0}")]
	Allocation(#[from] AllocationError<P>),
	#[error("Uniform data of {size} bytes does not fit into a pool of {pool_size} bytes")]
	TooLarge { size: u64, pool_size: u64 },
	#[error("Uniform pool memory is not host visible")]
	NotHostVisible,
	#[error("Copy into uniform pool failed: {0:?}")]
	Copy(presser::CopyError),
}

impl<P: LifetimePlatform> Debug for UniformError<P> {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		Display::fmt(self, f)
	}
}

/// Linear allocator for per-frame uniform data. Writes are appended to the current pool, a pool is rewound once no
/// command buffer captures it anymore.
pub struct UniformBufferManager<P: LifetimePlatform> {
	allocator: Arc<MemoryAllocator<P>>,
	pool_size: u64,
	alignment: u64,
	ring: Mutex<PoolRing<UniformPool<P>>>,
	device: Arc<Device<P>>,
}

impl<P: LifetimePlatform> UniformBufferManager<P> {
	pub fn new(device: Arc<Device<P>>, allocator: Arc<MemoryAllocator<P>>, pool_size: u64, alignment: u64) -> Self {
		let alignment = alignment.max(1).next_power_of_two();
		Self {
			allocator,
			pool_size: align_up(pool_size.max(1), alignment),
			alignment,
			ring: Mutex::new(PoolRing::new()),
			device,
		}
	}

	#[inline]
	pub fn pool_size(&self) -> u64 {
		self.pool_size
	}

	#[inline]
	pub fn alignment(&self) -> u64 {
		self.alignment
	}

	pub fn write<T: Pod>(&self, value: &T) -> Result<UniformSlice<P>, UniformError<P>> {
		self.write_bytes(bytemuck::bytes_of(value))
	}

	pub fn write_slice<T: Pod>(&self, values: &[T]) -> Result<UniformSlice<P>, UniformError<P>> {
		self.write_bytes(bytemuck::cast_slice(values))
	}

	fn write_bytes(&self, bytes: &[u8]) -> Result<UniformSlice<P>, UniformError<P>> {
		let size = bytes.len() as u64;
		if size > self.pool_size {
			error!(size, pool_size = self.pool_size, "uniform data does not fit into a pool");
			return Err(UniformError::TooLarge {
				size,
				pool_size: self.pool_size,
			});
		}

		let mut ring = self.ring.lock();
		let pool = ring.acquire(size, || self.create_pool())?;
		let start = align_up(pool.cursor, pool.alignment);
		let mut slab = pool.allocation.mapped_slab().ok_or(UniformError::NotHostVisible)?;
		let record = presser::copy_from_slice_to_offset(bytes, &mut slab, start as usize).map_err(UniformError::Copy)?;
		pool.cursor = record.copy_end_offset as u64;
		Ok(UniformSlice {
			memory: pool.allocation.memory(),
			offset: pool.allocation.offset() + record.copy_start_offset as u64,
			size,
			resource: pool.resource.clone(),
		})
	}

	fn create_pool(&self) -> Result<UniformPool<P>, UniformError<P>> {
		let request = AllocationRequest::new(
			self.pool_size,
			self.alignment,
			MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT,
		);
		let allocation = self.allocator.allocate(&request)?;
		if allocation.mapped_ptr().is_none() {
			self.allocator.free(allocation);
			return Err(UniformError::NotHostVisible);
		}
		debug!(size = self.pool_size, ?allocation, "created uniform pool");
		Ok(UniformPool {
			allocation,
			resource: self.device.resources().create("uniform pool"),
			cursor: 0,
			alignment: self.alignment,
		})
	}

	/// Rewind every pool no command buffer captures anymore. Returns the number of rewound pools.
	pub fn update(&self) -> usize {
		profiling::function_scope!();
		self.ring
			.lock()
			.update(|pool| -> Result<bool, Infallible> {
				pool.cursor = 0;
				Ok(true)
			})
			.unwrap_or_else(|e| match e {})
	}

	pub(crate) fn trim(&self, max_free: usize) -> Vec<(Resource, PendingDeletion<P>)> {
		self.ring.lock().trim(max_free).map(Self::into_deletion).collect()
	}

	pub(crate) fn drain(&self) -> Vec<(Resource, PendingDeletion<P>)> {
		self.ring.lock().drain().map(Self::into_deletion).collect()
	}

	fn into_deletion(pool: UniformPool<P>) -> (Resource, PendingDeletion<P>) {
		(pool.resource, PendingDeletion::Memory(pool.allocation))
	}

	pub fn pool_count(&self) -> usize {
		self.ring.lock().len()
	}

	pub fn free_pool_count(&self) -> usize {
		self.ring.lock().free_len()
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::command::CommandBufferManager;
	use crate::deleter::ResourceDeleter;
	use crate::memory::AllocatorStrategy;
	use crate::platform::headless::{Headless, HeadlessCreateInfo};
	use crate::platform::{CommandBufferLevel, CommandTarget};

	fn setup(strategy: AllocatorStrategy) -> (Arc<Device<Headless>>, Arc<MemoryAllocator<Headless>>) {
		crate::init_test_logging();
		let device = Device::new(Headless::new(HeadlessCreateInfo::default()), 0);
		let allocator = Arc::new(MemoryAllocator::new(device.clone(), strategy));
		(device, allocator)
	}

	#[test]
	fn writes_land_at_aligned_offsets() -> anyhow::Result<()> {
		let (device, allocator) = setup(AllocatorStrategy::default());
		let uniforms = UniformBufferManager::new(device.clone(), allocator, 1024, 256);

		let a = uniforms.write(&0x1122_3344_u32)?;
		let b = uniforms.write_slice(&[1.0f32, 2.0, 3.0])?;
		assert_eq!(a.memory(), b.memory());
		assert_eq!(a.offset() % 256, 0);
		assert_eq!(b.offset(), a.offset() + 256);
		assert_eq!(b.size(), 12);

		let read = device
			.read_memory(a.memory(), a.offset(), 4)
			.ok_or_else(|| anyhow::anyhow!("out of bounds"))?;
		assert_eq!(read, 0x1122_3344_u32.to_ne_bytes());
		let read = device
			.read_memory(b.memory(), b.offset(), 12)
			.ok_or_else(|| anyhow::anyhow!("out of bounds"))?;
		assert_eq!(read, bytemuck::cast_slice::<f32, u8>(&[1.0, 2.0, 3.0]));
		Ok(())
	}

	#[test]
	fn full_pool_rotates_and_rewinds() -> anyhow::Result<()> {
		let (device, allocator) = setup(AllocatorStrategy::Direct);
		let manager = CommandBufferManager::new(device.clone(), CommandTarget::Draw)?;
		let uniforms = UniformBufferManager::new(device.clone(), allocator, 512, 256);

		let first = uniforms.write(&[0u8; 300])?;
		let cmd = manager.acquire(CommandBufferLevel::Primary)?;
		cmd.begin()?;
		cmd.capture(first.resource(), 0)?;
		cmd.end()?;
		manager.submit(&cmd, &[])?;

		let second = uniforms.write(&[0u8; 300])?;
		assert_ne!(first.resource(), second.resource());
		assert_eq!(uniforms.update(), 0);

		device.complete_all();
		device.advance_frame();
		manager.update()?;
		assert_eq!(uniforms.update(), 1);
		let third = uniforms.write(&[0u8; 300])?;
		assert_eq!((third.resource(), third.offset()), (first.resource(), first.offset()));
		Ok(())
	}

	#[test]
	fn oversized_write_is_refused() -> anyhow::Result<()> {
		let (device, allocator) = setup(AllocatorStrategy::default());
		let uniforms = UniformBufferManager::new(device, allocator, 256, 256);
		assert!(matches!(
			uniforms.write(&[0u8; 257]),
			Err(UniformError::TooLarge { size: 257, pool_size: 256 })
		));
		assert_eq!(uniforms.pool_count(), 0);
		Ok(())
	}

	#[test]
	fn drained_pools_are_freed_by_the_deleter() -> anyhow::Result<()> {
		let (device, allocator) = setup(AllocatorStrategy::Direct);
		let managers = [CommandBufferManager::new(device.clone(), CommandTarget::Draw)?];
		let deleter = ResourceDeleter::new(device.clone(), allocator.clone());
		let uniforms = UniformBufferManager::new(device.clone(), allocator.clone(), 256, 256);
		uniforms.write(&7u64)?;
		uniforms.write(&[0u8; 200])?;
		assert_eq!(allocator.direct().live_allocations(), 2);

		for (resource, deletion) in uniforms.drain() {
			deleter.add_resource_to_delete(resource, deletion, false, &managers[..]);
		}
		assert_eq!(allocator.direct().live_allocations(), 0);
		assert_eq!(device.object_counts().memory, 0);
		Ok(())
	}
}
