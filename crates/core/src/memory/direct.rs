use crate::context::Device;
use crate::memory::{find_memory_type, AllocationError, AllocationOwner, AllocationRequest, MemoryAllocation};
use crate::platform::LifetimePlatform;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::atomic::{AtomicU64, AtomicUsize};
use std::sync::Arc;
use tracing::{error, trace};

/// Exactly one backend allocation per request. Host visible memory is persistently mapped.
pub struct DirectAllocator<P: LifetimePlatform> {
	device: Arc<Device<P>>,
	live_allocations: AtomicUsize,
	live_bytes: AtomicU64,
}

impl<P: LifetimePlatform> DirectAllocator<P> {
	pub fn new(device: Arc<Device<P>>) -> Self {
		Self {
			device,
			live_allocations: AtomicUsize::new(0),
			live_bytes: AtomicU64::new(0),
		}
	}

	#[inline]
	pub(crate) fn device(&self) -> &Arc<Device<P>> {
		&self.device
	}

	pub fn allocate(&self, request: &AllocationRequest) -> Result<MemoryAllocation<P>, AllocationError<P>> {
		let memory_type_index = find_memory_type(&self.device, request)?;
		self.allocate_in(memory_type_index, request.aligned_size())
	}

	pub(crate) fn allocate_in(
		&self,
		memory_type_index: u32,
		size: u64,
	) -> Result<MemoryAllocation<P>, AllocationError<P>> {
		let memory = unsafe { self.device.allocate_memory(size, memory_type_index) }.map_err(|e| {
			error!(size, memory_type_index, "failed to allocate device memory: {}", e);
			AllocationError::Platform(e)
		})?;

		let property_flags = self.device.memory_properties().property_flags(memory_type_index);
		let mapped = if property_flags.is_host_visible() {
			match unsafe { self.device.map_memory(memory, 0, size) } {
				Ok(ptr) => Some(ptr),
				Err(e) => {
					error!(size, memory_type_index, "failed to map device memory: {}", e);
					unsafe { self.device.free_memory(memory) };
					return Err(AllocationError::Platform(e));
				}
			}
		} else {
			None
		};

		self.live_allocations.fetch_add(1, Relaxed);
		self.live_bytes.fetch_add(size, Relaxed);
		trace!(?memory, size, memory_type_index, mapped = mapped.is_some(), "direct allocation");
		Ok(MemoryAllocation {
			memory,
			mapped,
			offset: 0,
			size,
			property_flags,
			memory_type_index,
			owner: AllocationOwner::Direct,
		})
	}

	pub fn free(&self, allocation: MemoryAllocation<P>) {
		assert_eq!(
			allocation.owner,
			AllocationOwner::Direct,
			"pooled allocation freed on the direct allocator"
		);
		unsafe {
			if allocation.mapped.is_some() {
				self.device.unmap_memory(allocation.memory);
			}
			self.device.free_memory(allocation.memory);
		}
		self.live_allocations.fetch_sub(1, Relaxed);
		self.live_bytes.fetch_sub(allocation.size, Relaxed);
		trace!(memory = ?allocation.memory, size = allocation.size, "direct free");
	}

	pub fn live_allocations(&self) -> usize {
		self.live_allocations.load(Relaxed)
	}

	pub fn live_bytes(&self) -> u64 {
		self.live_bytes.load(Relaxed)
	}
}
