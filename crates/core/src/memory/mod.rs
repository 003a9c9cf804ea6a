//! Device memory allocation. A [`MemoryAllocator`] is either a [`DirectAllocator`], making one backend allocation per
//! request, or a [`PoolAllocator`] sub-allocating chunks out of large backing allocations.

mod direct;
mod pool;

pub use direct::*;
pub use pool::*;

use crate::context::Device;
use crate::platform::{LifetimePlatform, MemoryPropertyFlags};
use std::fmt::{Debug, Display, Formatter};
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::Arc;
use thiserror::Error;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AllocationRequest {
	pub size: u64,
	pub alignment: u64,
	/// Bitmask of allowed memory type indices.
	pub memory_type_bits: u32,
	pub property_flags: MemoryPropertyFlags,
	/// The driver advises a 1:1 allocation for this resource.
	pub dedicated: bool,
}

impl Default for AllocationRequest {
	fn default() -> Self {
		Self {
			size: 0,
			alignment: 1,
			memory_type_bits: !0,
			property_flags: MemoryPropertyFlags::empty(),
			dedicated: false,
		}
	}
}

impl AllocationRequest {
	pub fn new(size: u64, alignment: u64, property_flags: MemoryPropertyFlags) -> Self {
		Self {
			size,
			alignment,
			property_flags,
			..Self::default()
		}
	}

	/// Dedicated requests bypass any pooling: either the driver asked for it, or the request is for device local
	/// memory that is also host coherent or host cached.
	pub fn is_dedicated(&self) -> bool {
		self.dedicated
			|| (self.property_flags.contains(MemoryPropertyFlags::DEVICE_LOCAL)
				&& self
					.property_flags
					.intersects(MemoryPropertyFlags::HOST_COHERENT | MemoryPropertyFlags::HOST_CACHED))
	}

	/// The size the allocation will have, rounded up to the alignment.
	pub fn aligned_size(&self) -> u64 {
		align_up(self.size.max(1), self.alignment)
	}
}

#[inline]
pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
	let alignment = alignment.max(1);
	value.div_ceil(alignment) * alignment
}

/// Which allocator an allocation has to be returned to.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AllocationOwner {
	Direct,
	Pool { pool: PoolId, chunk_offset: u64 },
}

/// A byte range `offset..offset + size` of a backend memory allocation. Must be returned to the allocator it came
/// from, usually through the [`ResourceDeleter`](crate::deleter::ResourceDeleter).
pub struct MemoryAllocation<P: LifetimePlatform> {
	memory: P::DeviceMemory,
	/// already offset to the start of this allocation
	mapped: Option<NonNull<u8>>,
	offset: u64,
	size: u64,
	property_flags: MemoryPropertyFlags,
	memory_type_index: u32,
	owner: AllocationOwner,
}

// Safety: the mapped pointer is only dereferenced through `&mut self`
unsafe impl<P: LifetimePlatform> Send for MemoryAllocation<P> {}
unsafe impl<P: LifetimePlatform> Sync for MemoryAllocation<P> {}

impl<P: LifetimePlatform> MemoryAllocation<P> {
	#[inline]
	pub fn memory(&self) -> P::DeviceMemory {
		self.memory
	}

	#[inline]
	pub fn offset(&self) -> u64 {
		self.offset
	}

	#[inline]
	pub fn size(&self) -> u64 {
		self.size
	}

	#[inline]
	pub fn property_flags(&self) -> MemoryPropertyFlags {
		self.property_flags
	}

	#[inline]
	pub fn memory_type_index(&self) -> u32 {
		self.memory_type_index
	}

	#[inline]
	pub fn owner(&self) -> AllocationOwner {
		self.owner
	}

	#[inline]
	pub fn mapped_ptr(&self) -> Option<NonNull<u8>> {
		self.mapped
	}

	/// The mapped bytes of this allocation as a [`presser::Slab`], `None` if not host visible.
	pub fn mapped_slab(&mut self) -> Option<MappedSlab<'_>> {
		let ptr = self.mapped?;
		Some(MappedSlab {
			ptr,
			size: usize::try_from(self.size).ok()?,
			_phantom: PhantomData,
		})
	}
}

impl<P: LifetimePlatform> Debug for MemoryAllocation<P> {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("MemoryAllocation")
			.field("memory", &self.memory)
			.field("offset", &self.offset)
			.field("size", &self.size)
			.field("property_flags", &self.property_flags)
			.field("memory_type_index", &self.memory_type_index)
			.field("owner", &self.owner)
			.field("mapped", &self.mapped.is_some())
			.finish()
	}
}

pub struct MappedSlab<'a> {
	ptr: NonNull<u8>,
	size: usize,
	_phantom: PhantomData<&'a mut [u8]>,
}

unsafe impl presser::Slab for MappedSlab<'_> {
	fn base_ptr(&self) -> *const u8 {
		self.ptr.as_ptr()
	}

	fn base_ptr_mut(&mut self) -> *mut u8 {
		self.ptr.as_ptr()
	}

	fn size(&self) -> usize {
		self.size
	}
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AllocatorStrategy {
	Direct,
	Pool { pool_size: u64 },
}

impl Default for AllocatorStrategy {
	fn default() -> Self {
		AllocatorStrategy::Pool {
			pool_size: 64 * 1024 * 1024,
		}
	}
}

#[derive(Error)]
#[non_exhaustive]
pub enum AllocationError<P: LifetimePlatform> {
	#[error("Platform Error: {0}")]
	Platform(#[source] P::Error),
	#[error("No memory type in {memory_type_bits:#x} has the properties {property_flags:?}")]
	NoSuitableMemoryType {
		memory_type_bits: u32,
		property_flags: MemoryPropertyFlags,
	},
	#[error("Allocation of {size} bytes exceeds the pool size of {pool_size} bytes")]
	ExceedsPoolSize { size: u64, pool_size: u64 },
}

impl<P: LifetimePlatform> Debug for AllocationError<P> {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		Display::fmt(self, f)
	}
}

pub(crate) fn find_memory_type<P: LifetimePlatform>(
	device: &Device<P>,
	request: &AllocationRequest,
) -> Result<u32, AllocationError<P>> {
	device
		.memory_properties()
		.find_memory_type_index(request.memory_type_bits, request.property_flags)
		.ok_or(AllocationError::NoSuitableMemoryType {
			memory_type_bits: request.memory_type_bits,
			property_flags: request.property_flags,
		})
}

pub enum MemoryAllocator<P: LifetimePlatform> {
	Direct(DirectAllocator<P>),
	Pool(PoolAllocator<P>),
}

impl<P: LifetimePlatform> MemoryAllocator<P> {
	pub fn new(device: Arc<Device<P>>, strategy: AllocatorStrategy) -> Self {
		match strategy {
			AllocatorStrategy::Direct => MemoryAllocator::Direct(DirectAllocator::new(device)),
			AllocatorStrategy::Pool { pool_size } => MemoryAllocator::Pool(PoolAllocator::new(device, pool_size)),
		}
	}

	/// Dedicated requests and requests of at least the pool size are always served by the direct strategy.
	pub fn allocate(&self, request: &AllocationRequest) -> Result<MemoryAllocation<P>, AllocationError<P>> {
		profiling::function_scope!();
		match self {
			MemoryAllocator::Direct(direct) => direct.allocate(request),
			MemoryAllocator::Pool(pool) => {
				if request.is_dedicated() || request.aligned_size() >= pool.pool_size() {
					pool.direct().allocate(request)
				} else {
					pool.allocate(request)
				}
			}
		}
	}

	pub fn free(&self, allocation: MemoryAllocation<P>) {
		profiling::function_scope!();
		match self {
			MemoryAllocator::Direct(direct) => direct.free(allocation),
			MemoryAllocator::Pool(pool) => pool.free(allocation),
		}
	}

	/// The allocator backing allocations that bypass pooling.
	pub fn direct(&self) -> &DirectAllocator<P> {
		match self {
			MemoryAllocator::Direct(direct) => direct,
			MemoryAllocator::Pool(pool) => pool.direct(),
		}
	}

	pub fn as_pool(&self) -> Option<&PoolAllocator<P>> {
		match self {
			MemoryAllocator::Direct(_) => None,
			MemoryAllocator::Pool(pool) => Some(pool),
		}
	}
}
