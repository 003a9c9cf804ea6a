use crate::backing::arena::{Arena, ArenaId};
use crate::context::Device;
use crate::memory::{
	align_up, find_memory_type, AllocationError, AllocationOwner, AllocationRequest, DirectAllocator, MemoryAllocation,
};
use crate::platform::LifetimePlatform;
use parking_lot::Mutex;
use rangemap::RangeSet;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Debug, Formatter};
use std::ptr::NonNull;
use std::sync::Arc;
use tracing::{debug, trace};

/// Identifies a pool of a [`PoolAllocator`].
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct PoolId {
	memory_type_index: u32,
	id: ArenaId,
}

impl PoolId {
	#[inline]
	pub fn memory_type_index(&self) -> u32 {
		self.memory_type_index
	}
}

impl Debug for PoolId {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "Pool({}:{:?})", self.memory_type_index, self.id)
	}
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Chunk {
	pub size: u64,
	pub free: bool,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PoolStats {
	pub pools: usize,
	pub chunks: usize,
	pub free_chunks: usize,
	pub free_bytes: u64,
	pub backing_bytes: u64,
}

/// One backing allocation cut into chunks.
///
/// `chunks` tiles `0..size` exactly, `free` indexes the free chunks by `(size, offset)`. Freed chunks are merged
/// with both neighbours right away, so two free chunks are never adjacent.
struct Pool<P: LifetimePlatform> {
	backing: MemoryAllocation<P>,
	/// the key this pool is bucketed under, the size of its largest free chunk
	chunk_size: u64,
	chunks: BTreeMap<u64, Chunk>,
	free: BTreeSet<(u64, u64)>,
}

struct Placement {
	chunk_offset: u64,
	offset: u64,
}

impl<P: LifetimePlatform> Pool<P> {
	fn new(backing: MemoryAllocation<P>) -> Self {
		let size = backing.size();
		Self {
			backing,
			chunk_size: size,
			chunks: BTreeMap::from([(0, Chunk { size, free: true })]),
			free: BTreeSet::from([(size, 0)]),
		}
	}

	#[inline]
	fn size(&self) -> u64 {
		self.backing.size()
	}

	fn largest_free(&self) -> u64 {
		self.free.last().map_or(0, |(size, _)| *size)
	}

	fn is_empty(&self) -> bool {
		self.chunks.len() == 1 && self.free.len() == 1
	}

	/// Take the smallest free chunk that fits `size` at `alignment`. Alignment padding stays part of the allocated
	/// chunk. A remainder below `min_sliver` is handed out with the allocation instead of being split off.
	fn allocate(&mut self, size: u64, alignment: u64, min_sliver: u64) -> Option<Placement> {
		let (chunk_size, chunk_offset, offset) = self.free.range((size, 0)..).find_map(|&(chunk_size, chunk_offset)| {
			let offset = align_up(chunk_offset, alignment);
			(offset - chunk_offset + size <= chunk_size).then_some((chunk_size, chunk_offset, offset))
		})?;
		self.free.remove(&(chunk_size, chunk_offset));

		let used = offset - chunk_offset + size;
		let remainder = chunk_size - used;
		if remainder > 0 && remainder >= min_sliver {
			self.chunks.insert(chunk_offset, Chunk { size: used, free: false });
			self.chunks.insert(chunk_offset + used, Chunk {
				size: remainder,
				free: true,
			});
			self.free.insert((remainder, chunk_offset + used));
		} else if let Some(chunk) = self.chunks.get_mut(&chunk_offset) {
			chunk.free = false;
		}
		Some(Placement { chunk_offset, offset })
	}

	fn free(&mut self, chunk_offset: u64) {
		let chunk = match self.chunks.get(&chunk_offset) {
			Some(chunk) if !chunk.free => *chunk,
			Some(_) => panic!("double free of chunk at {} in {:?}", chunk_offset, self.backing),
			None => panic!("no chunk at {} in {:?}", chunk_offset, self.backing),
		};

		let mut offset = chunk_offset;
		let mut size = chunk.size;
		if let Some((&prev_offset, &prev)) = self.chunks.range(..chunk_offset).next_back() {
			if prev.free && prev_offset + prev.size == chunk_offset {
				self.chunks.remove(&chunk_offset);
				self.free.remove(&(prev.size, prev_offset));
				offset = prev_offset;
				size += prev.size;
			}
		}
		let next_offset = chunk_offset + chunk.size;
		if let Some(&next) = self.chunks.get(&next_offset) {
			if next.free {
				self.chunks.remove(&next_offset);
				self.free.remove(&(next.size, next_offset));
				size += next.size;
			}
		}
		self.chunks.insert(offset, Chunk { size, free: true });
		self.free.insert((size, offset));
	}

	/// Panics if the chunk bookkeeping is corrupted.
	fn validate(&self) {
		let mut covered = RangeSet::new();
		let mut total = 0;
		let mut previous_free = false;
		let mut free_chunks = 0;
		for (&offset, chunk) in &self.chunks {
			let range = offset..offset + chunk.size;
			assert!(chunk.size > 0, "empty chunk at {}", offset);
			assert!(!covered.overlaps(&range), "chunk {:?} overlaps another chunk", range);
			covered.insert(range);
			total += chunk.size;
			if chunk.free {
				assert!(!previous_free, "adjacent free chunks at {}", offset);
				assert!(
					self.free.contains(&(chunk.size, offset)),
					"free chunk at {} is not indexed",
					offset
				);
				free_chunks += 1;
			}
			previous_free = chunk.free;
		}
		assert_eq!(total, self.size(), "chunk sizes do not add up to the pool size");
		assert_eq!(
			covered.iter().collect::<Vec<_>>(),
			[&(0..self.size())],
			"chunks do not tile the pool"
		);
		assert_eq!(free_chunks, self.free.len(), "free index lists chunks that are not free");
		assert_eq!(self.chunk_size, self.largest_free(), "pool is bucketed under a stale chunk size");
	}
}

/// The pools of one memory type, bucketed by the size of their largest free chunk.
struct Heap<P: LifetimePlatform> {
	pools: Arena<Pool<P>>,
	buckets: BTreeSet<(u64, ArenaId)>,
}

impl<P: LifetimePlatform> Heap<P> {
	fn rebucket(&mut self, id: ArenaId) {
		if let Some(pool) = self.pools.get_mut(id) {
			let chunk_size = pool.largest_free();
			if chunk_size != pool.chunk_size {
				self.buckets.remove(&(pool.chunk_size, id));
				self.buckets.insert((chunk_size, id));
				pool.chunk_size = chunk_size;
			}
		}
	}
}

/// Sub-allocates chunks out of `pool_size` backing allocations, obtained from a [`DirectAllocator`].
pub struct PoolAllocator<P: LifetimePlatform> {
	direct: DirectAllocator<P>,
	pool_size: u64,
	min_sliver: u64,
	heaps: Box<[Mutex<Heap<P>>]>,
}

impl<P: LifetimePlatform> PoolAllocator<P> {
	pub fn new(device: Arc<Device<P>>, pool_size: u64) -> Self {
		let properties = device.memory_properties();
		let min_sliver = properties.min_memory_map_alignment;
		let heaps = (0..properties.memory_types.len())
			.map(|_| {
				Mutex::new(Heap {
					pools: Arena::new(),
					buckets: BTreeSet::new(),
				})
			})
			.collect();
		Self {
			direct: DirectAllocator::new(device),
			pool_size,
			min_sliver,
			heaps,
		}
	}

	#[inline]
	pub fn pool_size(&self) -> u64 {
		self.pool_size
	}

	#[inline]
	pub fn direct(&self) -> &DirectAllocator<P> {
		&self.direct
	}

	pub fn allocate(&self, request: &AllocationRequest) -> Result<MemoryAllocation<P>, AllocationError<P>> {
		let size = request.aligned_size();
		if size > self.pool_size {
			return Err(AllocationError::ExceedsPoolSize {
				size,
				pool_size: self.pool_size,
			});
		}
		let memory_type_index = find_memory_type(self.direct.device(), request)?;
		let alignment = request.alignment.max(1);

		let mut heap = self.heaps[memory_type_index as usize].lock();
		let heap = &mut *heap;
		let mut found = None;
		for &(_, id) in heap.buckets.range((size, ArenaId::default())..) {
			if let Some(pool) = heap.pools.get_mut(id) {
				if let Some(placement) = pool.allocate(size, alignment, self.min_sliver) {
					found = Some((id, placement));
					break;
				}
			}
		}

		let (id, placement) = match found {
			Some(found) => found,
			None => {
				let backing = self.direct.allocate_in(memory_type_index, self.pool_size)?;
				let mut pool = Pool::new(backing);
				let placement = pool
					.allocate(size, alignment, self.min_sliver)
					.expect("a fresh pool must fit any request up to the pool size");
				let id = heap.pools.insert(pool);
				heap.buckets.insert((self.pool_size, id));
				debug!(memory_type_index, pool = ?id, size = self.pool_size, "created pool");
				(id, placement)
			}
		};
		heap.rebucket(id);

		let pool = heap
			.pools
			.get(id)
			.expect("pool was just allocated from");
		let mapped = pool
			.backing
			.mapped_ptr()
			.map(|ptr| unsafe { NonNull::new_unchecked(ptr.as_ptr().add(placement.offset as usize)) });
		trace!(memory_type_index, pool = ?id, offset = placement.offset, size, "pool allocation");
		Ok(MemoryAllocation {
			memory: pool.backing.memory(),
			mapped,
			offset: placement.offset,
			size,
			property_flags: pool.backing.property_flags(),
			memory_type_index,
			owner: AllocationOwner::Pool {
				pool: PoolId { memory_type_index, id },
				chunk_offset: placement.chunk_offset,
			},
		})
	}

	/// Return an allocation to its pool. A pool left without any allocation is released to the direct allocator.
	pub fn free(&self, allocation: MemoryAllocation<P>) {
		let AllocationOwner::Pool { pool: pool_id, chunk_offset } = allocation.owner() else {
			self.direct.free(allocation);
			return;
		};

		let mut heap = self.heaps[pool_id.memory_type_index as usize].lock();
		let Some(pool) = heap.pools.get_mut(pool_id.id) else {
			panic!("{:?} freed into unknown {:?}", allocation, pool_id);
		};
		pool.free(chunk_offset);
		trace!(pool = ?pool_id, chunk_offset, size = allocation.size(), "pool free");

		if pool.is_empty() {
			let chunk_size = pool.chunk_size;
			heap.buckets.remove(&(chunk_size, pool_id.id));
			if let Some(pool) = heap.pools.remove(pool_id.id) {
				self.direct.free(pool.backing);
				debug!(pool = ?pool_id, "released empty pool");
			}
		} else {
			heap.rebucket(pool_id.id);
		}
	}

	/// Release every pool, whether or not it still has allocations. Only sound once nothing uses these allocations.
	pub(crate) fn release_all(&self) -> usize {
		let mut released = 0;
		for heap in self.heaps.iter() {
			let mut heap = heap.lock();
			heap.buckets.clear();
			for pool in heap.pools.drain() {
				self.direct.free(pool.backing);
				released += 1;
			}
		}
		released
	}

	/// Panics if any pool's chunk bookkeeping is corrupted.
	pub fn validate(&self) {
		for heap in self.heaps.iter() {
			let heap = heap.lock();
			for (id, pool) in heap.pools.iter() {
				pool.validate();
				assert!(
					heap.buckets.contains(&(pool.chunk_size, id)),
					"pool {:?} is missing from its bucket",
					id
				);
			}
			assert_eq!(heap.buckets.len(), heap.pools.len(), "bucket index lists dead pools");
		}
	}

	pub fn stats(&self) -> PoolStats {
		let mut stats = PoolStats::default();
		for heap in self.heaps.iter() {
			let heap = heap.lock();
			for (_, pool) in heap.pools.iter() {
				stats.pools += 1;
				stats.chunks += pool.chunks.len();
				stats.free_chunks += pool.free.len();
				stats.free_bytes += pool.free.iter().map(|(size, _)| size).sum::<u64>();
				stats.backing_bytes += pool.size();
			}
		}
		stats
	}

	/// The `(offset, chunk)` layout of every pool of a memory type.
	pub fn pool_layouts(&self, memory_type_index: u32) -> Vec<Vec<(u64, Chunk)>> {
		self.heaps
			.get(memory_type_index as usize)
			.map(|heap| {
				heap.lock()
					.pools
					.iter()
					.map(|(_, pool)| pool.chunks.iter().map(|(&offset, &chunk)| (offset, chunk)).collect())
					.collect()
			})
			.unwrap_or_default()
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::platform::headless::{Headless, HeadlessCreateInfo};
	use crate::platform::{LifetimePlatform, MemoryPropertyFlags};

	const DEVICE: u32 = HeadlessCreateInfo::MEMORY_TYPE_DEVICE;

	fn pool_allocator(pool_size: u64) -> anyhow::Result<PoolAllocator<Headless>> {
		crate::init_test_logging();
		let platform = unsafe { Headless::create_platform(HeadlessCreateInfo::default())? };
		Ok(PoolAllocator::new(Device::new(platform, 0), pool_size))
	}

	fn request(size: u64, alignment: u64) -> AllocationRequest {
		AllocationRequest::new(size, alignment, MemoryPropertyFlags::DEVICE_LOCAL)
	}

	fn free(size: u64) -> Chunk {
		Chunk { size, free: true }
	}

	fn used(size: u64) -> Chunk {
		Chunk { size, free: false }
	}

	#[test]
	fn three_fit_fourth_spills() -> anyhow::Result<()> {
		let allocator = pool_allocator(1024)?;
		let allocations = (0..3)
			.map(|_| allocator.allocate(&request(300, 16)))
			.collect::<Result<Vec<_>, _>>()?;
		assert_eq!(allocator.stats().pools, 1);
		assert_eq!(
			allocations.iter().map(|a| (a.offset(), a.size())).collect::<Vec<_>>(),
			[(0, 304), (304, 304), (608, 304)]
		);
		assert!(allocations.iter().all(|a| a.memory() == allocations[0].memory()));

		let fourth = allocator.allocate(&request(300, 16))?;
		assert_eq!(allocator.stats().pools, 2);
		assert_ne!(fourth.memory(), allocations[0].memory());
		allocator.validate();

		for allocation in allocations.into_iter().chain([fourth]) {
			allocator.free(allocation);
			allocator.validate();
		}
		assert_eq!(allocator.stats(), PoolStats::default());
		assert_eq!(allocator.direct().live_allocations(), 0);
		Ok(())
	}

	#[test]
	fn allocate_free_restores_layout() -> anyhow::Result<()> {
		let allocator = pool_allocator(1024)?;
		let _a = allocator.allocate(&request(100, 16))?;
		let b = allocator.allocate(&request(200, 16))?;
		let _c = allocator.allocate(&request(50, 16))?;
		allocator.free(b);
		let before = allocator.pool_layouts(DEVICE);

		let d = allocator.allocate(&request(120, 64))?;
		assert_ne!(allocator.pool_layouts(DEVICE), before);
		allocator.free(d);
		assert_eq!(allocator.pool_layouts(DEVICE), before);
		allocator.validate();
		Ok(())
	}

	#[test]
	fn small_remainder_is_handed_out_whole() -> anyhow::Result<()> {
		let allocator = pool_allocator(1024)?;
		let a = allocator.allocate(&request(1000, 8))?;
		assert_eq!(a.size(), 1000);
		assert_eq!(allocator.pool_layouts(DEVICE), [vec![(0, used(1024))]]);
		allocator.validate();

		allocator.free(a);
		assert_eq!(allocator.stats().pools, 0);
		Ok(())
	}

	#[test]
	fn alignment_padding_stays_in_chunk() -> anyhow::Result<()> {
		let allocator = pool_allocator(1024)?;
		let _a = allocator.allocate(&request(100, 4))?;
		let b = allocator.allocate(&request(128, 128))?;
		assert_eq!(b.offset(), 128);
		assert_eq!(
			allocator.pool_layouts(DEVICE),
			[vec![(0, used(100)), (100, used(156)), (256, free(768))]]
		);
		allocator.validate();
		Ok(())
	}

	#[test]
	fn free_merges_both_neighbours() -> anyhow::Result<()> {
		let allocator = pool_allocator(1024)?;
		let a = allocator.allocate(&request(256, 16))?;
		let b = allocator.allocate(&request(256, 16))?;
		let c = allocator.allocate(&request(256, 16))?;

		allocator.free(a);
		allocator.free(c);
		assert_eq!(
			allocator.pool_layouts(DEVICE),
			[vec![(0, free(256)), (256, used(256)), (512, free(512))]]
		);
		allocator.validate();

		allocator.free(b);
		assert_eq!(allocator.stats().pools, 0);
		Ok(())
	}

	#[test]
	fn bucket_lookup_skips_full_pools() -> anyhow::Result<()> {
		let allocator = pool_allocator(1024)?;
		let big = allocator.allocate(&request(900, 16))?;
		let small = allocator.allocate(&request(400, 16))?;
		assert_ne!(big.memory(), small.memory());
		let tiny = allocator.allocate(&request(100, 16))?;
		assert_eq!(tiny.memory(), big.memory());
		allocator.validate();
		Ok(())
	}

	#[test]
	fn exceeds_pool_size() -> anyhow::Result<()> {
		let allocator = pool_allocator(1024)?;
		assert!(matches!(
			allocator.allocate(&request(1025, 1)),
			Err(AllocationError::ExceedsPoolSize {
				size: 1025,
				pool_size: 1024
			})
		));
		let whole = allocator.allocate(&request(1024, 1))?;
		assert_eq!(allocator.pool_layouts(DEVICE), [vec![(0, used(1024))]]);
		allocator.free(whole);
		Ok(())
	}

	#[test]
	fn random_interleaving_keeps_invariants() -> anyhow::Result<()> {
		let allocator = pool_allocator(4096)?;
		let mut live = Vec::new();
		let mut seed = 0x9e37_79b9_u32;
		for _ in 0..2000 {
			seed ^= seed << 13;
			seed ^= seed >> 17;
			seed ^= seed << 5;
			if seed % 3 != 0 || live.is_empty() {
				let size = 16 + u64::from(seed >> 8) % 700;
				let alignment = 1 << (seed % 8);
				live.push(allocator.allocate(&request(size, alignment))?);
			} else {
				let index = (seed >> 4) as usize % live.len();
				allocator.free(live.swap_remove(index));
			}
			allocator.validate();
		}

		for allocation in live.drain(..) {
			allocator.free(allocation);
		}
		allocator.validate();
		assert_eq!(allocator.stats().pools, 0);
		Ok(())
	}
}
