#![cfg(test)]

use crate::{ash_context, headless_context};
use rust_gpu_lifetime_core::context::{GpuContext, LifetimeConfig};
use rust_gpu_lifetime_core::memory::{AllocationOwner, AllocationRequest, AllocatorStrategy, PoolAllocator};
use rust_gpu_lifetime_core::platform::{LifetimePlatform, MemoryPropertyFlags};

fn config(pool_size: u64) -> LifetimeConfig {
	LifetimeConfig {
		allocator: AllocatorStrategy::Pool { pool_size },
		..LifetimeConfig::default()
	}
}

fn pool<P: LifetimePlatform>(ctx: &GpuContext<P>) -> anyhow::Result<&PoolAllocator<P>> {
	ctx.allocator()
		.as_pool()
		.ok_or_else(|| anyhow::anyhow!("context was not configured with the pool strategy"))
}

#[test]
fn test_pool_spill_headless() -> anyhow::Result<()> {
	test_pool_spill(&headless_context(&config(1024))?)
}

#[test]
#[ignore = "requires a vulkan device"]
fn test_pool_spill_ash() -> anyhow::Result<()> {
	test_pool_spill(&ash_context(&config(1024))?)
}

/// Three 300 byte allocations share a 1024 byte pool, a fourth spills into a second pool. Freeing everything
/// releases both pools.
fn test_pool_spill<P: LifetimePlatform>(ctx: &GpuContext<P>) -> anyhow::Result<()> {
	let request = AllocationRequest::new(300, 16, MemoryPropertyFlags::DEVICE_LOCAL);
	let mut allocations = Vec::new();
	for _ in 0..3 {
		allocations.push(ctx.allocate(&request)?);
	}
	assert_eq!(pool(ctx)?.stats().pools, 1);

	let mut ranges = allocations
		.iter()
		.map(|a| (a.offset(), a.offset() + a.size()))
		.collect::<Vec<_>>();
	ranges.sort();
	for pair in ranges.windows(2) {
		assert!(pair[0].1 <= pair[1].0, "allocations {:?} overlap", pair);
	}
	assert!(allocations.iter().all(|a| a.offset() % 16 == 0));
	assert!(allocations
		.iter()
		.all(|a| matches!(a.owner(), AllocationOwner::Pool { .. })));

	allocations.push(ctx.allocate(&request)?);
	assert_eq!(pool(ctx)?.stats().pools, 2);
	assert_eq!(ctx.allocator().direct().live_allocations(), 2);
	pool(ctx)?.validate();

	for allocation in allocations {
		ctx.free(allocation);
		pool(ctx)?.validate();
	}
	assert_eq!(pool(ctx)?.stats().pools, 0);
	assert_eq!(ctx.allocator().direct().live_allocations(), 0);
	Ok(())
}

#[test]
fn test_interleaved_free_coalesces_headless() -> anyhow::Result<()> {
	test_interleaved_free_coalesces(&headless_context(&config(4096))?)
}

#[test]
#[ignore = "requires a vulkan device"]
fn test_interleaved_free_coalesces_ash() -> anyhow::Result<()> {
	test_interleaved_free_coalesces(&ash_context(&config(4096))?)
}

/// Freed neighbours merge back, so a request the size of three freed slots fits into their place.
fn test_interleaved_free_coalesces<P: LifetimePlatform>(ctx: &GpuContext<P>) -> anyhow::Result<()> {
	let request = AllocationRequest::new(512, 256, MemoryPropertyFlags::DEVICE_LOCAL);
	let mut allocations = (0..8).map(|_| ctx.allocate(&request)).collect::<Result<Vec<_>, _>>()?;
	assert_eq!(pool(ctx)?.stats().pools, 1);
	assert_eq!(pool(ctx)?.stats().free_bytes, 0);

	// free slots 1, 3 and 2 in that order, leaving 0 and 4.. allocated
	let third = allocations.remove(3);
	let first = allocations.remove(1);
	let second = allocations.remove(1);
	let hole_start = first.offset();
	ctx.free(first);
	ctx.free(third);
	assert_eq!(pool(ctx)?.stats().free_chunks, 2);
	ctx.free(second);
	let stats = pool(ctx)?.stats();
	assert_eq!(stats.free_chunks, 1);
	assert_eq!(stats.free_bytes, 3 * 512);
	pool(ctx)?.validate();

	let large = ctx.allocate(&AllocationRequest::new(3 * 512, 256, MemoryPropertyFlags::DEVICE_LOCAL))?;
	assert_eq!(large.offset(), hole_start);
	assert_eq!(pool(ctx)?.stats().pools, 1);

	ctx.free(large);
	for allocation in allocations {
		ctx.free(allocation);
	}
	assert_eq!(pool(ctx)?.stats().pools, 0);
	Ok(())
}

#[test]
fn test_bypass_headless() -> anyhow::Result<()> {
	test_bypass(&headless_context(&config(1024))?)
}

#[test]
#[ignore = "requires a vulkan device"]
fn test_bypass_ash() -> anyhow::Result<()> {
	test_bypass(&ash_context(&config(1024))?)
}

/// Requests of at least the pool size and dedicated requests never create a pool.
fn test_bypass<P: LifetimePlatform>(ctx: &GpuContext<P>) -> anyhow::Result<()> {
	let oversize = ctx.allocate(&AllocationRequest::new(4096, 16, MemoryPropertyFlags::DEVICE_LOCAL))?;
	assert_eq!(oversize.owner(), AllocationOwner::Direct);
	assert_eq!(oversize.offset(), 0);

	let dedicated = ctx.allocate(&AllocationRequest {
		dedicated: true,
		..AllocationRequest::new(64, 16, MemoryPropertyFlags::DEVICE_LOCAL)
	})?;
	assert_eq!(dedicated.owner(), AllocationOwner::Direct);
	assert_eq!(pool(ctx)?.stats().pools, 0);
	assert_eq!(ctx.allocator().direct().live_allocations(), 2);

	ctx.free(oversize);
	ctx.free(dedicated);
	assert_eq!(ctx.allocator().direct().live_allocations(), 0);
	Ok(())
}
