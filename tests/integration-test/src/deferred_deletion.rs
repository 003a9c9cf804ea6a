#![cfg(test)]

use crate::{ash_context, headless_context};
use rust_gpu_lifetime_core::context::{GpuContext, LifetimeConfig};
use rust_gpu_lifetime_core::deleter::{DeletionOutcome, PendingDeletion};
use rust_gpu_lifetime_core::memory::{AllocationRequest, AllocatorStrategy};
use rust_gpu_lifetime_core::platform::{CommandBufferLevel, CommandTarget, LifetimePlatform, MemoryPropertyFlags};
use rust_gpu_lifetime_core::resource::Resource;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;

fn config() -> LifetimeConfig {
	LifetimeConfig {
		swapchain_image_count: 0,
		allocator: AllocatorStrategy::Direct,
		..LifetimeConfig::default()
	}
}

fn counting_deletion<P: LifetimePlatform>(counter: &Arc<AtomicUsize>) -> PendingDeletion<P> {
	let counter = counter.clone();
	PendingDeletion::Custom(Box::new(move |_| {
		counter.fetch_add(1, Relaxed);
	}))
}

fn submit_capturing<P: LifetimePlatform>(ctx: &GpuContext<P>, resource: &Resource) -> anyhow::Result<()> {
	let cmd = ctx.acquire_command_buffer(CommandTarget::Transition, CommandBufferLevel::Primary)?;
	ctx.begin_command_buffer(&cmd)?;
	ctx.capture(&cmd, resource, 0)?;
	ctx.end_command_buffer(&cmd)?;
	ctx.submit(&cmd, &[])?;
	Ok(())
}

#[test]
fn test_deferred_until_released_headless() -> anyhow::Result<()> {
	test_deferred_until_released(&headless_context(&config())?)
}

#[test]
#[ignore = "requires a vulkan device"]
fn test_deferred_until_released_ash() -> anyhow::Result<()> {
	test_deferred_until_released(&ash_context(&config())?)
}

fn test_deferred_until_released<P: LifetimePlatform>(ctx: &GpuContext<P>) -> anyhow::Result<()> {
	let deleted = Arc::new(AtomicUsize::new(0));
	let resource = ctx.create_resource("staging buffer");
	submit_capturing(ctx, &resource)?;

	let outcome = ctx.add_resource_to_delete(resource, counting_deletion(&deleted), false);
	assert_eq!(outcome, DeletionOutcome::Deferred);
	assert_eq!(ctx.deleter().pending(), 1);

	// frame 1 is not yet safe
	ctx.tick()?;
	assert_eq!(deleted.load(Relaxed), 0);

	ctx.wait_idle()?;
	assert_eq!(deleted.load(Relaxed), 1);
	assert_eq!(ctx.deleter().pending(), 0);
	Ok(())
}

#[test]
fn test_force_wait_headless() -> anyhow::Result<()> {
	test_force_wait(&headless_context(&config())?)
}

#[test]
#[ignore = "requires a vulkan device"]
fn test_force_wait_ash() -> anyhow::Result<()> {
	test_force_wait(&ash_context(&config())?)
}

/// With `force_wait` the deletion blocks on the capturing command buffer and executes right away.
fn test_force_wait<P: LifetimePlatform>(ctx: &GpuContext<P>) -> anyhow::Result<()> {
	let deleted = Arc::new(AtomicUsize::new(0));
	let resource = ctx.create_resource("render target");
	submit_capturing(ctx, &resource)?;
	let observed = resource.clone();

	let outcome = ctx.add_resource_to_delete(resource, counting_deletion(&deleted), true);
	assert_eq!(outcome, DeletionOutcome::Executed);
	assert_eq!(deleted.load(Relaxed), 1);
	assert!(!observed.is_captured());
	assert_eq!(ctx.deleter().pending(), 0);
	Ok(())
}

#[test]
fn test_force_wait_on_unsubmitted_headless() -> anyhow::Result<()> {
	test_force_wait_on_unsubmitted(&headless_context(&config())?)
}

#[test]
#[ignore = "requires a vulkan device"]
fn test_force_wait_on_unsubmitted_ash() -> anyhow::Result<()> {
	test_force_wait_on_unsubmitted(&ash_context(&config())?)
}

/// A command buffer still recording can not be waited upon, the deletion is deferred until it was submitted.
fn test_force_wait_on_unsubmitted<P: LifetimePlatform>(ctx: &GpuContext<P>) -> anyhow::Result<()> {
	let deleted = Arc::new(AtomicUsize::new(0));
	let resource = ctx.create_resource("mesh");
	let cmd = ctx.acquire_command_buffer(CommandTarget::Draw, CommandBufferLevel::Primary)?;
	ctx.begin_command_buffer(&cmd)?;
	ctx.capture(&cmd, &resource, 0)?;

	let outcome = ctx.add_resource_to_delete(resource, counting_deletion(&deleted), true);
	assert_eq!(outcome, DeletionOutcome::Deferred);
	assert_eq!(deleted.load(Relaxed), 0);

	ctx.end_command_buffer(&cmd)?;
	ctx.submit(&cmd, &[])?;
	// the entry keeps its force_wait, so the next tick waits instead of honoring the frame window
	ctx.tick()?;
	assert_eq!(deleted.load(Relaxed), 1);
	Ok(())
}

#[test]
fn test_memory_freed_after_release_headless() -> anyhow::Result<()> {
	test_memory_freed_after_release(&headless_context(&config())?)
}

#[test]
#[ignore = "requires a vulkan device"]
fn test_memory_freed_after_release_ash() -> anyhow::Result<()> {
	test_memory_freed_after_release(&ash_context(&config())?)
}

fn test_memory_freed_after_release<P: LifetimePlatform>(ctx: &GpuContext<P>) -> anyhow::Result<()> {
	let allocation = ctx.allocate(&AllocationRequest::new(4096, 256, MemoryPropertyFlags::DEVICE_LOCAL))?;
	assert_eq!(ctx.allocator().direct().live_allocations(), 1);
	let resource = ctx.create_resource("index buffer");
	submit_capturing(ctx, &resource)?;

	ctx.add_resource_to_delete(resource, PendingDeletion::Memory(allocation), false);
	ctx.tick()?;
	assert_eq!(ctx.allocator().direct().live_allocations(), 1);

	ctx.wait_idle()?;
	assert_eq!(ctx.allocator().direct().live_allocations(), 0);
	Ok(())
}
