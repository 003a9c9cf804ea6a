#![cfg(test)]

use crate::{ash_context, headless_context};
use rust_gpu_lifetime_core::command::CommandBufferState;
use rust_gpu_lifetime_core::context::{GpuContext, LifetimeConfig};
use rust_gpu_lifetime_core::platform::{CommandBufferLevel, CommandTarget, LifetimePlatform, PipelineStageFlags};
use rust_gpu_lifetime_core::resource::ResourceStatus;

fn config(swapchain_image_count: u32) -> LifetimeConfig {
	LifetimeConfig {
		swapchain_image_count,
		..LifetimeConfig::default()
	}
}

#[test]
fn test_shared_capture_headless() -> anyhow::Result<()> {
	test_shared_capture(&headless_context(&config(0))?)
}

#[test]
#[ignore = "requires a vulkan device"]
fn test_shared_capture_ash() -> anyhow::Result<()> {
	test_shared_capture(&ash_context(&config(0))?)
}

/// A resource captured by two command buffers in consecutive frames stays captured until both have retired.
fn test_shared_capture<P: LifetimePlatform>(ctx: &GpuContext<P>) -> anyhow::Result<()> {
	let resource = ctx.create_resource("vertex buffer");
	assert_eq!(resource.status(), ResourceStatus::Free);

	let a = ctx.acquire_command_buffer(CommandTarget::Draw, CommandBufferLevel::Primary)?;
	ctx.begin_command_buffer(&a)?;
	ctx.capture(&a, &resource, 0)?;
	ctx.end_command_buffer(&a)?;
	ctx.submit(&a, &[])?;
	assert_eq!(a.captured_frame(), 1);
	ctx.tick()?;

	let b = ctx.acquire_command_buffer(CommandTarget::Draw, CommandBufferLevel::Primary)?;
	ctx.begin_command_buffer(&b)?;
	ctx.capture(&b, &resource, 0)?;
	ctx.end_command_buffer(&b)?;
	ctx.submit(&b, &[])?;
	assert_eq!(b.captured_frame(), 2);
	assert_eq!(resource.ref_count(), 2);

	assert!(ctx.wait_complete(&a, 0)?);
	ctx.tick()?;
	assert_eq!(a.state(), CommandBufferState::Ready);
	assert_eq!(resource.status(), ResourceStatus::Captured);
	assert_eq!(resource.ref_count(), 1);

	assert!(ctx.wait_complete(&b, 0)?);
	ctx.tick()?;
	assert_eq!(b.state(), CommandBufferState::Ready);
	assert_eq!(resource.status(), ResourceStatus::Done);
	assert_eq!(resource.ref_count(), 0);
	Ok(())
}

#[test]
fn test_swapchain_window_headless() -> anyhow::Result<()> {
	test_swapchain_window(&headless_context(&config(3))?)
}

#[test]
#[ignore = "requires a vulkan device"]
fn test_swapchain_window_ash() -> anyhow::Result<()> {
	test_swapchain_window(&ash_context(&config(3))?)
}

/// Completed GPU work still holds its resources until the frame-pipelining window has passed.
fn test_swapchain_window<P: LifetimePlatform>(ctx: &GpuContext<P>) -> anyhow::Result<()> {
	let resource = ctx.create_resource("uniforms");
	let cmd = ctx.acquire_command_buffer(CommandTarget::Upload, CommandBufferLevel::Primary)?;
	ctx.begin_command_buffer(&cmd)?;
	ctx.capture(&cmd, &resource, 0)?;
	ctx.end_command_buffer(&cmd)?;
	ctx.submit(&cmd, &[])?;
	assert!(ctx.wait_complete(&cmd, 0)?);

	// captured in frame 1 with 3 frames in flight, safe from frame 5 onwards
	for expected in 2..=5 {
		assert!(resource.is_captured(), "released too early in frame {}", ctx.frame());
		assert_eq!(ctx.tick()?, expected);
	}
	ctx.tick()?;
	assert!(!resource.is_captured());
	assert_eq!(ctx.command_manager(CommandTarget::Upload).outstanding_count(), 0);
	Ok(())
}

#[test]
fn test_secondary_forwarding_headless() -> anyhow::Result<()> {
	test_secondary_forwarding(&headless_context(&config(0))?)
}

#[test]
#[ignore = "requires a vulkan device"]
fn test_secondary_forwarding_ash() -> anyhow::Result<()> {
	test_secondary_forwarding(&ash_context(&config(0))?)
}

/// Captures recorded on a secondary command buffer are released with its primary.
fn test_secondary_forwarding<P: LifetimePlatform>(ctx: &GpuContext<P>) -> anyhow::Result<()> {
	let resource = ctx.create_resource("instance data");
	let primary = ctx.acquire_command_buffer(CommandTarget::Draw, CommandBufferLevel::Primary)?;
	ctx.begin_command_buffer(&primary)?;
	let secondary = ctx.acquire_secondary_command_buffer(&primary)?;
	ctx.begin_command_buffer(&secondary)?;
	ctx.capture(&secondary, &resource, 0)?;
	ctx.end_command_buffer(&secondary)?;
	primary.execute_commands(&[secondary.clone()])?;
	ctx.end_command_buffer(&primary)?;
	ctx.submit(&primary, &[])?;
	assert!(resource.is_captured());

	assert!(ctx.wait_complete(&secondary, 0)?);
	ctx.tick()?;
	ctx.tick()?;
	assert!(!resource.is_captured());
	assert_eq!(primary.state(), CommandBufferState::Ready);
	Ok(())
}

#[test]
fn test_semaphore_chain_headless() -> anyhow::Result<()> {
	test_semaphore_chain(&headless_context(&config(0))?)
}

#[test]
#[ignore = "requires a vulkan device"]
fn test_semaphore_chain_ash() -> anyhow::Result<()> {
	test_semaphore_chain(&ash_context(&config(0))?)
}

/// An upload signals a semaphore the draw waits upon, the semaphore returns to the pool once both retired.
fn test_semaphore_chain<P: LifetimePlatform>(ctx: &GpuContext<P>) -> anyhow::Result<()> {
	let semaphore = ctx.semaphores().acquire()?;

	let upload = ctx.acquire_command_buffer(CommandTarget::Upload, CommandBufferLevel::Primary)?;
	ctx.begin_command_buffer(&upload)?;
	ctx.end_command_buffer(&upload)?;
	ctx.submit(&upload, &[&semaphore])?;

	let draw = ctx.acquire_command_buffer(CommandTarget::Draw, CommandBufferLevel::Primary)?;
	ctx.begin_command_buffer(&draw)?;
	draw.add_semaphore(&semaphore, PipelineStageFlags::VERTEX_INPUT)?;
	ctx.end_command_buffer(&draw)?;
	ctx.submit(&draw, &[])?;
	drop(semaphore);
	assert_eq!(ctx.semaphores().used_count(), 1);

	assert!(ctx.wait_complete(&draw, 0)?);
	assert!(ctx.wait_complete(&upload, 0)?);
	ctx.tick()?;
	ctx.tick()?;
	assert_eq!(ctx.semaphores().used_count(), 0);
	assert_eq!(ctx.semaphores().free_count(), 1);
	Ok(())
}
