#![cfg(test)]

use crate::{ash_context, headless_context};
use rust_gpu_lifetime_core::command::CommandBuffer;
use rust_gpu_lifetime_core::context::{GpuContext, LifetimeConfig};
use rust_gpu_lifetime_core::platform::headless::{Headless, HeadlessDescriptorSetLayout};
use rust_gpu_lifetime_core::platform::{
	CommandBufferLevel, CommandTarget, LifetimePlatform, PipelineStageFlags, QueryType,
};
use rust_gpu_lifetime_core::resource::Resource;
use rust_gpu_lifetime_core::rotation::DescriptorPoolStrategy;
use std::sync::Arc;

fn config() -> LifetimeConfig {
	LifetimeConfig {
		swapchain_image_count: 0,
		uniform_pool_size: 512,
		uniform_alignment: 256,
		query_pool_capacity: 4,
		descriptor_max_sets: 2,
		..LifetimeConfig::default()
	}
}

/// Record a primary command buffer, submit it and wait for its completion.
fn submit_and_wait<P: LifetimePlatform>(
	ctx: &GpuContext<P>,
	record: impl FnOnce(&Arc<CommandBuffer<P>>) -> anyhow::Result<()>,
) -> anyhow::Result<()> {
	let cmd = ctx.acquire_command_buffer(CommandTarget::Draw, CommandBufferLevel::Primary)?;
	ctx.begin_command_buffer(&cmd)?;
	record(&cmd)?;
	ctx.end_command_buffer(&cmd)?;
	ctx.submit(&cmd, &[])?;
	assert!(ctx.wait_complete(&cmd, 0)?);
	Ok(())
}

fn capture_all<P: LifetimePlatform>(
	ctx: &GpuContext<P>,
	cmd: &CommandBuffer<P>,
	resources: &[&Resource],
) -> anyhow::Result<()> {
	for resource in resources {
		ctx.capture(cmd, resource, 0)?;
	}
	Ok(())
}

#[test]
fn test_uniform_rotation_headless() -> anyhow::Result<()> {
	test_uniform_rotation(&headless_context(&config())?)
}

#[test]
#[ignore = "requires a vulkan device"]
fn test_uniform_rotation_ash() -> anyhow::Result<()> {
	test_uniform_rotation(&ash_context(&config())?)
}

/// A uniform pool that was read by the GPU is only written again after the reading command buffer retired.
fn test_uniform_rotation<P: LifetimePlatform>(ctx: &GpuContext<P>) -> anyhow::Result<()> {
	let uniforms = ctx.uniforms();
	let first = uniforms.write(&[7u32; 75])?;
	submit_and_wait(ctx, |cmd| capture_all(ctx, cmd, &[first.resource()]))?;

	// does not fit behind the first write, rotates to a second pool
	let second = uniforms.write(&[8u32; 75])?;
	assert_ne!(first.resource(), second.resource());
	assert_eq!(uniforms.pool_count(), 2);

	ctx.tick()?;
	assert_eq!(uniforms.free_pool_count(), 0);
	ctx.tick()?;
	assert_eq!(uniforms.free_pool_count(), 1);

	let third = uniforms.write(&[9u32; 75])?;
	assert_eq!(third.resource(), first.resource());
	assert_eq!(third.offset(), first.offset());
	assert_eq!(uniforms.pool_count(), 2);
	Ok(())
}

#[test]
fn test_uniform_contents_headless() -> anyhow::Result<()> {
	let ctx = headless_context(&config())?;
	let a = ctx.uniforms().write(&[1.0f32, 2.0, 3.0, 4.0])?;
	let b = ctx.uniforms().write(&0xdead_beef_u32)?;
	assert_eq!(b.offset() - a.offset(), 256);

	let read = |memory, offset, len| {
		ctx.platform()
			.read_memory(memory, offset, len)
			.ok_or_else(|| anyhow::anyhow!("read out of bounds"))
	};
	assert_eq!(
		read(a.memory(), a.offset(), 16)?,
		bytemuck::cast_slice::<f32, u8>(&[1.0, 2.0, 3.0, 4.0])
	);
	assert_eq!(read(b.memory(), b.offset(), 4)?, 0xdead_beef_u32.to_ne_bytes());
	Ok(())
}

#[test]
fn test_timestamp_queries_headless() -> anyhow::Result<()> {
	test_timestamp_queries(&headless_context(&config())?)
}

#[test]
#[ignore = "requires a vulkan device"]
fn test_timestamp_queries_ash() -> anyhow::Result<()> {
	test_timestamp_queries(&ash_context(&config())?)
}

/// Query results are fetched once the command buffer writing them has retired, then the pool is reset for reuse.
fn test_timestamp_queries<P: LifetimePlatform>(ctx: &GpuContext<P>) -> anyhow::Result<()> {
	let query = ctx.queries().allocate(QueryType::Timestamp, 2)?;
	submit_and_wait(ctx, |cmd| {
		query.reset(cmd)?;
		query.write_timestamp(cmd, PipelineStageFlags::TOP_OF_PIPE, 0)?;
		query.write_timestamp(cmd, PipelineStageFlags::BOTTOM_OF_PIPE, 1)?;
		Ok(())
	})?;
	assert!(!query.is_ready());

	ctx.tick()?;
	assert!(!query.is_ready());
	ctx.tick()?;
	let values = query
		.results()
		.ok_or_else(|| anyhow::anyhow!("results missing after retirement"))?;
	assert_eq!(values.len(), 2);
	assert!(values[0] <= values[1]);
	assert_eq!(ctx.queries().free_pool_count(QueryType::Timestamp), 1);

	// the recycled pool serves the next batch
	let next = ctx.queries().allocate(QueryType::Timestamp, 4)?;
	assert_eq!(format!("{:?}", next.raw_pool()), format!("{:?}", query.raw_pool()));
	assert_eq!(next.first(), 0);
	assert_eq!(ctx.queries().pool_count(QueryType::Timestamp), 1);
	Ok(())
}

#[test]
fn test_descriptor_rotation_headless() -> anyhow::Result<()> {
	let ctx: GpuContext<Headless> = headless_context(&config())?;
	let layout = HeadlessDescriptorSetLayout::new(1);
	let sets = ctx.descriptor_sets();
	let a = sets.allocate(layout)?;
	let b = sets.allocate(layout)?;
	assert_eq!(a.resource(), b.resource());
	submit_and_wait(&ctx, |cmd| capture_all(&ctx, cmd, &[a.resource()]))?;

	// the first pool holds 2 sets
	let c = sets.allocate(layout)?;
	assert_ne!(c.resource(), a.resource());
	assert_eq!(sets.pool_count(), 2);

	ctx.tick()?;
	ctx.tick()?;
	sets.allocate(layout)?;
	// second pool is full, the reset first pool is reused instead of creating a third
	let e = sets.allocate(layout)?;
	assert_eq!(e.resource(), a.resource());
	assert_eq!(sets.pool_count(), 2);
	assert_eq!(ctx.platform().object_counts().descriptor_pools, 2);
	Ok(())
}

#[test]
fn test_descriptor_per_layout_headless() -> anyhow::Result<()> {
	let ctx: GpuContext<Headless> = headless_context(&LifetimeConfig {
		descriptor_pool_strategy: DescriptorPoolStrategy::PerLayout,
		..config()
	})?;
	let a = ctx.descriptor_sets().allocate(HeadlessDescriptorSetLayout::new(1))?;
	let b = ctx.descriptor_sets().allocate(HeadlessDescriptorSetLayout::new(2))?;
	assert_ne!(a.resource(), b.resource());
	assert_eq!(ctx.descriptor_sets().ring_count(), 2);
	Ok(())
}
