use rust_gpu_lifetime_core::context::{GpuContext, LifetimeConfig};
use rust_gpu_lifetime_core::platform::ash::{
	ash_init_single_graphics_queue, Ash, AshSingleGraphicsQueueCreateInfo, Debuggers,
};
use rust_gpu_lifetime_core::platform::headless::{Headless, HeadlessCreateInfo};
use tracing_subscriber::EnvFilter;

pub mod deferred_deletion;
pub mod frame_pipelining;
pub mod pool_allocator;
pub mod rotation;

/// the global setting on which debugger to use for integration tests
pub fn debugger() -> Debuggers {
	Debuggers::Validation
}

/// Install a `RUST_LOG` filtered subscriber, repeated calls are ignored.
pub fn init_logging() {
	let _ = tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::from_default_env())
		.with_test_writer()
		.try_init();
}

pub fn headless_context(config: &LifetimeConfig) -> anyhow::Result<GpuContext<Headless>> {
	init_logging();
	Ok(unsafe { GpuContext::new(HeadlessCreateInfo::default(), config)? })
}

pub fn ash_context(config: &LifetimeConfig) -> anyhow::Result<GpuContext<Ash>> {
	init_logging();
	let create_info = ash_init_single_graphics_queue(AshSingleGraphicsQueueCreateInfo {
		debug: debugger(),
		..AshSingleGraphicsQueueCreateInfo::default()
	})?;
	Ok(unsafe { GpuContext::new(create_info, config)? })
}
