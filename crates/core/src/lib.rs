//! Lifetime core of a GPU renderer: keeps every GPU-visible resource alive exactly as long as submitted GPU work may
//! still touch it.
//!
//! * [`resource::Resource`]: capture / release reference counting, tied to the command buffers that captured it
//! * [`command`]: command buffer state machine and the managers retiring them on fence completion
//! * [`deleter::ResourceDeleter`]: deferred destruction of objects that are still captured
//! * [`memory`]: direct and pooled device memory allocation with chunk coalescing
//! * [`rotation`]: "current, used, free" pool rotation for descriptor sets, queries and uniform data
//! * [`context::GpuContext`]: the owner of all of the above, driven by [`context::GpuContext::tick`]
//!
//! Backends implement [`platform::LifetimePlatform`]. [`platform::headless::Headless`] runs entirely on the host and
//! the `ash` feature enables the Vulkan backend.

pub mod backing;
pub mod command;
pub mod context;
pub mod deleter;
pub mod memory;
pub mod platform;
pub mod resource;
pub mod rotation;

/// Install a `RUST_LOG` filtered subscriber for unit tests, repeated calls are ignored.
#[cfg(test)]
pub(crate) fn init_test_logging() {
	let _ = tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
		.with_test_writer()
		.try_init();
}
