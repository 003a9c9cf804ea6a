use crate::command::CommandBufferError;
use crate::context::Device;
use crate::platform::LifetimePlatform;
use crate::resource::{Resource, ResourceStatus};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use tracing::{debug, error};

/// A semaphore handed out by a [`SemaphoreManager`]. Command buffers waiting on or signaling it capture its
/// [`Resource`], the manager only reuses it once every one of them has retired.
pub struct PooledSemaphore<P: LifetimePlatform> {
	raw: P::Semaphore,
	resource: Resource,
}

impl<P: LifetimePlatform> PooledSemaphore<P> {
	#[inline]
	pub fn raw(&self) -> P::Semaphore {
		self.raw
	}

	#[inline]
	pub fn resource(&self) -> &Resource {
		&self.resource
	}
}

impl<P: LifetimePlatform> Clone for PooledSemaphore<P> {
	fn clone(&self) -> Self {
		Self {
			raw: self.raw,
			resource: self.resource.clone(),
		}
	}
}

impl<P: LifetimePlatform> Debug for PooledSemaphore<P> {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("PooledSemaphore")
			.field("raw", &self.raw)
			.field("resource", &self.resource)
			.finish()
	}
}

pub struct SemaphoreManager<P: LifetimePlatform> {
	device: Arc<Device<P>>,
	inner: Mutex<SemaphoreInner<P>>,
}

struct SemaphoreInner<P: LifetimePlatform> {
	free: Vec<P::Semaphore>,
	used: VecDeque<PooledSemaphore<P>>,
}

impl<P: LifetimePlatform> SemaphoreManager<P> {
	pub fn new(device: Arc<Device<P>>) -> Self {
		Self {
			device,
			inner: Mutex::new(SemaphoreInner {
				free: Vec::new(),
				used: VecDeque::new(),
			}),
		}
	}

	pub fn acquire(&self) -> Result<PooledSemaphore<P>, CommandBufferError<P>> {
		let mut inner = self.inner.lock();
		let raw = match inner.free.pop() {
			Some(raw) => raw,
			None => unsafe { self.device.create_semaphore() }.map_err(|e| {
				error!("failed to create semaphore: {}", e);
				CommandBufferError::Platform(e)
			})?,
		};
		let semaphore = PooledSemaphore {
			raw,
			resource: self.device.resources().create("semaphore"),
		};
		inner.used.push_back(semaphore.clone());
		Ok(semaphore)
	}

	/// Return every semaphore whose capturing command buffers have all retired to the free list. Semaphores that
	/// were never captured stay in use, their holder may still submit them.
	pub fn update(&self) -> usize {
		profiling::function_scope!();
		let mut inner = self.inner.lock();
		let inner = &mut *inner;
		let before = inner.free.len();
		inner.used.retain(|semaphore| {
			if semaphore.resource.status() == ResourceStatus::Done {
				inner.free.push(semaphore.raw);
				false
			} else {
				true
			}
		});
		inner.free.len() - before
	}

	pub fn free_count(&self) -> usize {
		self.inner.lock().free.len()
	}

	pub fn used_count(&self) -> usize {
		self.inner.lock().used.len()
	}
}

impl<P: LifetimePlatform> Drop for SemaphoreManager<P> {
	fn drop(&mut self) {
		let inner = self.inner.get_mut();
		let count = inner.free.len() + inner.used.len();
		for raw in inner.free.drain(..).chain(inner.used.drain(..).map(|s| s.raw)) {
			unsafe { self.device.destroy_semaphore(raw) };
		}
		debug!(count, "destroyed pooled semaphores");
	}
}
