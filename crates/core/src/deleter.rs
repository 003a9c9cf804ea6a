use crate::context::Device;
use crate::memory::{MemoryAllocation, MemoryAllocator};
use crate::platform::LifetimePlatform;
use crate::resource::Resource;
use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use std::fmt::{Debug, Formatter};
use std::mem;
use std::sync::Arc;
use tracing::debug;

/// What has to be destroyed once a [`Resource`] is no longer captured.
pub enum PendingDeletion<P: LifetimePlatform> {
	Memory(MemoryAllocation<P>),
	DescriptorPool(P::DescriptorPool),
	QueryPool(P::QueryPool),
	Semaphore(P::Semaphore),
	Custom(Box<dyn FnOnce(&P) + Send>),
}

impl<P: LifetimePlatform> PendingDeletion<P> {
	fn kind(&self) -> &'static str {
		match self {
			PendingDeletion::Memory(_) => "memory",
			PendingDeletion::DescriptorPool(_) => "descriptor pool",
			PendingDeletion::QueryPool(_) => "query pool",
			PendingDeletion::Semaphore(_) => "semaphore",
			PendingDeletion::Custom(_) => "custom",
		}
	}

	fn execute(self, device: &Device<P>, allocator: &MemoryAllocator<P>) {
		match self {
			PendingDeletion::Memory(allocation) => allocator.free(allocation),
			PendingDeletion::DescriptorPool(pool) => unsafe { device.destroy_descriptor_pool(pool) },
			PendingDeletion::QueryPool(pool) => unsafe { device.destroy_query_pool(pool) },
			PendingDeletion::Semaphore(semaphore) => unsafe { device.destroy_semaphore(semaphore) },
			PendingDeletion::Custom(f) => f(&device.platform),
		}
	}
}

impl<P: LifetimePlatform> Debug for PendingDeletion<P> {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			PendingDeletion::Memory(allocation) => f.debug_tuple("Memory").field(allocation).finish(),
			PendingDeletion::DescriptorPool(pool) => f.debug_tuple("DescriptorPool").field(pool).finish(),
			PendingDeletion::QueryPool(pool) => f.debug_tuple("QueryPool").field(pool).finish(),
			PendingDeletion::Semaphore(semaphore) => f.debug_tuple("Semaphore").field(semaphore).finish(),
			PendingDeletion::Custom(_) => f.write_str("Custom"),
		}
	}
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DeletionOutcome {
	Executed,
	Deferred,
}

/// Blocks until the command buffers capturing a resource have completed.
pub trait ReleaseWaiter {
	/// Wait for and retire every submitted command buffer capturing `resource`. Returns whether the resource is no
	/// longer captured, which fails if a capturing command buffer has not been submitted yet.
	fn wait_for_release(&self, resource: &Resource) -> bool;
}

struct PendingEntry<P: LifetimePlatform> {
	resource: Resource,
	deletion: PendingDeletion<P>,
	force_wait: bool,
}

/// Deferred destruction: a deletion is only executed once its [`Resource`] is not captured by any command buffer.
///
/// New deletions go onto a lock-free queue and may be added from any thread, [`Self::update`] is driven from the
/// frame tick.
pub struct ResourceDeleter<P: LifetimePlatform> {
	device: Arc<Device<P>>,
	allocator: Arc<MemoryAllocator<P>>,
	incoming: SegQueue<PendingEntry<P>>,
	delayed: Mutex<Vec<PendingEntry<P>>>,
}

impl<P: LifetimePlatform> ResourceDeleter<P> {
	pub fn new(device: Arc<Device<P>>, allocator: Arc<MemoryAllocator<P>>) -> Self {
		Self {
			device,
			allocator,
			incoming: SegQueue::new(),
			delayed: Mutex::new(Vec::new()),
		}
	}

	/// Execute `deletion` right away if `resource` is not captured, otherwise defer it. With `force_wait` the
	/// command buffers capturing `resource` are waited upon instead.
	pub fn add_resource_to_delete(
		&self,
		resource: Resource,
		deletion: PendingDeletion<P>,
		force_wait: bool,
		waiter: &(impl ReleaseWaiter + ?Sized),
	) -> DeletionOutcome {
		if !resource.is_captured() || (force_wait && waiter.wait_for_release(&resource)) {
			self.execute(PendingEntry {
				resource,
				deletion,
				force_wait,
			});
			DeletionOutcome::Executed
		} else {
			debug!(resource = %resource.name(), kind = deletion.kind(), "deferred deletion");
			self.incoming.push(PendingEntry {
				resource,
				deletion,
				force_wait,
			});
			DeletionOutcome::Deferred
		}
	}

	/// Execute every deferred deletion whose resource is no longer captured. With `wait`, the capturing command
	/// buffers of every pending resource are waited upon first. Returns the number of executed deletions.
	pub fn update(&self, wait: bool, waiter: &(impl ReleaseWaiter + ?Sized)) -> usize {
		profiling::function_scope!();
		let mut delayed = self.delayed.lock();
		while let Some(entry) = self.incoming.pop() {
			delayed.push(entry);
		}

		let mut executed = 0;
		for entry in mem::take(&mut *delayed) {
			let released = !entry.resource.is_captured()
				|| ((wait || entry.force_wait) && waiter.wait_for_release(&entry.resource));
			if released {
				self.execute(entry);
				executed += 1;
			} else {
				delayed.push(entry);
			}
		}
		executed
	}

	/// Execute every pending deletion, captured or not. Only for shutdown, after the device went idle.
	pub(crate) fn drain_all(&self) -> usize {
		let mut delayed = mem::take(&mut *self.delayed.lock());
		while let Some(entry) = self.incoming.pop() {
			delayed.push(entry);
		}
		let count = delayed.len();
		for entry in delayed {
			self.execute(entry);
		}
		count
	}

	pub fn pending(&self) -> usize {
		self.incoming.len() + self.delayed.lock().len()
	}

	fn execute(&self, entry: PendingEntry<P>) {
		debug!(resource = %entry.resource.name(), kind = entry.deletion.kind(), "executing deletion");
		entry.deletion.execute(&self.device, &self.allocator);
	}
}
