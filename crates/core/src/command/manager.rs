use crate::backing::arena::Arena;
use crate::command::{CommandBuffer, CommandBufferError, CommandBufferId, CommandBufferState, PooledSemaphore};
use crate::context::Device;
use crate::deleter::ReleaseWaiter;
use crate::platform::{CommandBufferLevel, CommandTarget, LifetimePlatform};
use crate::resource::Resource;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Owns a backend command pool, destroying it once every command buffer allocated from it is gone.
pub struct CommandPoolHandle<P: LifetimePlatform> {
	device: Arc<Device<P>>,
	raw: P::CommandPool,
}

impl<P: LifetimePlatform> CommandPoolHandle<P> {
	#[inline]
	pub fn raw(&self) -> P::CommandPool {
		self.raw
	}
}

impl<P: LifetimePlatform> Drop for CommandPoolHandle<P> {
	fn drop(&mut self) {
		unsafe { self.device.destroy_command_pool(self.raw) };
	}
}

/// Allocates, submits and retires the [`CommandBuffer`]s of one [`CommandTarget`].
///
/// Buffers cycle through three places: handed out to the user, the `used` deque after submission and the per-level
/// `free` deque after retirement. Retired buffers are reused instead of freed.
pub struct CommandBufferManager<P: LifetimePlatform> {
	device: Arc<Device<P>>,
	target: CommandTarget,
	pool: Arc<CommandPoolHandle<P>>,
	inner: Mutex<ManagerInner<P>>,
}

struct ManagerInner<P: LifetimePlatform> {
	buffers: Arena<Arc<CommandBuffer<P>>>,
	free: [VecDeque<Arc<CommandBuffer<P>>>; 2],
	used: VecDeque<Arc<CommandBuffer<P>>>,
}

impl<P: LifetimePlatform> ManagerInner<P> {
	fn free_len(&self) -> usize {
		self.free.iter().map(VecDeque::len).sum()
	}

	fn forget(&mut self, buffer: &CommandBuffer<P>) {
		self.buffers.remove(buffer.id().arena_id());
	}

	/// Return command buffers that were handed out and then dropped without being submitted, such as a secondary
	/// that was never executed. Only the registry still references them while the lock is held.
	fn reclaim_abandoned(&mut self) -> Result<usize, CommandBufferError<P>> {
		let abandoned = self
			.buffers
			.iter()
			.filter(|(_, buffer)| Arc::strong_count(*buffer) == 1)
			.map(|(_, buffer)| buffer.clone())
			.collect::<SmallVec<[_; 4]>>();
		let mut reclaimed = 0;
		let mut first_err = None;
		for buffer in abandoned {
			if buffer.state() == CommandBufferState::Invalid {
				self.forget(&buffer);
				continue;
			}
			match buffer.recycle() {
				Ok(()) => {
					debug!(command_buffer = ?buffer.id(), "reclaimed abandoned command buffer");
					self.free[buffer.level().to_usize()].push_back(buffer);
					reclaimed += 1;
				}
				Err(e) => {
					self.forget(&buffer);
					first_err.get_or_insert(e);
				}
			}
		}
		match first_err {
			None => Ok(reclaimed),
			Some(e) => Err(e),
		}
	}
}

impl<P: LifetimePlatform> CommandBufferManager<P> {
	pub fn new(device: Arc<Device<P>>, target: CommandTarget) -> Result<Self, CommandBufferError<P>> {
		let raw = unsafe { device.create_command_pool(target) }.map_err(CommandBufferError::Platform)?;
		let pool = Arc::new(CommandPoolHandle {
			device: device.clone(),
			raw,
		});
		Ok(Self {
			device,
			target,
			pool,
			inner: Mutex::new(ManagerInner {
				buffers: Arena::new(),
				free: [VecDeque::new(), VecDeque::new()],
				used: VecDeque::new(),
			}),
		})
	}

	#[inline]
	pub fn target(&self) -> CommandTarget {
		self.target
	}

	fn usage_error(&self, err: CommandBufferError<P>) -> CommandBufferError<P> {
		error!(target = ?self.target, "{}", err);
		err
	}

	fn check_target(&self, buffer: &CommandBuffer<P>) -> Result<(), CommandBufferError<P>> {
		if buffer.target() == self.target {
			Ok(())
		} else {
			Err(self.usage_error(CommandBufferError::WrongTarget {
				id: buffer.id(),
				target: self.target,
				actual: buffer.target(),
			}))
		}
	}

	/// Get a `Ready` command buffer, reusing a retired one if available.
	pub fn acquire(&self, level: CommandBufferLevel) -> Result<Arc<CommandBuffer<P>>, CommandBufferError<P>> {
		let mut inner = self.inner.lock();
		if let Some(buffer) = inner.free[level.to_usize()].pop_front() {
			return Ok(buffer);
		}

		let raw = unsafe { self.device.allocate_command_buffer(self.pool.raw(), level) }.map_err(|e| {
			error!(target = ?self.target, ?level, "failed to allocate command buffer: {}", e);
			CommandBufferError::Platform(e)
		})?;
		let fence = match level {
			CommandBufferLevel::Primary => match unsafe { self.device.create_fence() } {
				Ok(fence) => Some(fence),
				Err(e) => {
					error!(target = ?self.target, "failed to create fence: {}", e);
					unsafe { self.device.free_command_buffer(self.pool.raw(), raw) };
					return Err(CommandBufferError::Platform(e));
				}
			},
			CommandBufferLevel::Secondary => None,
		};

		let id = CommandBufferId::new(self.target, inner.buffers.vacant_id());
		let buffer = Arc::new(CommandBuffer::new(
			self.device.clone(),
			self.pool.clone(),
			id,
			level,
			raw,
			fence,
		));
		inner.buffers.insert(buffer.clone());
		debug!(command_buffer = ?id, ?level, "allocated command buffer");
		Ok(buffer)
	}

	/// Get a secondary command buffer that forwards all captures and semaphores to `primary`.
	pub fn acquire_secondary(
		&self,
		primary: &Arc<CommandBuffer<P>>,
	) -> Result<Arc<CommandBuffer<P>>, CommandBufferError<P>> {
		if primary.level() != CommandBufferLevel::Primary {
			return Err(self.usage_error(CommandBufferError::WrongLevel {
				id: primary.id(),
				level: primary.level(),
				expected: CommandBufferLevel::Primary,
			}));
		}
		self.check_target(primary)?;
		let secondary = self.acquire(CommandBufferLevel::Secondary)?;
		secondary.set_primary(primary);
		Ok(secondary)
	}

	/// Submit a primary command buffer, signaling `signal_semaphores` on completion.
	pub fn submit(
		&self,
		buffer: &Arc<CommandBuffer<P>>,
		signal_semaphores: &[&PooledSemaphore<P>],
	) -> Result<(), CommandBufferError<P>> {
		profiling::function_scope!();
		self.check_target(buffer)?;
		match buffer.submit(signal_semaphores) {
			Ok(secondaries) => {
				let mut inner = self.inner.lock();
				inner.used.push_back(buffer.clone());
				inner.used.extend(secondaries);
				Ok(())
			}
			Err(e) => {
				if buffer.state() == CommandBufferState::Invalid {
					self.inner.lock().forget(buffer);
				}
				Err(e)
			}
		}
	}

	/// Retire every submitted command buffer whose fence has signaled and whose frame is safe, returning them to
	/// the free deques. Invalid command buffers are freed. Returns the number of retired command buffers.
	///
	/// Every buffer is processed even if some fail, the first error is returned.
	pub fn update(&self) -> Result<usize, CommandBufferError<P>> {
		profiling::function_scope!();
		let mut inner = self.inner.lock();
		let mut first_err = None;
		for buffer in inner
			.used
			.iter()
			.filter(|b| b.level() == CommandBufferLevel::Primary)
		{
			if let Err(e) = buffer.refresh_fence_status() {
				first_err.get_or_insert(e);
			}
		}

		let mut retired = 0;
		for buffer in mem::take(&mut inner.used) {
			match buffer.state() {
				CommandBufferState::Finished => match buffer.recycle() {
					Ok(()) => {
						inner.free[buffer.level().to_usize()].push_back(buffer);
						retired += 1;
					}
					Err(e) => {
						inner.forget(&buffer);
						first_err.get_or_insert(e);
					}
				},
				CommandBufferState::Invalid => inner.forget(&buffer),
				_ => inner.used.push_back(buffer),
			}
		}
		if let Err(e) = inner.reclaim_abandoned() {
			first_err.get_or_insert(e);
		}
		match first_err {
			None => Ok(retired),
			Some(e) => Err(e),
		}
	}

	/// Block until every submitted primary has completed, see [`CommandBuffer::wait_complete`]. Returns false if any
	/// wait timed out.
	pub fn wait_complete_all(&self, timeout_ns: u64) -> Result<bool, CommandBufferError<P>> {
		profiling::function_scope!();
		let submitted = self
			.inner
			.lock()
			.used
			.iter()
			.filter(|b| b.level() == CommandBufferLevel::Primary)
			.cloned()
			.collect::<SmallVec<[_; 8]>>();
		let mut complete = true;
		for buffer in submitted {
			if let CommandBufferState::Submitted { .. } = buffer.state() {
				complete &= buffer.wait_complete(timeout_ns)?;
			}
		}
		Ok(complete)
	}

	/// Reset the backend command pool. Only allowed once every command buffer has been returned to the free deques,
	/// command buffers dropped without submission are returned first.
	pub fn reset_pools(&self) -> Result<(), CommandBufferError<P>> {
		let mut inner = self.inner.lock();
		inner.reclaim_abandoned()?;
		let count = inner.buffers.len() - inner.free_len();
		if count > 0 {
			return Err(self.usage_error(CommandBufferError::Outstanding {
				target: self.target,
				count,
			}));
		}
		unsafe { self.device.reset_command_pool(self.pool.raw()) }.map_err(|e| {
			error!(target = ?self.target, "failed to reset command pool: {}", e);
			CommandBufferError::Platform(e)
		})?;
		debug!(target = ?self.target, buffers = inner.buffers.len(), "reset command pool");
		Ok(())
	}

	/// Return a command buffer that will not be submitted, dropping everything it captured. A primary discarded
	/// this way does not discard the secondaries attached to it.
	pub fn discard(&self, buffer: &Arc<CommandBuffer<P>>) -> Result<(), CommandBufferError<P>> {
		self.check_target(buffer)?;
		let result = buffer.recycle();
		let mut inner = self.inner.lock();
		match result {
			Ok(()) => {
				let free = &mut inner.free[buffer.level().to_usize()];
				if !free.iter().any(|b| Arc::ptr_eq(b, buffer)) {
					free.push_back(buffer.clone());
				}
				Ok(())
			}
			Err(e) => {
				if buffer.state() == CommandBufferState::Invalid {
					inner.forget(buffer);
				}
				Err(e)
			}
		}
	}

	/// Block until the command buffer `id`, or the primary it was executed in, has completed and retire it without
	/// regard to the frame-pipelining window. Returns false if it has not been submitted.
	pub(crate) fn wait_and_retire(&self, id: CommandBufferId) -> Result<bool, CommandBufferError<P>> {
		let Some(buffer) = self.command_buffer(id) else {
			return Ok(false);
		};
		let primary = match buffer.level() {
			CommandBufferLevel::Primary => buffer,
			CommandBufferLevel::Secondary => match buffer.primary() {
				Some(primary) => primary,
				None => {
					warn!(command_buffer = ?id, "can not wait on a secondary command buffer that was never executed");
					return Ok(false);
				}
			},
		};
		match primary.state() {
			CommandBufferState::Submitted { .. } => Ok(primary.wait_complete(0)? && primary.force_retire()?),
			CommandBufferState::Finished => Ok(true),
			state => {
				warn!(command_buffer = ?primary.id(), ?state, "can not wait on a command buffer that was not submitted");
				Ok(false)
			}
		}
	}

	pub fn command_buffer(&self, id: CommandBufferId) -> Option<Arc<CommandBuffer<P>>> {
		if id.target() != self.target {
			return None;
		}
		self.inner.lock().buffers.get(id.arena_id()).cloned()
	}

	/// The number of command buffers ever allocated and not yet freed.
	pub fn buffer_count(&self) -> usize {
		self.inner.lock().buffers.len()
	}

	pub fn free_count(&self, level: CommandBufferLevel) -> usize {
		self.inner.lock().free[level.to_usize()].len()
	}

	pub fn used_count(&self) -> usize {
		self.inner.lock().used.len()
	}

	/// Command buffers that are handed out or submitted.
	pub fn outstanding_count(&self) -> usize {
		let inner = self.inner.lock();
		inner.buffers.len() - inner.free_len()
	}
}

impl<P: LifetimePlatform> ReleaseWaiter for [CommandBufferManager<P>] {
	fn wait_for_release(&self, resource: &Resource) -> bool {
		for id in resource.capturing_buffers() {
			let Some(manager) = self.iter().find(|m| m.target() == id.target()) else {
				warn!(command_buffer = ?id, "no manager for the target of a capturing command buffer");
				return false;
			};
			match manager.wait_and_retire(id) {
				Ok(true) => (),
				Ok(false) => return false,
				Err(e) => {
					error!(resource = %resource.name(), "waiting for release failed: {}", e);
					return false;
				}
			}
		}
		!resource.is_captured()
	}
}
