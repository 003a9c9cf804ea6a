use crate::command::{
	CommandBufferError, CommandBufferId, CommandBufferState, CommandPoolHandle, PooledSemaphore, RenderPassScope,
};
use crate::context::Device;
use crate::platform::{CommandBufferLevel, CommandTarget, LifetimePlatform, PipelineStageFlags};
use crate::resource::{Resource, ResourceId};
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use smallvec::SmallVec;
use std::fmt::{Debug, Formatter};
use std::mem;
use std::sync::{Arc, Weak};
use tracing::{debug, error, warn};

pub type WaitSemaphores<P> = SmallVec<[(<P as LifetimePlatform>::Semaphore, PipelineStageFlags); 4]>;

/// A recording and submission unit with an explicit state machine:
///
/// `Ready` -> [`begin`] -> `Begin` -> [`end`] -> `End` -> submit -> `Submitted` -> fence signaled and frame safe ->
/// `Finished` -> recycled by its manager -> `Ready`
///
/// Every [`Resource`] captured while recording stays captured until this command buffer is `Finished`. Secondary
/// command buffers forward captures and semaphores to the primary command buffer they are attached to.
///
/// [`begin`]: Self::begin
/// [`end`]: Self::end
pub struct CommandBuffer<P: LifetimePlatform> {
	device: Arc<Device<P>>,
	pool: Arc<CommandPoolHandle<P>>,
	id: CommandBufferId,
	level: CommandBufferLevel,
	raw: P::CommandBuffer,
	/// only primary command buffers own a fence
	fence: Option<P::Fence>,
	inner: Mutex<CommandBufferInner<P>>,
	captured: Mutex<FxHashSet<ResourceId>>,
}

struct CommandBufferInner<P: LifetimePlatform> {
	state: CommandBufferState,
	captured_frame: u64,
	primary: Option<Weak<CommandBuffer<P>>>,
	secondaries: SmallVec<[Arc<CommandBuffer<P>>; 4]>,
	wait_semaphores: WaitSemaphores<P>,
}

impl<P: LifetimePlatform> CommandBuffer<P> {
	pub(crate) fn new(
		device: Arc<Device<P>>,
		pool: Arc<CommandPoolHandle<P>>,
		id: CommandBufferId,
		level: CommandBufferLevel,
		raw: P::CommandBuffer,
		fence: Option<P::Fence>,
	) -> Self {
		Self {
			device,
			pool,
			id,
			level,
			raw,
			fence,
			inner: Mutex::new(CommandBufferInner {
				state: CommandBufferState::Ready,
				captured_frame: 0,
				primary: None,
				secondaries: SmallVec::new(),
				wait_semaphores: SmallVec::new(),
			}),
			captured: Mutex::new(FxHashSet::default()),
		}
	}

	#[inline]
	pub fn id(&self) -> CommandBufferId {
		self.id
	}

	#[inline]
	pub fn target(&self) -> CommandTarget {
		self.id.target()
	}

	#[inline]
	pub fn level(&self) -> CommandBufferLevel {
		self.level
	}

	#[inline]
	pub fn raw(&self) -> P::CommandBuffer {
		self.raw
	}

	pub fn state(&self) -> CommandBufferState {
		self.inner.lock().state
	}

	/// The frame this command buffer was submitted in, 0 if not submitted.
	pub fn captured_frame(&self) -> u64 {
		self.inner.lock().captured_frame
	}

	pub fn captured_resource_count(&self) -> usize {
		self.captured.lock().len()
	}

	/// The primary command buffer a secondary is attached to.
	pub fn primary(&self) -> Option<Arc<Self>> {
		self.inner.lock().primary.as_ref().and_then(Weak::upgrade)
	}

	/// Whether work submitted in this command buffer's frame may be considered retired in `frame`.
	pub fn is_safe_frame(&self, frame: u64) -> bool {
		self.device.is_safe_frame(self.captured_frame(), frame)
	}

	fn usage_error(&self, err: CommandBufferError<P>) -> CommandBufferError<P> {
		error!(command_buffer = ?self.id, "{}", err);
		err
	}

	fn invalid_state(&self, expected: &'static str, found: CommandBufferState) -> CommandBufferError<P> {
		self.usage_error(CommandBufferError::InvalidState {
			id: self.id,
			expected,
			found,
		})
	}

	fn platform_error(&self, inner: &mut CommandBufferInner<P>, err: P::Error) -> CommandBufferError<P> {
		inner.state = CommandBufferState::Invalid;
		error!(command_buffer = ?self.id, "backend failure, command buffer is now invalid: {}", err);
		CommandBufferError::Platform(err)
	}

	pub fn begin(&self) -> Result<(), CommandBufferError<P>> {
		let mut inner = self.inner.lock();
		match inner.state {
			CommandBufferState::Ready => {
				if let Err(e) = unsafe { self.device.begin_command_buffer(self.raw, self.level) } {
					return Err(self.platform_error(&mut inner, e));
				}
				inner.state = CommandBufferState::Begin {
					inside_render_pass: false,
				};
				Ok(())
			}
			found => Err(self.invalid_state("Ready", found)),
		}
	}

	pub fn end(&self) -> Result<(), CommandBufferError<P>> {
		let mut inner = self.inner.lock();
		match inner.state {
			CommandBufferState::Begin {
				inside_render_pass: false,
			} => {
				if let Err(e) = unsafe { self.device.end_command_buffer(self.raw) } {
					return Err(self.platform_error(&mut inner, e));
				}
				inner.state = CommandBufferState::End;
				Ok(())
			}
			CommandBufferState::Begin {
				inside_render_pass: true,
			} => Err(self.usage_error(CommandBufferError::RenderPassScope {
				id: self.id,
				scope: RenderPassScope::Outside,
			})),
			found => Err(self.invalid_state("Begin", found)),
		}
	}

	/// Capture `resource` for the lifetime of this command buffer's execution. A `frame` of 0 captures in the
	/// current frame. Only legal while recording.
	pub fn capture(&self, resource: &Resource, frame: u64) -> Result<(), CommandBufferError<P>> {
		let frame = self.device.resolve_frame(frame);
		let primary = {
			let inner = self.inner.lock();
			match inner.state {
				CommandBufferState::Begin { .. } => inner.primary.as_ref().and_then(Weak::upgrade),
				found => return Err(self.invalid_state("Begin", found)),
			}
		};
		match primary {
			Some(primary) => primary.capture_forwarded(resource, frame),
			None => {
				self.capture_unchecked(resource, frame);
				Ok(())
			}
		}
	}

	fn capture_forwarded(&self, resource: &Resource, frame: u64) -> Result<(), CommandBufferError<P>> {
		match self.state() {
			CommandBufferState::Ready | CommandBufferState::Begin { .. } | CommandBufferState::End => {
				self.capture_unchecked(resource, frame);
				Ok(())
			}
			found => Err(self.invalid_state("Ready, Begin or End", found)),
		}
	}

	pub(crate) fn capture_unchecked(&self, resource: &Resource, frame: u64) {
		let mut captured = self.captured.lock();
		captured.insert(resource.id());
		resource.capture(self.id, frame);
	}

	/// Wait on `semaphore` in `stage` before this command buffer executes. The semaphore stays captured until this
	/// command buffer has retired.
	pub fn add_semaphore(
		&self,
		semaphore: &PooledSemaphore<P>,
		stage: PipelineStageFlags,
	) -> Result<(), CommandBufferError<P>> {
		let primary = {
			let mut inner = self.inner.lock();
			match inner.state {
				CommandBufferState::Ready | CommandBufferState::Begin { .. } | CommandBufferState::End => (),
				found => return Err(self.invalid_state("Ready, Begin or End", found)),
			}
			let primary = inner.primary.as_ref().and_then(Weak::upgrade);
			if primary.is_none() {
				inner.wait_semaphores.push((semaphore.raw(), stage));
			}
			primary
		};
		match primary {
			Some(primary) => primary.add_semaphore(semaphore, stage),
			None => {
				self.capture_unchecked(semaphore.resource(), self.device.frame());
				Ok(())
			}
		}
	}

	pub fn add_semaphores<'a>(
		&self,
		semaphores: impl IntoIterator<Item = (&'a PooledSemaphore<P>, PipelineStageFlags)>,
	) -> Result<(), CommandBufferError<P>> {
		for (semaphore, stage) in semaphores {
			self.add_semaphore(semaphore, stage)?;
		}
		Ok(())
	}

	pub fn wait_semaphore_count(&self) -> usize {
		self.inner.lock().wait_semaphores.len()
	}

	/// Record commands with direct access to the backend. Fails if not recording or if the current render pass
	/// state does not match `scope`.
	pub fn record<R>(
		&self,
		scope: RenderPassScope,
		f: impl FnOnce(&P, P::CommandBuffer) -> R,
	) -> Result<R, CommandBufferError<P>> {
		// not held while recording, `f` may capture resources on this command buffer
		match self.state() {
			CommandBufferState::Begin { inside_render_pass } => {
				let allowed = match scope {
					RenderPassScope::Any => true,
					RenderPassScope::Inside => inside_render_pass,
					RenderPassScope::Outside => !inside_render_pass,
				};
				if allowed {
					Ok(f(&self.device.platform, self.raw))
				} else {
					Err(self.usage_error(CommandBufferError::RenderPassScope { id: self.id, scope }))
				}
			}
			found => Err(self.invalid_state("Begin", found)),
		}
	}

	pub fn begin_render_pass(&self, f: impl FnOnce(&P, P::CommandBuffer)) -> Result<(), CommandBufferError<P>> {
		self.record(RenderPassScope::Outside, f)?;
		self.set_inside_render_pass(true);
		Ok(())
	}

	pub fn end_render_pass(&self, f: impl FnOnce(&P, P::CommandBuffer)) -> Result<(), CommandBufferError<P>> {
		self.record(RenderPassScope::Inside, f)?;
		self.set_inside_render_pass(false);
		Ok(())
	}

	fn set_inside_render_pass(&self, inside: bool) {
		if let CommandBufferState::Begin { inside_render_pass } = &mut self.inner.lock().state {
			*inside_render_pass = inside;
		}
	}

	/// Execute recorded secondary command buffers from this primary. Secondaries that were recorded stand-alone get
	/// attached to this primary, their captures and semaphores migrate over.
	pub fn execute_commands(self: &Arc<Self>, secondaries: &[Arc<Self>]) -> Result<(), CommandBufferError<P>> {
		if self.level != CommandBufferLevel::Primary {
			return Err(self.usage_error(CommandBufferError::WrongLevel {
				id: self.id,
				level: self.level,
				expected: CommandBufferLevel::Primary,
			}));
		}
		match self.state() {
			CommandBufferState::Begin { .. } => (),
			found => return Err(self.invalid_state("Begin", found)),
		}

		let frame = self.device.frame();
		for secondary in secondaries {
			if secondary.level != CommandBufferLevel::Secondary {
				return Err(self.usage_error(CommandBufferError::WrongLevel {
					id: secondary.id,
					level: secondary.level,
					expected: CommandBufferLevel::Secondary,
				}));
			}
			secondary.attach(self, frame)?;
		}

		let raw = secondaries.iter().map(|s| s.raw).collect::<SmallVec<[_; 4]>>();
		unsafe { self.device.cmd_execute_commands(self.raw, &raw) };
		let mut inner = self.inner.lock();
		for secondary in secondaries {
			if !inner.secondaries.iter().any(|s| Arc::ptr_eq(s, secondary)) {
				inner.secondaries.push(secondary.clone());
			}
		}
		Ok(())
	}

	/// Attach a freshly acquired secondary, so that it forwards everything to `primary` from the start.
	pub(crate) fn set_primary(&self, primary: &Arc<Self>) {
		self.inner.lock().primary = Some(Arc::downgrade(primary));
	}

	fn attach(&self, primary: &Arc<Self>, frame: u64) -> Result<(), CommandBufferError<P>> {
		let semaphores = {
			let mut inner = self.inner.lock();
			match inner.state {
				CommandBufferState::End => (),
				found => return Err(self.invalid_state("End", found)),
			}
			match inner.primary.as_ref().and_then(Weak::upgrade) {
				Some(existing) if !Arc::ptr_eq(&existing, primary) => {
					return Err(self.usage_error(CommandBufferError::AlreadyAttached(self.id)));
				}
				Some(_) => (),
				None => inner.primary = Some(Arc::downgrade(primary)),
			}
			mem::take(&mut inner.wait_semaphores)
		};

		// capture on the primary first, so the resource never transitions to done in between
		let ids = self.captured.lock().drain().collect::<SmallVec<[_; 16]>>();
		for id in ids {
			if let Some(resource) = self.device.resources().get(id) {
				primary.capture_unchecked(&resource, frame);
				resource.release(self.id);
			}
		}
		primary.inner.lock().wait_semaphores.extend(semaphores);
		Ok(())
	}

	/// Submit to the queue, returns the executed secondaries which have been marked as submitted as well.
	pub(crate) fn submit(
		&self,
		signal_semaphores: &[&PooledSemaphore<P>],
	) -> Result<SmallVec<[Arc<Self>; 4]>, CommandBufferError<P>> {
		if self.level != CommandBufferLevel::Primary {
			return Err(self.usage_error(CommandBufferError::WrongLevel {
				id: self.id,
				level: self.level,
				expected: CommandBufferLevel::Primary,
			}));
		}

		let frame = self.device.frame();
		let mut inner = self.inner.lock();
		match inner.state {
			CommandBufferState::End => (),
			found => return Err(self.invalid_state("End", found)),
		}
		let fence = self.fence.expect("primary command buffers always own a fence");
		for semaphore in signal_semaphores {
			self.capture_unchecked(semaphore.resource(), frame);
		}
		let signal = signal_semaphores
			.iter()
			.map(|s| s.raw())
			.collect::<SmallVec<[_; 4]>>();
		let result = unsafe {
			self.device
				.submit(self.target(), self.raw, &inner.wait_semaphores, &signal, fence)
		};
		if let Err(e) = result {
			return Err(self.platform_error(&mut inner, e));
		}
		inner.state = CommandBufferState::Submitted { frame };
		inner.captured_frame = frame;
		let secondaries = inner.secondaries.clone();
		drop(inner);

		for secondary in &secondaries {
			let mut inner = secondary.inner.lock();
			inner.state = CommandBufferState::Submitted { frame };
			inner.captured_frame = frame;
		}
		Ok(secondaries)
	}

	/// Block until the submitted work has completed, a `timeout_ns` of 0 waits unbounded. Returns false if the
	/// timeout elapsed, the GPU work is not cancelled by that. A secondary waits on its primary.
	///
	/// `true` means the GPU has finished, not that this command buffer retired. Inside the frame-pipelining window it
	/// stays `Submitted` and keeps its resources captured until a later [`CommandBufferManager::update`] or
	/// [`Self::refresh_fence_status`] retires it. Check [`Self::state`] for `Finished` before relying on released
	/// captures.
	///
	/// [`CommandBufferManager::update`]: crate::command::CommandBufferManager::update
	pub fn wait_complete(&self, timeout_ns: u64) -> Result<bool, CommandBufferError<P>> {
		profiling::function_scope!();
		if self.level == CommandBufferLevel::Secondary {
			return match self.primary() {
				Some(primary) => primary.wait_complete(timeout_ns),
				None => match self.state() {
					CommandBufferState::Finished => Ok(true),
					found => Err(self.invalid_state("attached to a primary", found)),
				},
			};
		}

		if self.refresh_fence_status()? {
			return Ok(true);
		}
		match self.state() {
			CommandBufferState::Finished => Ok(true),
			CommandBufferState::Submitted { .. } => {
				let fence = self.fence.expect("primary command buffers always own a fence");
				let timeout_ns = if timeout_ns == 0 { u64::MAX } else { timeout_ns };
				match unsafe { self.device.wait_fence(fence, timeout_ns) } {
					Ok(true) => {
						self.refresh_fence_status()?;
						Ok(true)
					}
					Ok(false) => {
						warn!(command_buffer = ?self.id, timeout_ns, "timed out waiting for command buffer");
						Ok(false)
					}
					Err(e) => {
						error!(command_buffer = ?self.id, "waiting on fence failed: {}", e);
						Err(CommandBufferError::Platform(e))
					}
				}
			}
			found => Err(self.invalid_state("Submitted or Finished", found)),
		}
	}

	/// Poll the fence without blocking. If it has signaled and the frame is safe, transitions to `Finished` and
	/// releases all captured resources, of this command buffer and of all its secondaries. Returns whether this
	/// command buffer is `Finished`.
	pub fn refresh_fence_status(&self) -> Result<bool, CommandBufferError<P>> {
		self.refresh(false)
	}

	/// Like [`Self::refresh_fence_status`] but ignores the frame-pipelining window. Only for callers that know the
	/// GPU is done with every resource, as after waiting on the fence.
	pub(crate) fn force_retire(&self) -> Result<bool, CommandBufferError<P>> {
		self.refresh(true)
	}

	fn refresh(&self, ignore_safe_frame: bool) -> Result<bool, CommandBufferError<P>> {
		let Some(fence) = self.fence else {
			return Ok(self.state() == CommandBufferState::Finished);
		};
		let mut inner = self.inner.lock();
		match inner.state {
			CommandBufferState::Finished => return Ok(true),
			CommandBufferState::Submitted { .. } => (),
			_ => return Ok(false),
		}

		let signaled = match unsafe { self.device.fence_status(fence) } {
			Ok(signaled) => signaled,
			Err(e) => return Err(self.platform_error(&mut inner, e)),
		};
		let safe = ignore_safe_frame
			|| self
				.device
				.is_safe_frame(inner.captured_frame, self.device.retirement_frame());
		if !signaled || !safe {
			return Ok(false);
		}
		if let Err(e) = unsafe { self.device.reset_fence(fence) } {
			return Err(self.platform_error(&mut inner, e));
		}
		inner.state = CommandBufferState::Finished;
		inner.wait_semaphores.clear();
		let secondaries = inner.secondaries.clone();
		drop(inner);

		for secondary in &secondaries {
			secondary.inner.lock().state = CommandBufferState::Finished;
			secondary.release_resources();
		}
		let released = self.release_resources();
		debug!(command_buffer = ?self.id, released, "retired");
		Ok(true)
	}

	/// Release every captured resource, returns how many became done.
	pub(crate) fn release_resources(&self) -> usize {
		let ids = self.captured.lock().drain().collect::<SmallVec<[_; 16]>>();
		if ids.is_empty() {
			0
		} else {
			self.device.resources().release_all(ids, self.id)
		}
	}

	/// Reset to `Ready` for reuse. Unsubmitted command buffers may be recycled as well, which drops their captures.
	pub(crate) fn recycle(&self) -> Result<(), CommandBufferError<P>> {
		let mut inner = self.inner.lock();
		match inner.state {
			CommandBufferState::Finished
			| CommandBufferState::Ready
			| CommandBufferState::Begin { .. }
			| CommandBufferState::End => (),
			found => return Err(self.invalid_state("Finished or not yet submitted", found)),
		}
		if let Err(e) = unsafe { self.device.reset_command_buffer(self.raw) } {
			return Err(self.platform_error(&mut inner, e));
		}
		inner.state = CommandBufferState::Ready;
		inner.captured_frame = 0;
		inner.primary = None;
		inner.secondaries.clear();
		inner.wait_semaphores.clear();
		drop(inner);
		self.release_resources();
		Ok(())
	}
}

impl<P: LifetimePlatform> Debug for CommandBuffer<P> {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CommandBuffer")
			.field("id", &self.id)
			.field("level", &self.level)
			.field("state", &self.state())
			.finish()
	}
}

impl<P: LifetimePlatform> Drop for CommandBuffer<P> {
	fn drop(&mut self) {
		self.release_resources();
		unsafe {
			self.device.free_command_buffer(self.pool.raw(), self.raw);
			if let Some(fence) = self.fence {
				self.device.destroy_fence(fence);
			}
		}
	}
}
