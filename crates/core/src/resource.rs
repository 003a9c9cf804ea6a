use crate::backing::arena::{Arena, ArenaId};
use crate::command::CommandBufferId;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;
use std::borrow::Cow;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering::{Acquire, Release};
use std::sync::{Arc, Weak};
use tracing::{trace, warn};

#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ResourceId(ArenaId);

impl Debug for ResourceId {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "ResourceId({:?})", self.0)
	}
}

#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
pub enum ResourceStatus {
	/// Never captured since creation.
	Free,
	Captured,
	/// Was captured and every capturing command buffer has retired since.
	Done,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ResourceState {
	Free,
	Captured { count: u32, frame: u64 },
	Done,
}

impl ResourceState {
	#[inline]
	pub fn status(&self) -> ResourceStatus {
		match self {
			ResourceState::Free => ResourceStatus::Free,
			ResourceState::Captured { .. } => ResourceStatus::Captured,
			ResourceState::Done => ResourceStatus::Done,
		}
	}

	#[inline]
	pub fn ref_count(&self) -> u32 {
		match self {
			ResourceState::Captured { count, .. } => *count,
			ResourceState::Free | ResourceState::Done => 0,
		}
	}
}

/// Registry of all alive [`Resource`]s, allowing command buffers to refer to the resources they captured by
/// [`ResourceId`] instead of holding them alive.
pub struct ResourceTable {
	slots: RwLock<Arena<Weak<ResourceInner>>>,
}

impl ResourceTable {
	pub fn new() -> Arc<Self> {
		Arc::new(Self {
			slots: RwLock::new(Arena::new()),
		})
	}

	pub fn create(self: &Arc<Self>, name: impl Into<Cow<'static, str>>) -> Resource {
		let mut slots = self.slots.write();
		let inner = Arc::new(ResourceInner {
			id: ResourceId(slots.vacant_id()),
			name: name.into(),
			table: Arc::downgrade(self),
			status: AtomicU32::new(ResourceStatus::Free as u32),
			captures: Mutex::new(Captures {
				state: ResourceState::Free,
				buffers: SmallVec::new(),
			}),
		});
		slots.insert(Arc::downgrade(&inner));
		Resource(inner)
	}

	pub fn get(&self, id: ResourceId) -> Option<Resource> {
		self.slots.read().get(id.0).and_then(Weak::upgrade).map(Resource)
	}

	pub fn len(&self) -> usize {
		self.slots.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Releases every resource in `ids` from `buffer`. Resources that have been dropped in the meantime are skipped.
	/// Returns the number of resources that became [`ResourceStatus::Done`].
	pub(crate) fn release_all(&self, ids: impl IntoIterator<Item = ResourceId>, buffer: CommandBufferId) -> usize {
		// resolve under the read lock, but release and possibly drop the last handle outside it, as dropping a
		// resource needs the write lock
		let resources = {
			let slots = self.slots.read();
			ids.into_iter()
				.filter_map(|id| {
					let resource = slots.get(id.0).and_then(Weak::upgrade);
					if resource.is_none() {
						trace!(?id, ?buffer, "captured resource was dropped before its release");
					}
					resource
				})
				.collect::<SmallVec<[_; 16]>>()
		};
		resources
			.into_iter()
			.filter(|inner| Resource::release_inner(inner, buffer))
			.count()
	}
}

struct ResourceInner {
	id: ResourceId,
	name: Cow<'static, str>,
	table: Weak<ResourceTable>,
	/// mirror of `captures.state` for lock-free status queries
	status: AtomicU32,
	captures: Mutex<Captures>,
}

struct Captures {
	state: ResourceState,
	buffers: SmallVec<[CommandBufferId; 4]>,
}

impl Drop for ResourceInner {
	fn drop(&mut self) {
		if let Some(table) = self.table.upgrade() {
			table.slots.write().remove(self.id.0);
		}
	}
}

/// Gives a GPU-backed object a capture / release reference count. A resource is captured by every command buffer
/// that references it while recording and released once that command buffer has retired.
///
/// Cloning a [`Resource`] creates another handle to the same resource.
#[derive(Clone)]
pub struct Resource(Arc<ResourceInner>);

impl Resource {
	#[inline]
	pub fn id(&self) -> ResourceId {
		self.0.id
	}

	#[inline]
	pub fn name(&self) -> &str {
		&self.0.name
	}

	#[inline]
	pub fn status(&self) -> ResourceStatus {
		ResourceStatus::from_u32(self.0.status.load(Acquire)).expect("invalid ResourceStatus")
	}

	#[inline]
	pub fn is_captured(&self) -> bool {
		self.status() == ResourceStatus::Captured
	}

	pub fn state(&self) -> ResourceState {
		self.0.captures.lock().state
	}

	pub fn ref_count(&self) -> u32 {
		self.state().ref_count()
	}

	/// The frame of the most recent capture, 0 if not captured.
	pub fn last_frame(&self) -> u64 {
		match self.state() {
			ResourceState::Captured { frame, .. } => frame,
			ResourceState::Free | ResourceState::Done => 0,
		}
	}

	pub fn capturing_buffers(&self) -> SmallVec<[CommandBufferId; 4]> {
		self.0.captures.lock().buffers.clone()
	}

	/// Capture this resource by `buffer` in `frame`. Returns true if this was the first capture by `buffer`, a
	/// repeated capture only refreshes the frame.
	pub(crate) fn capture(&self, buffer: CommandBufferId, frame: u64) -> bool {
		let mut captures = self.0.captures.lock();
		let first = !captures.buffers.contains(&buffer);
		if first {
			captures.buffers.push(buffer);
		}
		captures.state = ResourceState::Captured {
			count: captures.buffers.len() as u32,
			frame,
		};
		self.0.status.store(ResourceStatus::Captured as u32, Release);
		trace!(resource = %self.name(), ?buffer, frame, first, "capture");
		first
	}

	/// Release the capture of `buffer`. Returns true if this was the last capture and the resource is now
	/// [`ResourceStatus::Done`].
	pub(crate) fn release(&self, buffer: CommandBufferId) -> bool {
		Self::release_inner(&self.0, buffer)
	}

	fn release_inner(inner: &Arc<ResourceInner>, buffer: CommandBufferId) -> bool {
		let mut captures = inner.captures.lock();
		let Some(position) = captures.buffers.iter().position(|b| *b == buffer) else {
			warn!(resource = %inner.name, ?buffer, "release by a command buffer that never captured it");
			return false;
		};
		captures.buffers.swap_remove(position);

		match captures.state {
			ResourceState::Captured { count, frame } => {
				let count = match count.checked_sub(1) {
					Some(count) => count,
					None => panic!("Resource \"{}\" ref_count underflow", inner.name),
				};
				if count as usize != captures.buffers.len() {
					panic!(
						"Resource \"{}\" has ref_count {} but {} capturing buffers",
						inner.name,
						count,
						captures.buffers.len()
					);
				}
				if count == 0 {
					captures.state = ResourceState::Done;
					inner.status.store(ResourceStatus::Done as u32, Release);
					true
				} else {
					captures.state = ResourceState::Captured { count, frame };
					false
				}
			}
			state => panic!(
				"Resource \"{}\" lists capturing buffer {:?} while {:?}",
				inner.name, buffer, state
			),
		}
	}
}

impl Debug for Resource {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Resource")
			.field("id", &self.id())
			.field("name", &self.name())
			.field("state", &self.state())
			.finish()
	}
}

impl PartialEq for Resource {
	fn eq(&self, other: &Self) -> bool {
		self.id() == other.id()
	}
}

impl Eq for Resource {}

#[cfg(test)]
mod test {
	use super::*;
	use crate::platform::CommandTarget;

	fn buffer(arena: &mut Arena<()>) -> CommandBufferId {
		CommandBufferId::new(CommandTarget::Draw, arena.insert(()))
	}

	#[test]
	fn capture_release() {
		let table = ResourceTable::new();
		let mut ids = Arena::new();
		let (a, b) = (buffer(&mut ids), buffer(&mut ids));
		let r = table.create("r");
		assert_eq!(r.status(), ResourceStatus::Free);

		assert!(r.capture(a, 1));
		assert!(r.capture(b, 2));
		assert_eq!(r.state(), ResourceState::Captured { count: 2, frame: 2 });

		assert!(!r.release(a));
		assert_eq!(r.ref_count(), 1);
		assert!(r.is_captured());

		assert!(r.release(b));
		assert_eq!(r.state(), ResourceState::Done);
		assert_eq!(r.last_frame(), 0);
		assert!(r.capturing_buffers().is_empty());
	}

	#[test]
	fn recapture_is_idempotent() {
		let table = ResourceTable::new();
		let mut ids = Arena::new();
		let a = buffer(&mut ids);
		let r = table.create("r");

		assert!(r.capture(a, 1));
		assert!(!r.capture(a, 3));
		assert_eq!(r.state(), ResourceState::Captured { count: 1, frame: 3 });
		assert!(r.release(a));
		assert_eq!(r.status(), ResourceStatus::Done);
	}

	#[test]
	fn release_by_stranger_is_ignored() {
		let table = ResourceTable::new();
		let mut ids = Arena::new();
		let (a, b) = (buffer(&mut ids), buffer(&mut ids));
		let r = table.create("r");

		r.capture(a, 1);
		assert!(!r.release(b));
		assert_eq!(r.ref_count(), 1);
		assert!(!table.get(r.id()).unwrap().release(b));
	}

	#[test]
	fn count_matches_status_for_any_sequence() {
		let table = ResourceTable::new();
		let mut ids = Arena::new();
		let buffers = (0..4).map(|_| buffer(&mut ids)).collect::<Vec<_>>();
		let r = table.create("r");

		// deterministic pseudo random sequence of captures and releases
		let mut seed = 0x2545_f491_u32;
		for frame in 1..500u64 {
			seed ^= seed << 13;
			seed ^= seed >> 17;
			seed ^= seed << 5;
			let b = buffers[(seed % 4) as usize];
			if seed & 0x10 == 0 {
				r.capture(b, frame);
			} else {
				r.release(b);
			}
			let state = r.state();
			assert_eq!(state.status() == ResourceStatus::Captured, state.ref_count() > 0);
			assert_eq!(state.ref_count() as usize, r.capturing_buffers().len());
			assert_eq!(r.status(), state.status());
		}
	}

	#[test]
	fn dropped_resource_unregisters() {
		let table = ResourceTable::new();
		let mut ids = Arena::new();
		let a = buffer(&mut ids);
		let r = table.create("r");
		let id = r.id();
		r.capture(a, 1);
		assert_eq!(table.len(), 1);

		drop(r);
		assert!(table.get(id).is_none());
		assert!(table.is_empty());
		assert_eq!(table.release_all([id], a), 0);
	}
}
