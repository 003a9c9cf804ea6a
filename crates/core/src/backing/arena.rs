use static_assertions::const_assert_eq;
use std::fmt::{Debug, Formatter};

/// Generation-checked index into an [`Arena`]. An id stays valid until its slot is removed, after which the slot's
/// version is bumped and the id will never resolve again, even if the index gets reused.
#[derive(Copy, Clone, Default, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ArenaId {
	index: u32,
	version: u32,
}
const_assert_eq!(core::mem::size_of::<ArenaId>(), 8);

impl ArenaId {
	#[inline]
	pub fn index(&self) -> u32 {
		self.index
	}

	#[inline]
	pub fn version(&self) -> u32 {
		self.version
	}

	#[inline]
	pub fn to_u64(&self) -> u64 {
		(self.version as u64) << 32 | self.index as u64
	}
}

impl Debug for ArenaId {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}v{}", self.index, self.version)
	}
}

struct Slot<T> {
	version: u32,
	value: Option<T>,
}

pub struct Arena<T> {
	slots: Vec<Slot<T>>,
	dead: Vec<u32>,
	len: usize,
}

impl<T> Default for Arena<T> {
	fn default() -> Self {
		Self::new()
	}
}

impl<T> Arena<T> {
	pub const fn new() -> Self {
		Self {
			slots: Vec::new(),
			dead: Vec::new(),
			len: 0,
		}
	}

	#[inline]
	pub fn len(&self) -> usize {
		self.len
	}

	#[inline]
	pub fn is_empty(&self) -> bool {
		self.len == 0
	}

	/// The id the next [`Self::insert`] will return, for values that need to know their own id.
	pub fn vacant_id(&self) -> ArenaId {
		match self.dead.last() {
			Some(&index) => ArenaId {
				index,
				version: self.slots[index as usize].version,
			},
			None => ArenaId {
				index: u32::try_from(self.slots.len()).expect("Arena index overflow"),
				version: 0,
			},
		}
	}

	pub fn insert(&mut self, value: T) -> ArenaId {
		let id = self.vacant_id();
		if self.dead.pop().is_none() {
			self.slots.push(Slot {
				version: 0,
				value: None,
			});
		}
		let slot = &mut self.slots[id.index as usize];
		debug_assert!(slot.value.is_none());
		slot.value = Some(value);
		self.len += 1;
		id
	}

	pub fn remove(&mut self, id: ArenaId) -> Option<T> {
		let slot = self.slots.get_mut(id.index as usize)?;
		if slot.version != id.version {
			return None;
		}
		let value = slot.value.take()?;
		self.len -= 1;
		// a slot whose version wrapped around is retired instead of risking an ABA on an ancient id
		if let Some(version) = slot.version.checked_add(1) {
			slot.version = version;
			self.dead.push(id.index);
		}
		Some(value)
	}

	#[inline]
	pub fn get(&self, id: ArenaId) -> Option<&T> {
		self.slots
			.get(id.index as usize)
			.filter(|slot| slot.version == id.version)
			.and_then(|slot| slot.value.as_ref())
	}

	#[inline]
	pub fn get_mut(&mut self, id: ArenaId) -> Option<&mut T> {
		self.slots
			.get_mut(id.index as usize)
			.filter(|slot| slot.version == id.version)
			.and_then(|slot| slot.value.as_mut())
	}

	#[inline]
	pub fn contains(&self, id: ArenaId) -> bool {
		self.get(id).is_some()
	}

	pub fn iter(&self) -> impl Iterator<Item = (ArenaId, &T)> + '_ {
		self.slots.iter().enumerate().filter_map(|(index, slot)| {
			slot.value.as_ref().map(|value| {
				(
					ArenaId {
						index: index as u32,
						version: slot.version,
					},
					value,
				)
			})
		})
	}

	/// Remove all values. Ids handed out before stay invalid.
	pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
		let ids = self.iter().map(|(id, _)| id).collect::<Vec<_>>();
		ids.into_iter().filter_map(move |id| self.remove(id))
	}
}

impl<T: Debug> Debug for Arena<T> {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		f.debug_map().entries(self.iter()).finish()
	}
}
