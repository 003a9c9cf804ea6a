//! Object pools that are only reused once the GPU is done with them.
//!
//! A [`PoolRing`] holds a current pool serving requests, a list of used pools and a list of free pools. Every
//! request is served by the current pool until it runs out of capacity, then it is retired to the used list. Command
//! buffers capture the [`Resource`] of a pool they use, a used pool only becomes free once it is not captured anymore.

mod descriptor;
mod query;
mod uniform;

pub use descriptor::*;
pub use query::*;
pub use uniform::*;

use crate::resource::Resource;
use std::collections::VecDeque;
use std::mem;

pub trait RotatingPool {
	/// The resource command buffers capture when using this pool.
	fn resource(&self) -> &Resource;

	fn has_capacity_for(&self, request: u64) -> bool;
}

pub struct PoolRing<T> {
	current: Option<T>,
	used: VecDeque<T>,
	free: Vec<T>,
}

impl<T> Default for PoolRing<T> {
	fn default() -> Self {
		Self::new()
	}
}

impl<T> PoolRing<T> {
	pub const fn new() -> Self {
		Self {
			current: None,
			used: VecDeque::new(),
			free: Vec::new(),
		}
	}
}

impl<T: RotatingPool> PoolRing<T> {
	#[inline]
	pub fn current(&self) -> Option<&T> {
		self.current.as_ref()
	}

	/// The current pool if it can serve `request`. Otherwise, the current pool is retired and replaced by a free
	/// pool or a pool from `create`.
	pub fn acquire<E>(&mut self, request: u64, create: impl FnOnce() -> Result<T, E>) -> Result<&mut T, E> {
		let current = match self.current.take() {
			Some(current) if current.has_capacity_for(request) => current,
			retired => {
				self.used.extend(retired);
				match self.free.pop() {
					Some(pool) => pool,
					None => create()?,
				}
			}
		};
		Ok(self.current.insert(current))
	}

	pub fn retire_current(&mut self) {
		if let Some(current) = self.current.take() {
			self.used.push_back(current);
		}
	}

	/// Move the current pool to the used list if it is captured, then offer every used pool that is no longer
	/// captured to `recycle`. Pools for which `recycle` returns `Ok(true)` become free. Returns the number of
	/// recycled pools, or the first error after all pools have been offered.
	pub fn update<E>(&mut self, mut recycle: impl FnMut(&mut T) -> Result<bool, E>) -> Result<usize, E> {
		if self.current.as_ref().is_some_and(|c| c.resource().is_captured()) {
			self.retire_current();
		}

		let mut recycled = 0;
		let mut first_err = None;
		for mut pool in mem::take(&mut self.used) {
			if pool.resource().is_captured() {
				self.used.push_back(pool);
				continue;
			}
			match recycle(&mut pool) {
				Ok(true) => {
					self.free.push(pool);
					recycled += 1;
				}
				Ok(false) => self.used.push_back(pool),
				Err(e) => {
					first_err.get_or_insert(e);
					self.used.push_back(pool);
				}
			}
		}
		match first_err {
			None => Ok(recycled),
			Some(e) => Err(e),
		}
	}

	/// Remove free pools exceeding `max_free`, to be destroyed by the caller.
	pub fn trim(&mut self, max_free: usize) -> impl Iterator<Item = T> + '_ {
		let keep = max_free.min(self.free.len());
		self.free.drain(keep..)
	}

	/// Remove every pool, to be destroyed by the caller.
	pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
		self.current
			.take()
			.into_iter()
			.chain(self.used.drain(..))
			.chain(self.free.drain(..))
	}

	pub fn used_len(&self) -> usize {
		self.used.len()
	}

	pub fn free_len(&self) -> usize {
		self.free.len()
	}

	pub fn len(&self) -> usize {
		self.current.iter().count() + self.used.len() + self.free.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}
