use crate::context::Device;
use crate::deleter::PendingDeletion;
use crate::platform::{DescriptorPoolSizes, LifetimePlatform};
use crate::resource::Resource;
use crate::rotation::{PoolRing, RotatingPool};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error};

/// How descriptor pools are shared between descriptor set layouts.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum DescriptorPoolStrategy {
	/// All layouts allocate from the same pools.
	#[default]
	Global,
	/// Every layout gets its own pools, avoiding fragmentation with mixed layouts.
	PerLayout,
}

pub struct DescriptorPool<P: LifetimePlatform> {
	raw: P::DescriptorPool,
	resource: Resource,
	allocated: u32,
	max_sets: u32,
	/// the backend refused an allocation before `max_sets` was reached
	exhausted: bool,
}

impl<P: LifetimePlatform> RotatingPool for DescriptorPool<P> {
	fn resource(&self) -> &Resource {
		&self.resource
	}

	fn has_capacity_for(&self, request: u64) -> bool {
		!self.exhausted && self.allocated as u64 + request <= self.max_sets as u64
	}
}

/// A descriptor set and the [`Resource`] of the pool it was allocated from. Command buffers binding the set must
/// capture the resource, otherwise the pool may be reset while the set is still in use.
pub struct DescriptorSet<P: LifetimePlatform> {
	raw: P::DescriptorSet,
	layout: P::DescriptorSetLayout,
	resource: Resource,
}

impl<P: LifetimePlatform> DescriptorSet<P> {
	#[inline]
	pub fn raw(&self) -> P::DescriptorSet {
		self.raw
	}

	#[inline]
	pub fn layout(&self) -> P::DescriptorSetLayout {
		self.layout
	}

	#[inline]
	pub fn resource(&self) -> &Resource {
		&self.resource
	}
}

impl<P: LifetimePlatform> Clone for DescriptorSet<P> {
	fn clone(&self) -> Self {
		Self {
			raw: self.raw,
			layout: self.layout,
			resource: self.resource.clone(),
		}
	}
}

impl<P: LifetimePlatform> Debug for DescriptorSet<P> {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("DescriptorSet")
			.field("raw", &self.raw)
			.field("layout", &self.layout)
			.field("resource", &self.resource)
			.finish()
	}
}

#[derive(Error)]
#[non_exhaustive]
pub enum DescriptorError<P: LifetimePlatform> {
	#[error("Platform Error: {0}")]
	Platform(#[source] P::Error),
	#[error("Descriptor set of layout {0:?} can not be allocated, even from a fresh pool")]
	Unallocatable(P::DescriptorSetLayout),
}

impl<P: LifetimePlatform> Debug for DescriptorError<P> {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		Display::fmt(self, f)
	}
}

/// Allocates short-lived descriptor sets out of rotating descriptor pools. Sets are never freed individually, a pool
/// is reset as a whole once no command buffer captures it anymore.
pub struct DescriptorSetAllocator<P: LifetimePlatform> {
	device: Arc<Device<P>>,
	strategy: DescriptorPoolStrategy,
	sizes: DescriptorPoolSizes,
	max_sets: u32,
	/// keyed by layout with [`DescriptorPoolStrategy::PerLayout`], a single `None` entry otherwise
	rings: Mutex<FxHashMap<Option<P::DescriptorSetLayout>, PoolRing<DescriptorPool<P>>>>,
}

impl<P: LifetimePlatform> DescriptorSetAllocator<P> {
	pub fn new(
		device: Arc<Device<P>>,
		strategy: DescriptorPoolStrategy,
		sizes: DescriptorPoolSizes,
		max_sets: u32,
	) -> Self {
		Self {
			device,
			strategy,
			sizes,
			max_sets: max_sets.max(1),
			rings: Mutex::new(FxHashMap::default()),
		}
	}

	#[inline]
	pub fn strategy(&self) -> DescriptorPoolStrategy {
		self.strategy
	}

	pub fn allocate(&self, layout: P::DescriptorSetLayout) -> Result<DescriptorSet<P>, DescriptorError<P>> {
		let key = match self.strategy {
			DescriptorPoolStrategy::Global => None,
			DescriptorPoolStrategy::PerLayout => Some(layout),
		};
		let mut rings = self.rings.lock();
		let ring = rings.entry(key).or_default();

		// a pool may refuse before reaching max_sets due to fragmentation, retry once with a fresh pool
		for attempt in 0..2 {
			let pool = ring.acquire(1, || self.create_pool())?;
			match unsafe { self.device.allocate_descriptor_set(pool.raw, layout) } {
				Ok(Some(raw)) => {
					pool.allocated += 1;
					return Ok(DescriptorSet {
						raw,
						layout,
						resource: pool.resource.clone(),
					});
				}
				Ok(None) => {
					debug!(?layout, attempt, allocated = pool.allocated, "descriptor pool exhausted");
					pool.exhausted = true;
				}
				Err(e) => {
					error!(?layout, "failed to allocate descriptor set: {}", e);
					return Err(DescriptorError::Platform(e));
				}
			}
		}
		error!(?layout, "descriptor set can not be allocated from a fresh pool");
		Err(DescriptorError::Unallocatable(layout))
	}

	fn create_pool(&self) -> Result<DescriptorPool<P>, DescriptorError<P>> {
		let raw = unsafe { self.device.create_descriptor_pool(&self.sizes, self.max_sets) }.map_err(|e| {
			error!(max_sets = self.max_sets, "failed to create descriptor pool: {}", e);
			DescriptorError::Platform(e)
		})?;
		debug!(?raw, max_sets = self.max_sets, "created descriptor pool");
		Ok(DescriptorPool {
			raw,
			resource: self.device.resources().create("descriptor pool"),
			allocated: 0,
			max_sets: self.max_sets,
			exhausted: false,
		})
	}

	/// Reset every pool no command buffer captures anymore. Returns the number of reset pools.
	pub fn update(&self) -> Result<usize, DescriptorError<P>> {
		profiling::function_scope!();
		let mut rings = self.rings.lock();
		let mut recycled = 0;
		let mut first_err = None;
		for ring in rings.values_mut() {
			let result = ring.update(|pool| -> Result<bool, DescriptorError<P>> {
				unsafe { self.device.reset_descriptor_pool(pool.raw) }.map_err(DescriptorError::Platform)?;
				pool.allocated = 0;
				pool.exhausted = false;
				Ok(true)
			});
			match result {
				Ok(count) => recycled += count,
				Err(e) => {
					first_err.get_or_insert(e);
				}
			}
		}
		match first_err {
			None => Ok(recycled),
			Some(e) => Err(e),
		}
	}

	/// Remove free pools exceeding `max_free` per ring, to be destroyed through the deleter.
	pub(crate) fn trim(&self, max_free: usize) -> Vec<(Resource, PendingDeletion<P>)> {
		let mut rings = self.rings.lock();
		let mut out = Vec::new();
		for ring in rings.values_mut() {
			out.extend(ring.trim(max_free).map(Self::into_deletion));
		}
		rings.retain(|_, ring| !ring.is_empty());
		out
	}

	pub(crate) fn drain(&self) -> Vec<(Resource, PendingDeletion<P>)> {
		let mut rings = self.rings.lock();
		let out: Vec<_> = rings
			.values_mut()
			.flat_map(|ring| ring.drain().map(Self::into_deletion).collect::<Vec<_>>())
			.collect();
		rings.clear();
		out
	}

	fn into_deletion(pool: DescriptorPool<P>) -> (Resource, PendingDeletion<P>) {
		(pool.resource, PendingDeletion::DescriptorPool(pool.raw))
	}

	pub fn ring_count(&self) -> usize {
		self.rings.lock().len()
	}

	pub fn pool_count(&self) -> usize {
		self.rings.lock().values().map(PoolRing::len).sum()
	}
}
