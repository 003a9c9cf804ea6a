use crate::command::{CommandBuffer, CommandBufferError, RenderPassScope};
use crate::context::Device;
use crate::deleter::PendingDeletion;
use crate::platform::{LifetimePlatform, PipelineStageFlags, QueryType};
use crate::resource::{Resource, ResourceStatus};
use crate::rotation::{PoolRing, RotatingPool};
use parking_lot::Mutex;
use smallvec::{smallvec, SmallVec};
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error};

pub type QueryValues = SmallVec<[u64; 4]>;

/// Shared between a [`Query`] and its pool, filled in once the results are available.
#[derive(Default)]
struct QueryResults(Mutex<Option<QueryValues>>);

struct QueryBatch {
	first: u32,
	count: u32,
	results: Arc<QueryResults>,
}

pub struct QueryPool<P: LifetimePlatform> {
	raw: P::QueryPool,
	capacity: u32,
	next: u32,
	resource: Resource,
	batches: Vec<QueryBatch>,
}

impl<P: LifetimePlatform> RotatingPool for QueryPool<P> {
	fn resource(&self) -> &Resource {
		&self.resource
	}

	fn has_capacity_for(&self, request: u64) -> bool {
		self.next as u64 + request <= self.capacity as u64
	}
}

#[derive(Error)]
#[non_exhaustive]
pub enum QueryError<P: LifetimePlatform> {
	#[error("Platform Error: {0}")]
	Platform(#[source] P::Error),
	#[error("{0}")]
	CommandBuffer(#[from] CommandBufferError<P>),
	#[error("Query index {index} out of range of {count} allocated queries")]
	IndexOutOfRange { index: u32, count: u32 },
	#[error("Requested {requested} queries, but a query pool only holds {capacity}")]
	ExceedsPoolCapacity { requested: u32, capacity: u32 },
}

impl<P: LifetimePlatform> Debug for QueryError<P> {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		Display::fmt(self, f)
	}
}

/// A batch of consecutive queries of a query pool. The results are fetched by
/// [`QueryPoolManager::update_render_queries`] once every command buffer recording into the pool has retired.
pub struct Query<P: LifetimePlatform> {
	pool: P::QueryPool,
	ty: QueryType,
	first: u32,
	count: u32,
	resource: Resource,
	results: Arc<QueryResults>,
}

impl<P: LifetimePlatform> Query<P> {
	#[inline]
	pub fn ty(&self) -> QueryType {
		self.ty
	}

	#[inline]
	pub fn count(&self) -> u32 {
		self.count
	}

	#[inline]
	pub fn raw_pool(&self) -> P::QueryPool {
		self.pool
	}

	/// Index of the first query of this batch within its pool.
	#[inline]
	pub fn first(&self) -> u32 {
		self.first
	}

	#[inline]
	pub fn resource(&self) -> &Resource {
		&self.resource
	}

	fn query_index(&self, index: u32) -> Result<u32, QueryError<P>> {
		if index < self.count {
			Ok(self.first + index)
		} else {
			Err(QueryError::IndexOutOfRange {
				index,
				count: self.count,
			})
		}
	}

	pub fn begin(&self, cmd: &CommandBuffer<P>, index: u32) -> Result<(), QueryError<P>> {
		let query = self.query_index(index)?;
		cmd.capture(&self.resource, 0)?;
		cmd.record(RenderPassScope::Any, |platform, raw| unsafe {
			platform.cmd_begin_query(raw, self.pool, query)
		})?;
		Ok(())
	}

	pub fn end(&self, cmd: &CommandBuffer<P>, index: u32) -> Result<(), QueryError<P>> {
		let query = self.query_index(index)?;
		cmd.capture(&self.resource, 0)?;
		cmd.record(RenderPassScope::Any, |platform, raw| unsafe {
			platform.cmd_end_query(raw, self.pool, query)
		})?;
		Ok(())
	}

	pub fn write_timestamp(
		&self,
		cmd: &CommandBuffer<P>,
		stage: PipelineStageFlags,
		index: u32,
	) -> Result<(), QueryError<P>> {
		let query = self.query_index(index)?;
		cmd.capture(&self.resource, 0)?;
		cmd.record(RenderPassScope::Any, |platform, raw| unsafe {
			platform.cmd_write_timestamp(raw, stage, self.pool, query)
		})?;
		Ok(())
	}

	/// Reset every query of this batch, required before reusing the queries within the same pool cycle.
	pub fn reset(&self, cmd: &CommandBuffer<P>) -> Result<(), QueryError<P>> {
		cmd.record(RenderPassScope::Outside, |platform, raw| unsafe {
			platform.cmd_reset_query_pool(raw, self.pool, self.first, self.count)
		})?;
		cmd.capture(&self.resource, 0)?;
		Ok(())
	}

	/// The results of all queries of this batch, `None` until they have been fetched.
	pub fn results(&self) -> Option<QueryValues> {
		self.results.0.lock().clone()
	}

	pub fn is_ready(&self) -> bool {
		self.results.0.lock().is_some()
	}
}

impl<P: LifetimePlatform> Debug for Query<P> {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Query")
			.field("pool", &self.pool)
			.field("ty", &self.ty)
			.field("first", &self.first)
			.field("count", &self.count)
			.field("ready", &self.is_ready())
			.finish()
	}
}

/// Hands out batches of render queries from rotating query pools, one ring per [`QueryType`].
pub struct QueryPoolManager<P: LifetimePlatform> {
	device: Arc<Device<P>>,
	capacity: u32,
	rings: Mutex<[PoolRing<QueryPool<P>>; 2]>,
}

impl<P: LifetimePlatform> QueryPoolManager<P> {
	pub fn new(device: Arc<Device<P>>, capacity: u32) -> Self {
		Self {
			device,
			capacity: capacity.max(1),
			rings: Mutex::new([PoolRing::new(), PoolRing::new()]),
		}
	}

	#[inline]
	pub fn capacity(&self) -> u32 {
		self.capacity
	}

	pub fn allocate(&self, ty: QueryType, count: u32) -> Result<Query<P>, QueryError<P>> {
		if count > self.capacity {
			error!(?ty, count, capacity = self.capacity, "query batch does not fit into a query pool");
			return Err(QueryError::ExceedsPoolCapacity {
				requested: count,
				capacity: self.capacity,
			});
		}
		let mut rings = self.rings.lock();
		let pool = rings[ty.to_usize()].acquire(count as u64, || self.create_pool(ty))?;
		let first = pool.next;
		pool.next += count;
		let results = Arc::new(QueryResults::default());
		pool.batches.push(QueryBatch {
			first,
			count,
			results: results.clone(),
		});
		Ok(Query {
			pool: pool.raw,
			ty,
			first,
			count,
			resource: pool.resource.clone(),
			results,
		})
	}

	fn create_pool(&self, ty: QueryType) -> Result<QueryPool<P>, QueryError<P>> {
		let raw = unsafe { self.device.create_query_pool(ty, self.capacity) }.map_err(|e| {
			error!(?ty, capacity = self.capacity, "failed to create query pool: {}", e);
			QueryError::Platform(e)
		})?;
		unsafe { self.device.reset_query_pool(raw, 0, self.capacity) };
		debug!(?raw, ?ty, capacity = self.capacity, "created query pool");
		Ok(QueryPool {
			raw,
			capacity: self.capacity,
			next: 0,
			resource: self.device.resources().create("query pool"),
			batches: Vec::new(),
		})
	}

	/// Fetch the results of every pool no command buffer captures anymore, then reset the pool for reuse. Returns
	/// the number of recycled pools.
	///
	/// Every command buffer that recorded into an uncaptured pool has retired or was discarded, so results are read
	/// without blocking. A batch whose results are unavailable was never executed and stays without results.
	pub fn update_render_queries(&self) -> Result<usize, QueryError<P>> {
		profiling::function_scope!();
		let mut rings = self.rings.lock();
		let mut recycled = 0;
		let mut first_err = None;
		for ring in rings.iter_mut() {
			match ring.update(|pool| self.collect_results(pool)) {
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

	fn collect_results(&self, pool: &mut QueryPool<P>) -> Result<bool, QueryError<P>> {
		// never captured in this cycle, nothing was recorded that could ever produce results
		if pool.resource.status() != ResourceStatus::Free {
			let mut unexecuted = 0;
			for batch in &pool.batches {
				let mut cell = batch.results.0.lock();
				if cell.is_some() {
					continue;
				}
				let mut values: QueryValues = smallvec![0; batch.count as usize];
				let available = unsafe { self.device.query_results(pool.raw, batch.first, &mut values, false) }
					.map_err(QueryError::Platform)?;
				if available {
					*cell = Some(values);
				} else {
					unexecuted += 1;
				}
			}
			if unexecuted > 0 {
				debug!(pool = ?pool.raw, unexecuted, "recycling query pool with batches that were never executed");
			}
		}

		unsafe { self.device.reset_query_pool(pool.raw, 0, pool.capacity) };
		pool.next = 0;
		pool.batches.clear();
		pool.resource = self.device.resources().create("query pool");
		Ok(true)
	}

	pub(crate) fn trim(&self, max_free: usize) -> Vec<(Resource, PendingDeletion<P>)> {
		let mut rings = self.rings.lock();
		rings
			.iter_mut()
			.flat_map(|ring| ring.trim(max_free).map(Self::into_deletion).collect::<Vec<_>>())
			.collect()
	}

	pub(crate) fn drain(&self) -> Vec<(Resource, PendingDeletion<P>)> {
		let mut rings = self.rings.lock();
		rings
			.iter_mut()
			.flat_map(|ring| ring.drain().map(Self::into_deletion).collect::<Vec<_>>())
			.collect()
	}

	fn into_deletion(pool: QueryPool<P>) -> (Resource, PendingDeletion<P>) {
		(pool.resource, PendingDeletion::QueryPool(pool.raw))
	}

	pub fn pool_count(&self, ty: QueryType) -> usize {
		self.rings.lock()[ty.to_usize()].len()
	}

	pub fn free_pool_count(&self, ty: QueryType) -> usize {
		self.rings.lock()[ty.to_usize()].free_len()
	}
}
