//! A backend without any GPU: memory is host memory, and submitted work "executes" whenever a fence is waited upon,
//! [`Headless::complete_all`] is called or `auto_complete` is enabled. Used to drive the lifetime machinery in tests.

use crate::platform::{
	CommandBufferLevel, CommandTarget, DescriptorPoolSizes, LifetimePlatform, MemoryProperties, MemoryPropertyFlags,
	MemoryType, PipelineStageFlags, QueryType,
};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::{smallvec, SmallVec};
use std::convert::Infallible;
use std::fmt::{Debug, Formatter};
use std::ptr::NonNull;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::Relaxed;
use thiserror::Error;

macro_rules! headless_handle {
	($($name:ident),* $(,)?) => {
		$(
			#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
			pub struct $name(u64);

			impl Debug for $name {
				fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
					write!(f, concat!(stringify!($name), "({})"), self.0)
				}
			}
		)*
	};
}

headless_handle!(
	HeadlessMemory,
	HeadlessFence,
	HeadlessSemaphore,
	HeadlessCommandPool,
	HeadlessCommandBuffer,
	HeadlessDescriptorPool,
	HeadlessDescriptorSetLayout,
	HeadlessDescriptorSet,
	HeadlessQueryPool,
);

impl HeadlessDescriptorSetLayout {
	/// Layouts are not backend objects in headless, any value is a valid layout.
	pub const fn new(id: u64) -> Self {
		Self(id)
	}
}

pub struct HeadlessCreateInfo {
	pub memory_types: SmallVec<[MemoryType; 32]>,
	pub min_memory_map_alignment: u64,
	/// Signal fences immediately on submission, as if the GPU was infinitely fast.
	pub auto_complete: bool,
	/// Total bytes of device memory that may be allocated, `None` for unlimited.
	pub memory_budget: Option<u64>,
}

impl HeadlessCreateInfo {
	pub const MEMORY_TYPE_DEVICE: u32 = 0;
	pub const MEMORY_TYPE_UPLOAD: u32 = 1;
	pub const MEMORY_TYPE_READBACK: u32 = 2;
	pub const MEMORY_TYPE_DEVICE_MAPPED: u32 = 3;
}

impl Default for HeadlessCreateInfo {
	fn default() -> Self {
		let ty = |property_flags| MemoryType {
			property_flags,
			heap_index: 0,
		};
		Self {
			memory_types: smallvec![
				ty(MemoryPropertyFlags::DEVICE_LOCAL),
				ty(MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT),
				ty(MemoryPropertyFlags::HOST_VISIBLE
					| MemoryPropertyFlags::HOST_COHERENT
					| MemoryPropertyFlags::HOST_CACHED),
				ty(MemoryPropertyFlags::DEVICE_LOCAL
					| MemoryPropertyFlags::HOST_VISIBLE
					| MemoryPropertyFlags::HOST_COHERENT),
			],
			min_memory_map_alignment: 64,
			auto_complete: false,
			memory_budget: None,
		}
	}
}

#[derive(Error)]
pub enum HeadlessError {
	#[error("Out of device memory: requested {requested} bytes with {available} bytes left in budget")]
	OutOfDeviceMemory { requested: u64, available: u64 },
	#[error("Memory {0:?} is not host visible")]
	NotHostVisible(HeadlessMemory),
	#[error("Memory {0:?} is already mapped")]
	AlreadyMapped(HeadlessMemory),
	#[error("Mapped range {offset}..{end} exceeds allocation size {size}")]
	MapOutOfBounds { offset: u64, end: u64, size: u64 },
	#[error("Unknown {0} handle")]
	UnknownHandle(&'static str),
	#[error("Command buffer {0:?} is not recording")]
	NotRecording(HeadlessCommandBuffer),
}

impl Debug for HeadlessError {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		std::fmt::Display::fmt(self, f)
	}
}

/// Counts of live backend objects, to detect leaks.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct HeadlessObjectCounts {
	pub memory: usize,
	pub memory_bytes: u64,
	pub fences: usize,
	pub semaphores: usize,
	pub command_pools: usize,
	pub command_buffers: usize,
	pub descriptor_pools: usize,
	pub query_pools: usize,
}

#[derive(Clone, Debug)]
pub struct HeadlessSubmission {
	pub target: CommandTarget,
	pub wait_semaphores: Vec<(HeadlessSemaphore, PipelineStageFlags)>,
	pub signal_semaphores: Vec<HeadlessSemaphore>,
	pub fence: HeadlessFence,
}

pub struct Headless {
	memory_properties: MemoryProperties,
	auto_complete: AtomicBool,
	stalled: AtomicBool,
	state: Mutex<HeadlessState>,
}

#[derive(Default)]
struct HeadlessState {
	next_handle: u64,
	memory_budget: Option<u64>,
	memory_used: u64,
	memory: FxHashMap<HeadlessMemory, MemoryBlock>,
	fences: FxHashMap<HeadlessFence, FenceState>,
	semaphores: FxHashSet<HeadlessSemaphore>,
	command_pools: FxHashMap<HeadlessCommandPool, CommandTarget>,
	command_buffers: FxHashMap<HeadlessCommandBuffer, RecordedCommands>,
	descriptor_pools: FxHashMap<HeadlessDescriptorPool, DescriptorPoolState>,
	query_pools: FxHashMap<HeadlessQueryPool, QueryPoolState>,
	in_flight: Vec<InFlight>,
	submissions: Vec<HeadlessSubmission>,
	timestamp: u64,
}

struct MemoryBlock {
	data: Box<[u8]>,
	host_visible: bool,
	mapped: bool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum FenceState {
	Unsignaled,
	Pending,
	Signaled,
}

struct RecordedCommands {
	pool: HeadlessCommandPool,
	recording: bool,
	commands: Vec<Command>,
}

#[derive(Copy, Clone, Debug)]
enum Command {
	ResetQueries {
		pool: HeadlessQueryPool,
		first: u32,
		count: u32,
	},
	WriteQuery {
		pool: HeadlessQueryPool,
		query: u32,
	},
}

struct DescriptorPoolState {
	max_sets: u32,
	allocated: u32,
}

struct QueryPoolState {
	ty: QueryType,
	results: Vec<Option<u64>>,
}

struct InFlight {
	fence: HeadlessFence,
	commands: Vec<Command>,
}

impl HeadlessState {
	fn next_handle(&mut self) -> u64 {
		self.next_handle += 1;
		self.next_handle
	}

	/// The "GPU" executes the work guarded by `fence`.
	fn complete(&mut self, fence: HeadlessFence) {
		let mut i = 0;
		while i < self.in_flight.len() {
			if self.in_flight[i].fence == fence {
				let in_flight = self.in_flight.remove(i);
				for command in in_flight.commands {
					self.execute(command);
				}
			} else {
				i += 1;
			}
		}
		if let Some(state) = self.fences.get_mut(&fence) {
			*state = FenceState::Signaled;
		}
	}

	fn complete_all(&mut self) {
		let fences = self.in_flight.iter().map(|i| i.fence).collect::<SmallVec<[_; 8]>>();
		for fence in fences {
			self.complete(fence);
		}
	}

	fn execute(&mut self, command: Command) {
		self.timestamp += 1;
		let timestamp = self.timestamp;
		match command {
			Command::ResetQueries { pool, first, count } => {
				if let Some(pool) = self.query_pools.get_mut(&pool) {
					let end = (first + count) as usize;
					pool.results[first as usize..end].fill(None);
				}
			}
			Command::WriteQuery { pool, query } => {
				if let Some(pool) = self.query_pools.get_mut(&pool) {
					pool.results[query as usize] = Some(match pool.ty {
						QueryType::Timestamp => timestamp,
						QueryType::Occlusion => 1,
					});
				}
			}
		}
	}

	fn record(&mut self, cmd: HeadlessCommandBuffer, command: Command) {
		match self.command_buffers.get_mut(&cmd) {
			Some(recorded) if recorded.recording => recorded.commands.push(command),
			_ => panic!("{:?} is not recording", cmd),
		}
	}
}

impl Headless {
	pub fn new(create_info: HeadlessCreateInfo) -> Self {
		Self {
			memory_properties: MemoryProperties {
				memory_types: create_info.memory_types,
				min_memory_map_alignment: create_info.min_memory_map_alignment,
			},
			auto_complete: AtomicBool::new(create_info.auto_complete),
			stalled: AtomicBool::new(false),
			state: Mutex::new(HeadlessState {
				memory_budget: create_info.memory_budget,
				..HeadlessState::default()
			}),
		}
	}

	/// Signal every fence of submitted work.
	pub fn complete_all(&self) {
		self.state.lock().complete_all();
	}

	/// While stalled, submitted work never completes on its own and fence waits time out.
	pub fn set_stalled(&self, stalled: bool) {
		self.stalled.store(stalled, Relaxed);
	}

	pub fn set_auto_complete(&self, auto_complete: bool) {
		self.auto_complete.store(auto_complete, Relaxed);
	}

	pub fn set_memory_budget(&self, budget: Option<u64>) {
		self.state.lock().memory_budget = budget;
	}

	pub fn object_counts(&self) -> HeadlessObjectCounts {
		let state = self.state.lock();
		HeadlessObjectCounts {
			memory: state.memory.len(),
			memory_bytes: state.memory_used,
			fences: state.fences.len(),
			semaphores: state.semaphores.len(),
			command_pools: state.command_pools.len(),
			command_buffers: state.command_buffers.len(),
			descriptor_pools: state.descriptor_pools.len(),
			query_pools: state.query_pools.len(),
		}
	}

	pub fn submissions(&self) -> Vec<HeadlessSubmission> {
		self.state.lock().submissions.clone()
	}

	/// Read back host memory, as a test would read back a mapped buffer.
	pub fn read_memory(&self, memory: HeadlessMemory, offset: u64, len: usize) -> Option<Vec<u8>> {
		let state = self.state.lock();
		let block = state.memory.get(&memory)?;
		let start = usize::try_from(offset).ok()?;
		block.data.get(start..start.checked_add(len)?).map(<[u8]>::to_vec)
	}
}

unsafe impl LifetimePlatform for Headless {
	type PlatformCreateInfo = HeadlessCreateInfo;
	type PlatformCreateError = Infallible;
	type Error = HeadlessError;
	type DeviceMemory = HeadlessMemory;
	type Fence = HeadlessFence;
	type Semaphore = HeadlessSemaphore;
	type CommandPool = HeadlessCommandPool;
	type CommandBuffer = HeadlessCommandBuffer;
	type DescriptorPool = HeadlessDescriptorPool;
	type DescriptorSetLayout = HeadlessDescriptorSetLayout;
	type DescriptorSet = HeadlessDescriptorSet;
	type QueryPool = HeadlessQueryPool;

	unsafe fn create_platform(create_info: Self::PlatformCreateInfo) -> Result<Self, Self::PlatformCreateError> {
		Ok(Self::new(create_info))
	}

	fn memory_properties(&self) -> &MemoryProperties {
		&self.memory_properties
	}

	unsafe fn device_wait_idle(&self) -> Result<(), Self::Error> {
		self.complete_all();
		Ok(())
	}

	unsafe fn allocate_memory(&self, size: u64, memory_type_index: u32) -> Result<Self::DeviceMemory, Self::Error> {
		let host_visible = self
			.memory_properties
			.property_flags(memory_type_index)
			.is_host_visible();
		let mut state = self.state.lock();
		if let Some(budget) = state.memory_budget {
			let available = budget.saturating_sub(state.memory_used);
			if size > available {
				return Err(HeadlessError::OutOfDeviceMemory {
					requested: size,
					available,
				});
			}
		}
		let len = usize::try_from(size).map_err(|_| HeadlessError::OutOfDeviceMemory {
			requested: size,
			available: usize::MAX as u64,
		})?;
		let memory = HeadlessMemory(state.next_handle());
		state.memory.insert(
			memory,
			MemoryBlock {
				data: vec![0; len].into_boxed_slice(),
				host_visible,
				mapped: false,
			},
		);
		state.memory_used += size;
		Ok(memory)
	}

	unsafe fn free_memory(&self, memory: Self::DeviceMemory) {
		let mut state = self.state.lock();
		let block = state.memory.remove(&memory).expect("free of unknown memory");
		state.memory_used -= block.data.len() as u64;
	}

	unsafe fn map_memory(&self, memory: Self::DeviceMemory, offset: u64, size: u64) -> Result<NonNull<u8>, Self::Error> {
		let mut state = self.state.lock();
		let block = state
			.memory
			.get_mut(&memory)
			.ok_or(HeadlessError::UnknownHandle("memory"))?;
		let end = offset + size;
		if end > block.data.len() as u64 {
			return Err(HeadlessError::MapOutOfBounds {
				offset,
				end,
				size: block.data.len() as u64,
			});
		}
		if !block.host_visible {
			return Err(HeadlessError::NotHostVisible(memory));
		}
		if block.mapped {
			return Err(HeadlessError::AlreadyMapped(memory));
		}
		block.mapped = true;
		// Safety: offset is within bounds, the boxed slice never moves while the block is alive
		unsafe { Ok(NonNull::new_unchecked(block.data.as_mut_ptr().add(offset as usize))) }
	}

	unsafe fn unmap_memory(&self, memory: Self::DeviceMemory) {
		if let Some(block) = self.state.lock().memory.get_mut(&memory) {
			block.mapped = false;
		}
	}

	unsafe fn create_fence(&self) -> Result<Self::Fence, Self::Error> {
		let mut state = self.state.lock();
		let fence = HeadlessFence(state.next_handle());
		state.fences.insert(fence, FenceState::Unsignaled);
		Ok(fence)
	}

	unsafe fn destroy_fence(&self, fence: Self::Fence) {
		self.state.lock().fences.remove(&fence);
	}

	unsafe fn fence_status(&self, fence: Self::Fence) -> Result<bool, Self::Error> {
		let state = self.state.lock();
		match state.fences.get(&fence) {
			Some(state) => Ok(*state == FenceState::Signaled),
			None => Err(HeadlessError::UnknownHandle("fence")),
		}
	}

	unsafe fn wait_fence(&self, fence: Self::Fence, _timeout_ns: u64) -> Result<bool, Self::Error> {
		let mut state = self.state.lock();
		match state.fences.get(&fence).copied() {
			None => Err(HeadlessError::UnknownHandle("fence")),
			Some(FenceState::Signaled) => Ok(true),
			// never submitted, a real device would block until the timeout
			Some(FenceState::Unsignaled) => Ok(false),
			Some(FenceState::Pending) => {
				if self.stalled.load(Relaxed) {
					Ok(false)
				} else {
					state.complete(fence);
					Ok(true)
				}
			}
		}
	}

	unsafe fn reset_fence(&self, fence: Self::Fence) -> Result<(), Self::Error> {
		let mut state = self.state.lock();
		let fence = state
			.fences
			.get_mut(&fence)
			.ok_or(HeadlessError::UnknownHandle("fence"))?;
		*fence = FenceState::Unsignaled;
		Ok(())
	}

	unsafe fn create_semaphore(&self) -> Result<Self::Semaphore, Self::Error> {
		let mut state = self.state.lock();
		let semaphore = HeadlessSemaphore(state.next_handle());
		state.semaphores.insert(semaphore);
		Ok(semaphore)
	}

	unsafe fn destroy_semaphore(&self, semaphore: Self::Semaphore) {
		self.state.lock().semaphores.remove(&semaphore);
	}

	unsafe fn create_command_pool(&self, target: CommandTarget) -> Result<Self::CommandPool, Self::Error> {
		let mut state = self.state.lock();
		let pool = HeadlessCommandPool(state.next_handle());
		state.command_pools.insert(pool, target);
		Ok(pool)
	}

	unsafe fn reset_command_pool(&self, pool: Self::CommandPool) -> Result<(), Self::Error> {
		let mut state = self.state.lock();
		for recorded in state.command_buffers.values_mut().filter(|r| r.pool == pool) {
			recorded.recording = false;
			recorded.commands.clear();
		}
		Ok(())
	}

	unsafe fn destroy_command_pool(&self, pool: Self::CommandPool) {
		let mut state = self.state.lock();
		state.command_buffers.retain(|_, recorded| recorded.pool != pool);
		state.command_pools.remove(&pool);
	}

	unsafe fn allocate_command_buffer(
		&self,
		pool: Self::CommandPool,
		_level: CommandBufferLevel,
	) -> Result<Self::CommandBuffer, Self::Error> {
		let mut state = self.state.lock();
		if !state.command_pools.contains_key(&pool) {
			return Err(HeadlessError::UnknownHandle("command pool"));
		}
		let cmd = HeadlessCommandBuffer(state.next_handle());
		state.command_buffers.insert(
			cmd,
			RecordedCommands {
				pool,
				recording: false,
				commands: Vec::new(),
			},
		);
		Ok(cmd)
	}

	unsafe fn free_command_buffer(&self, _pool: Self::CommandPool, cmd: Self::CommandBuffer) {
		self.state.lock().command_buffers.remove(&cmd);
	}

	unsafe fn reset_command_buffer(&self, cmd: Self::CommandBuffer) -> Result<(), Self::Error> {
		let mut state = self.state.lock();
		let recorded = state
			.command_buffers
			.get_mut(&cmd)
			.ok_or(HeadlessError::UnknownHandle("command buffer"))?;
		recorded.recording = false;
		recorded.commands.clear();
		Ok(())
	}

	unsafe fn begin_command_buffer(
		&self,
		cmd: Self::CommandBuffer,
		_level: CommandBufferLevel,
	) -> Result<(), Self::Error> {
		let mut state = self.state.lock();
		let recorded = state
			.command_buffers
			.get_mut(&cmd)
			.ok_or(HeadlessError::UnknownHandle("command buffer"))?;
		recorded.recording = true;
		recorded.commands.clear();
		Ok(())
	}

	unsafe fn end_command_buffer(&self, cmd: Self::CommandBuffer) -> Result<(), Self::Error> {
		let mut state = self.state.lock();
		let recorded = state
			.command_buffers
			.get_mut(&cmd)
			.ok_or(HeadlessError::UnknownHandle("command buffer"))?;
		if !recorded.recording {
			return Err(HeadlessError::NotRecording(cmd));
		}
		recorded.recording = false;
		Ok(())
	}

	unsafe fn cmd_execute_commands(&self, cmd: Self::CommandBuffer, secondaries: &[Self::CommandBuffer]) {
		let mut state = self.state.lock();
		let commands = secondaries
			.iter()
			.filter_map(|s| state.command_buffers.get(s))
			.flat_map(|recorded| recorded.commands.iter().copied())
			.collect::<Vec<_>>();
		for command in commands {
			state.record(cmd, command);
		}
	}

	unsafe fn submit(
		&self,
		target: CommandTarget,
		cmd: Self::CommandBuffer,
		wait_semaphores: &[(Self::Semaphore, PipelineStageFlags)],
		signal_semaphores: &[Self::Semaphore],
		fence: Self::Fence,
	) -> Result<(), Self::Error> {
		let mut state = self.state.lock();
		let commands = state
			.command_buffers
			.get(&cmd)
			.ok_or(HeadlessError::UnknownHandle("command buffer"))?
			.commands
			.clone();
		let fence_state = state
			.fences
			.get_mut(&fence)
			.ok_or(HeadlessError::UnknownHandle("fence"))?;
		*fence_state = FenceState::Pending;
		state.in_flight.push(InFlight { fence, commands });
		state.submissions.push(HeadlessSubmission {
			target,
			wait_semaphores: wait_semaphores.to_vec(),
			signal_semaphores: signal_semaphores.to_vec(),
			fence,
		});
		if self.auto_complete.load(Relaxed) && !self.stalled.load(Relaxed) {
			state.complete(fence);
		}
		Ok(())
	}

	unsafe fn create_descriptor_pool(
		&self,
		_sizes: &DescriptorPoolSizes,
		max_sets: u32,
	) -> Result<Self::DescriptorPool, Self::Error> {
		let mut state = self.state.lock();
		let pool = HeadlessDescriptorPool(state.next_handle());
		state.descriptor_pools.insert(
			pool,
			DescriptorPoolState {
				max_sets,
				allocated: 0,
			},
		);
		Ok(pool)
	}

	unsafe fn allocate_descriptor_set(
		&self,
		pool: Self::DescriptorPool,
		_layout: Self::DescriptorSetLayout,
	) -> Result<Option<Self::DescriptorSet>, Self::Error> {
		let mut state = self.state.lock();
		let handle = state.next_handle();
		let pool = state
			.descriptor_pools
			.get_mut(&pool)
			.ok_or(HeadlessError::UnknownHandle("descriptor pool"))?;
		if pool.allocated < pool.max_sets {
			pool.allocated += 1;
			Ok(Some(HeadlessDescriptorSet(handle)))
		} else {
			Ok(None)
		}
	}

	unsafe fn reset_descriptor_pool(&self, pool: Self::DescriptorPool) -> Result<(), Self::Error> {
		let mut state = self.state.lock();
		let pool = state
			.descriptor_pools
			.get_mut(&pool)
			.ok_or(HeadlessError::UnknownHandle("descriptor pool"))?;
		pool.allocated = 0;
		Ok(())
	}

	unsafe fn destroy_descriptor_pool(&self, pool: Self::DescriptorPool) {
		self.state.lock().descriptor_pools.remove(&pool);
	}

	unsafe fn create_query_pool(&self, ty: QueryType, count: u32) -> Result<Self::QueryPool, Self::Error> {
		let mut state = self.state.lock();
		let pool = HeadlessQueryPool(state.next_handle());
		state.query_pools.insert(
			pool,
			QueryPoolState {
				ty,
				results: vec![None; count as usize],
			},
		);
		Ok(pool)
	}

	unsafe fn reset_query_pool(&self, pool: Self::QueryPool, first: u32, count: u32) {
		self.state.lock().execute(Command::ResetQueries { pool, first, count });
	}

	unsafe fn destroy_query_pool(&self, pool: Self::QueryPool) {
		self.state.lock().query_pools.remove(&pool);
	}

	unsafe fn cmd_reset_query_pool(&self, cmd: Self::CommandBuffer, pool: Self::QueryPool, first: u32, count: u32) {
		self.state
			.lock()
			.record(cmd, Command::ResetQueries { pool, first, count });
	}

	unsafe fn cmd_begin_query(&self, _cmd: Self::CommandBuffer, _pool: Self::QueryPool, _query: u32) {}

	unsafe fn cmd_end_query(&self, cmd: Self::CommandBuffer, pool: Self::QueryPool, query: u32) {
		self.state.lock().record(cmd, Command::WriteQuery { pool, query });
	}

	unsafe fn cmd_write_timestamp(
		&self,
		cmd: Self::CommandBuffer,
		_stage: PipelineStageFlags,
		pool: Self::QueryPool,
		query: u32,
	) {
		self.state.lock().record(cmd, Command::WriteQuery { pool, query });
	}

	unsafe fn query_results(
		&self,
		pool: Self::QueryPool,
		first: u32,
		out: &mut [u64],
		wait: bool,
	) -> Result<bool, Self::Error> {
		let mut state = self.state.lock();
		if wait && !self.stalled.load(Relaxed) {
			state.complete_all();
		}
		let pool = state
			.query_pools
			.get(&pool)
			.ok_or(HeadlessError::UnknownHandle("query pool"))?;
		let results = &pool.results[first as usize..first as usize + out.len()];
		if results.iter().all(Option::is_some) {
			for (out, result) in out.iter_mut().zip(results) {
				*out = result.unwrap_or_default();
			}
			Ok(true)
		} else {
			Ok(false)
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn fence_completes_on_wait() -> anyhow::Result<()> {
		unsafe {
			let headless = Headless::new(HeadlessCreateInfo::default());
			let pool = headless.create_command_pool(CommandTarget::Draw)?;
			let cmd = headless.allocate_command_buffer(pool, CommandBufferLevel::Primary)?;
			let fence = headless.create_fence()?;
			headless.begin_command_buffer(cmd, CommandBufferLevel::Primary)?;
			headless.end_command_buffer(cmd)?;
			headless.submit(CommandTarget::Draw, cmd, &[], &[], fence)?;

			assert!(!headless.fence_status(fence)?);
			headless.set_stalled(true);
			assert!(!headless.wait_fence(fence, 0)?);
			headless.set_stalled(false);
			assert!(headless.wait_fence(fence, 0)?);
			assert!(headless.fence_status(fence)?);
			Ok(())
		}
	}

	#[test]
	fn memory_budget() -> anyhow::Result<()> {
		unsafe {
			let headless = Headless::new(HeadlessCreateInfo {
				memory_budget: Some(1024),
				..HeadlessCreateInfo::default()
			});
			let a = headless.allocate_memory(1000, 0)?;
			assert!(matches!(
				headless.allocate_memory(100, 0),
				Err(HeadlessError::OutOfDeviceMemory { .. })
			));
			headless.free_memory(a);
			let b = headless.allocate_memory(100, 0)?;
			assert_eq!(headless.object_counts().memory_bytes, 100);
			headless.free_memory(b);
			Ok(())
		}
	}
}
