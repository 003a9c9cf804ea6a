use bitflags::bitflags;
use smallvec::SmallVec;

bitflags! {
	/// Properties of a memory type, bit-compatible with `VkMemoryPropertyFlags`.
	#[repr(transparent)]
	#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
	pub struct MemoryPropertyFlags: u32 {
		const DEVICE_LOCAL = 0x1;
		const HOST_VISIBLE = 0x2;
		const HOST_COHERENT = 0x4;
		const HOST_CACHED = 0x8;
		const LAZILY_ALLOCATED = 0x10;
	}
}

impl MemoryPropertyFlags {
	#[inline]
	pub fn is_host_visible(&self) -> bool {
		self.contains(Self::HOST_VISIBLE)
	}
}

bitflags! {
	/// Pipeline stages a wait semaphore blocks, bit-compatible with `VkPipelineStageFlags`.
	#[repr(transparent)]
	#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
	pub struct PipelineStageFlags: u32 {
		const TOP_OF_PIPE = 0x1;
		const DRAW_INDIRECT = 0x2;
		const VERTEX_INPUT = 0x4;
		const VERTEX_SHADER = 0x8;
		const FRAGMENT_SHADER = 0x80;
		const EARLY_FRAGMENT_TESTS = 0x100;
		const LATE_FRAGMENT_TESTS = 0x200;
		const COLOR_ATTACHMENT_OUTPUT = 0x400;
		const COMPUTE_SHADER = 0x800;
		const TRANSFER = 0x1000;
		const BOTTOM_OF_PIPE = 0x2000;
		const ALL_COMMANDS = 0x10000;
	}
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryType {
	pub property_flags: MemoryPropertyFlags,
	pub heap_index: u32,
}

#[derive(Clone, Debug)]
pub struct MemoryProperties {
	pub memory_types: SmallVec<[MemoryType; 32]>,
	/// Smallest granularity a mapped sub-range may be split into. Free remainders smaller than this are handed out
	/// together with the allocation instead of being kept as unusable slivers.
	pub min_memory_map_alignment: u64,
}

impl MemoryProperties {
	/// Index of the first memory type allowed by `memory_type_bits` that has at least `property_flags`.
	pub fn find_memory_type_index(&self, memory_type_bits: u32, property_flags: MemoryPropertyFlags) -> Option<u32> {
		self.memory_types
			.iter()
			.enumerate()
			.take(32)
			.find(|(i, ty)| memory_type_bits & (1 << i) != 0 && ty.property_flags.contains(property_flags))
			.map(|(i, _)| i as u32)
	}

	#[inline]
	pub fn property_flags(&self, memory_type_index: u32) -> MemoryPropertyFlags {
		self.memory_types
			.get(memory_type_index as usize)
			.map_or(MemoryPropertyFlags::empty(), |ty| ty.property_flags)
	}
}

/// The submission category a command buffer is recorded for. Every target has its own
/// [`CommandBufferManager`](crate::command::CommandBufferManager) and backing command pool.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum CommandTarget {
	Draw,
	Upload,
	Transition,
}

impl CommandTarget {
	pub const ALL: [CommandTarget; 3] = [CommandTarget::Draw, CommandTarget::Upload, CommandTarget::Transition];

	#[inline]
	pub fn to_usize(&self) -> usize {
		*self as usize
	}
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum CommandBufferLevel {
	Primary,
	Secondary,
}

impl CommandBufferLevel {
	#[inline]
	pub fn to_usize(&self) -> usize {
		*self as usize
	}
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum QueryType {
	Timestamp,
	Occlusion,
}

impl QueryType {
	pub const ALL: [QueryType; 2] = [QueryType::Timestamp, QueryType::Occlusion];

	#[inline]
	pub fn to_usize(&self) -> usize {
		*self as usize
	}
}

/// Descriptor counts of a single set. A descriptor pool reserves these counts `max_sets` times.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DescriptorPoolSizes {
	pub uniform_buffers: u32,
	pub storage_buffers: u32,
	pub sampled_images: u32,
	pub storage_images: u32,
	pub samplers: u32,
	pub combined_image_samplers: u32,
}

impl DescriptorPoolSizes {
	pub const REASONABLE_DEFAULTS: Self = Self {
		uniform_buffers: 4,
		storage_buffers: 4,
		sampled_images: 8,
		storage_images: 2,
		samplers: 4,
		combined_image_samplers: 8,
	};
}

impl Default for DescriptorPoolSizes {
	fn default() -> Self {
		Self::REASONABLE_DEFAULTS
	}
}
