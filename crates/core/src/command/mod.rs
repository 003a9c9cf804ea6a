mod buffer;
mod manager;
mod semaphore;

pub use buffer::*;
pub use manager::*;
pub use semaphore::*;

use crate::backing::arena::ArenaId;
use crate::platform::{CommandBufferLevel, CommandTarget, LifetimePlatform};
use std::fmt::{Debug, Display, Formatter};
use thiserror::Error;

/// Identifies a command buffer across all [`CommandBufferManager`]s.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct CommandBufferId {
	target: CommandTarget,
	id: ArenaId,
}

impl CommandBufferId {
	#[inline]
	pub(crate) fn new(target: CommandTarget, id: ArenaId) -> Self {
		Self { target, id }
	}

	#[inline]
	pub fn target(&self) -> CommandTarget {
		self.target
	}

	#[inline]
	pub(crate) fn arena_id(&self) -> ArenaId {
		self.id
	}
}

impl Debug for CommandBufferId {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "{:?}#{:?}", self.target, self.id)
	}
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CommandBufferState {
	/// A backend operation failed, the command buffer can not be used anymore.
	Invalid,
	Ready,
	Begin { inside_render_pass: bool },
	End,
	Submitted { frame: u64 },
	Finished,
}

/// Where a recorded command may be placed relative to a render pass.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RenderPassScope {
	Any,
	Inside,
	Outside,
}

impl Display for RenderPassScope {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			RenderPassScope::Any => f.write_str("anywhere"),
			RenderPassScope::Inside => f.write_str("inside"),
			RenderPassScope::Outside => f.write_str("outside"),
		}
	}
}

#[derive(Error)]
#[non_exhaustive]
pub enum CommandBufferError<P: LifetimePlatform> {
	#[error("Platform Error: {0}")]
	Platform(#[source] P::Error),
	#[error("Command buffer {id:?} is {found:?}, but this operation requires it to be {expected}")]
	InvalidState {
		id: CommandBufferId,
		expected: &'static str,
		found: CommandBufferState,
	},
	#[error("Command buffer {id:?} is {level:?}, but this operation requires a {expected:?} command buffer")]
	WrongLevel {
		id: CommandBufferId,
		level: CommandBufferLevel,
		expected: CommandBufferLevel,
	},
	#[error("Command buffer {id:?}: command must be recorded {scope} of a render pass")]
	RenderPassScope { id: CommandBufferId, scope: RenderPassScope },
	#[error("Secondary command buffer {0:?} is already attached to another primary command buffer")]
	AlreadyAttached(CommandBufferId),
	#[error("Command buffer {id:?} belongs to {actual:?}, not to {target:?}")]
	WrongTarget {
		id: CommandBufferId,
		target: CommandTarget,
		actual: CommandTarget,
	},
	#[error("{count} command buffers of {target:?} are still outstanding")]
	Outstanding { target: CommandTarget, count: usize },
}

impl<P: LifetimePlatform> Debug for CommandBufferError<P> {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		Display::fmt(self, f)
	}
}
