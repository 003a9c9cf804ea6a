use crate::platform::LifetimePlatform;
use crate::resource::ResourceTable;
use crossbeam_utils::CachePadded;
use std::ops::Deref;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed};
use std::sync::atomic::{AtomicU32, AtomicU64};
use std::sync::Arc;

/// The platform together with the state every manager needs to share: the resource table and the frame counter.
///
/// Frames are counted from 1, a frame index of 0 is a placeholder for "the current frame".
pub struct Device<P: LifetimePlatform> {
	pub platform: P,
	resources: Arc<ResourceTable>,
	frame: CachePadded<AtomicU64>,
	window_bypasses: AtomicU32,
	swapchain_image_count: u64,
}

impl<P: LifetimePlatform> Deref for Device<P> {
	type Target = P;

	fn deref(&self) -> &Self::Target {
		&self.platform
	}
}

impl<P: LifetimePlatform> Device<P> {
	pub fn new(platform: P, swapchain_image_count: u32) -> Arc<Self> {
		Arc::new(Self {
			platform,
			resources: ResourceTable::new(),
			frame: CachePadded::new(AtomicU64::new(1)),
			window_bypasses: AtomicU32::new(0),
			swapchain_image_count: swapchain_image_count as u64,
		})
	}

	#[inline]
	pub fn resources(&self) -> &Arc<ResourceTable> {
		&self.resources
	}

	#[inline]
	pub fn frame(&self) -> u64 {
		self.frame.load(Relaxed)
	}

	/// Substitutes the current frame for the placeholder frame 0.
	#[inline]
	pub fn resolve_frame(&self, frame: u64) -> u64 {
		if frame == 0 {
			self.frame()
		} else {
			frame
		}
	}

	/// Advance to the next frame, returns the new frame index.
	pub fn advance_frame(&self) -> u64 {
		self.frame.fetch_add(1, Relaxed) + 1
	}

	/// Let every completed submission count as safe while the returned guard is alive, for when the GPU is known to
	/// be idle. The frame counter itself is untouched, so concurrent captures still record the current frame.
	pub(crate) fn bypass_pipelining_window(&self) -> WindowBypass<'_, P> {
		self.window_bypasses.fetch_add(1, AcqRel);
		WindowBypass { device: self }
	}

	/// The frame submissions are checked against for retirement, `u64::MAX` while the window is bypassed.
	#[inline]
	pub fn retirement_frame(&self) -> u64 {
		if self.window_bypasses.load(Acquire) > 0 {
			u64::MAX
		} else {
			self.frame()
		}
	}

	#[inline]
	pub fn swapchain_image_count(&self) -> u64 {
		self.swapchain_image_count
	}

	/// Work captured in `captured_frame` may be reused in `frame` if the entire frame-pipelining window has passed.
	#[inline]
	pub fn is_safe_frame(&self, captured_frame: u64, frame: u64) -> bool {
		captured_frame.saturating_add(self.swapchain_image_count) < frame
	}
}

pub(crate) struct WindowBypass<'a, P: LifetimePlatform> {
	device: &'a Device<P>,
}

impl<P: LifetimePlatform> Drop for WindowBypass<'_, P> {
	fn drop(&mut self) {
		self.device.window_bypasses.fetch_sub(1, AcqRel);
	}
}
