#[cfg(feature = "ash")]
pub mod ash;
pub mod headless;
mod lifetime;
mod types;

pub use lifetime::*;
pub use types::*;
