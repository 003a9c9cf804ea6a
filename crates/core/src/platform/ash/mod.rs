mod ash_ext;
pub mod init;
mod platform;

pub use ash_ext::*;
pub use init::*;
pub use platform::*;
