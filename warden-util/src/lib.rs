pub mod backoff;
pub mod misc;
pub mod time;

pub use backoff::*;
pub use misc::*;
pub use time::*;
