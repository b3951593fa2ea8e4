pub mod automation;
#[cfg(feature = "browser")]
pub mod browser;
pub mod clock;
pub mod config;
pub mod credentials;
pub mod download;
pub mod duration;
pub mod history;
pub mod schedule;
pub mod sync;
