pub mod inflight;
pub mod stability;

mod watch;

pub use inflight::InFlightSet;
pub use stability::{probe, Probe};
pub use watch::DirectoryWatcher;
