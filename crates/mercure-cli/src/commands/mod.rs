//! Command implementations for mercure-cli

pub mod delta;
pub mod subscribe;
pub mod topic;
pub mod watch;

pub use delta::delta;
pub use subscribe::subscribe;
pub use topic::topic;
pub use watch::watch;
