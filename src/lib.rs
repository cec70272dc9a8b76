pub mod actions;
pub mod bar;
pub mod bus;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod fetch;
pub mod poller;
pub mod prefs;
pub mod realtime;
pub mod state;
pub mod types;
pub mod util;

#[cfg(test)]
pub mod test_utils;

pub use error::SyncError;
pub use state::Dashboard;
