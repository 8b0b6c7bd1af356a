pub mod archive;
pub mod audit;
pub mod batches;
pub mod config;
pub mod extract;
pub mod identity;
pub mod ledger;
pub mod paths;
pub mod pool;
pub mod stages;
pub mod util;
pub mod wait;
pub mod warn;
pub mod watcher;

include!(concat!(env!("OUT_DIR"), "/archivist_env_allowlist.rs"));
