pub mod app;
pub mod catalog;
pub mod config;
pub mod domain;
pub mod enumerator;
pub mod error;
pub mod executor;
pub mod fs_util;
pub mod grouping;
pub mod merge;
pub mod output;
pub mod pool;
pub mod stage_log;
pub mod store;
pub mod tool;
pub mod transport;
