pub mod chunk;
pub mod client;
pub mod config;
pub mod domain;
pub mod download;
pub mod error;
pub mod extract;
pub mod fs_util;
pub mod output;
pub mod pipeline;
pub mod reconcile;
pub mod retry;
pub mod state;
pub mod store;
pub mod submission;
