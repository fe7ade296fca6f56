pub mod config;
pub mod logging;

pub mod agenda;
pub mod compress;
pub mod download;
pub mod error;
pub mod mime;
pub mod path;
pub mod remote;
pub mod storage;
pub mod sync;
pub mod upload;
