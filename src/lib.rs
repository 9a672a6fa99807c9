#![forbid(unsafe_code)]

//! Shared modules for the tubefetch backend binary.

pub mod captions;
pub mod config;
pub mod ytdlp;
