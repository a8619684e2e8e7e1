pub mod config;
pub mod downloader;
pub mod error;
pub mod feed;
pub mod filter;
pub mod models;
pub mod sanitize;
pub mod standard;
pub mod storage;
