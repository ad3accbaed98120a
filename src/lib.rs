pub mod backend;
pub mod cache;
pub mod config;
pub mod datasets;
pub mod domain;
pub mod error;
pub mod export;
pub mod images;
pub mod labels;
pub mod output;
pub mod repository;
