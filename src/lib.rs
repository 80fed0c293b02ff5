#[macro_use]
mod text_enum;

pub mod analyzer;
pub mod cache;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod guidance;
pub mod job;
pub mod materializer;
pub mod models;
pub mod outline;
pub mod outline_generator;
pub mod payloads;
pub mod pipeline;
pub mod provider;
pub mod routes;
pub mod storage;

pub use text_enum::UnknownVariant;
