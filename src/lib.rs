#![deny(missing_docs)]
//! Oxide Vision
//!
//! A Telegram bot plugin that spots image links in chat, runs them through
//! Google Cloud Vision and replies with detected faces, safe-search
//! likelihoods and descriptive tags, within a daily call quota.

/// Telegram transport
pub mod bot;
/// Configuration management
pub mod config;
/// Image download and preparation
pub mod fetcher;
/// Chat rendering of annotation results
pub mod format;
/// Message-driven annotation pipeline
pub mod plugin;
/// Daily call counter
pub mod quota;
/// Key/value storage (R2/S3, file, memory)
pub mod storage;
/// Google Cloud Vision client
pub mod vision;
