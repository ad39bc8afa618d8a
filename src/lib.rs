//! Inbox Assist: email triage and drafting that learns from your edits.

pub mod approval;
pub mod config;
pub mod error;
pub mod learning;
pub mod pipeline;
pub mod store;
