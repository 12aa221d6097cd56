//! Core domain types for the submission engine.
//!
//! This module contains pure domain types with no persistence dependencies:
//! - Work items, response records and milestone results
//! - The batch aggregate
//! - Submission profiles

pub mod batch;
pub mod item;
pub mod profile;
