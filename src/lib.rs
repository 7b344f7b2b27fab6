// src/lib.rs

pub mod hatchling;

pub use hatchling::session::Session;
