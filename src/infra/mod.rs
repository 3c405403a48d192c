pub mod artifact;
pub mod memory;
pub mod web;
