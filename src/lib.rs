#![deny(unsafe_op_in_unsafe_fn)]
#![doc = include_str!("../README.md")]

mod cfg;
mod raw;
mod registry;
mod size;
mod tree;

pub use registry::RegistryError;
pub use seize::Collector;
pub use tree::{Handle, Iter, SizeBst, SizeBstBuilder};
