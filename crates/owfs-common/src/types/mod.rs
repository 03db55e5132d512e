//! Type definitions for the 1-Wire filesystem.

mod ids;

pub use ids::{DeviceAddress, PageNumber};
