//! Error classification shared by every filesystem layer.
//!
//! Each crate defines its own `thiserror` error enum; all of them map onto
//! the stable [`ErrorKind`] taxonomy defined here so callers can handle
//! failures without matching on layer-specific variants.

mod kind;

pub use kind::ErrorKind;
