//! Shared leaf types for the sluice filter runtime.
//!
//! This crate holds the types every other sluice crate needs without
//! pulling in the runtime itself: the error taxonomy, four-character
//! codes used as property and capability keys, rational numbers for
//! exact timing, and the builtin stream-type classification.

pub mod error;
pub mod fourcc;
pub mod fraction;
pub mod stream;

pub use error::{Error, Result};
pub use fourcc::FourCC;
pub use fraction::{Fraction, Fraction64};
pub use stream::StreamType;
