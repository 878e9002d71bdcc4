//! Frame loading and orientation operations for raw detector images.
//!
//! # Module Organization
//!
//! - **io**: Decode grayscale TIFF/PNG frames into `Array2<f64>` and write
//!   16-bit frames back out
//! - **ops**: Flip/rotate operations applied to every frame, mask and
//!   correction image of a detector so they share its calibrated orientation

pub mod io;
pub mod ops;

pub use io::{load_frame, load_mask, save_u16_image};
pub use ops::{apply_ops, parse_ops, DataOp};
