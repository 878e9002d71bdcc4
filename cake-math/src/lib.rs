//! cake-math - Numerical kernels for caked diffraction data
//!
//! This crate holds the I/O-free algorithms used when mapping polar
//! (radial × azimuthal) histogram bins back onto detector pixels:
//!
//! - **Mesh interpolation** - piecewise-linear interpolation of scattered
//!   samples that come from a structured grid (one sample per detector
//!   pixel), located through a uniform bucket index
//!
//! # Example
//!
//! ```
//! use cake_math::MeshInterpolator;
//! use ndarray::Array2;
//!
//! // Sample positions laid out on a 3x3 grid
//! let u = Array2::from_shape_fn((3, 3), |(_, c)| c as f64);
//! let v = Array2::from_shape_fn((3, 3), |(r, _)| r as f64);
//! let mesh = MeshInterpolator::from_grid(u.view(), v.view(), None).unwrap();
//!
//! let values: Vec<f64> = u.iter().zip(v.iter()).map(|(a, b)| a + 10.0 * b).collect();
//! let at = mesh.interpolate(&values, 0.5, 1.5);
//! assert!((at - 15.5).abs() < 1e-12);
//! ```

pub mod mesh;

pub use mesh::{InterpolationError, MeshInterpolator};
