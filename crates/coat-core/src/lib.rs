//! # coat-core
//!
//! Core numeric primitives for the COAT FP8 training engine.
//!
//! This crate provides:
//! - [`Tensor`] — dense n-dimensional array with shared, in-place-updatable storage
//! - [`Shape`] — shape, strides and broadcasting rules
//! - [`DType`] — element precisions (F64, F32, F16, BF16, F8E4M3, F8E5M2)
//! - [`Fp8Format`] — the software E4M3 / E5M2 codec, plus [`F8E4M3`] / [`F8E5M2`] scalars
//! - [`NumericCapabilities`] — whether FP8 storage is enabled or falls back to bfloat16
//! - [`Error`] / [`Result`] — the error type shared by every COAT crate

pub mod capability;
pub mod dtype;
pub mod error;
pub mod fp8;
pub mod shape;
pub mod tensor;

pub use capability::{NumericCapabilities, DISABLE_FP8_ENV};
pub use dtype::{DType, WithDType};
pub use error::{Error, Result};
pub use fp8::{Fp8Format, F8E4M3, F8E5M2};
pub use shape::Shape;
pub use tensor::{Tensor, TensorId};
