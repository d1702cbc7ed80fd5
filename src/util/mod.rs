// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shared tensor utilities: layout flattening between positional,
//! head-split and flat feature views.

pub mod reshape;
