// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Arena-backed containers addressed by typed handles.

mod list;

pub use list::{IndexList, Iter};

/// A typed handle that maps one-to-one onto an arena slot index.
pub trait Handle: Copy {
    fn index(self) -> usize;
    fn from_index(index: usize) -> Self;
}
