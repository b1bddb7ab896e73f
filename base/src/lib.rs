// This file is part of tpsview, a playback engine for TPS DVR recordings.
// Copyright (C) 2025 The tpsview Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

mod error;
pub mod tracing_setup;

pub use crate::error::{Chain, Error, ErrorKind, ResultExt};

/// A `std::sync::Mutex` wrapper that recovers from poisoning.
///
/// Every lock here protects plain data; a panic mid-update can't leave it in
/// a state worth refusing to read.
#[derive(Default, Debug)]
pub struct Mutex<T>(std::sync::Mutex<T>);

impl<T> Mutex<T> {
    pub fn new(value: T) -> Self {
        Mutex(std::sync::Mutex::new(value))
    }

    pub fn lock(&self) -> std::sync::MutexGuard<'_, T> {
        self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
