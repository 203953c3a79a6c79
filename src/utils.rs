// Copyright (C) 2022 Nitrokey GmbH
// SPDX-License-Identifier: LGPL-3.0-only

use std::sync::{Mutex, MutexGuard, PoisonError};

/// `Result::inspect_err` for logging on the error path of a `?` chain.
pub trait InspectErr<E> {
    fn inspect_err_stable(self, op: impl FnOnce(&E)) -> Self;
}

impl<T, E> InspectErr<E> for Result<T, E> {
    fn inspect_err_stable(self, op: impl FnOnce(&E)) -> Self {
        if let Err(err) = &self {
            op(err);
        }
        self
    }
}

/// Locks `mutex`, ignoring poisoning.
///
/// The protected data is only ever replaced as a whole, so a panic while holding the lock never
/// leaves it half-updated.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
