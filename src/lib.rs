// Copyright (C) 2022 Nitrokey GmbH
// SPDX-License-Identifier: LGPL-3.0-only

//! This crate implements the fingerprint HAL for sensors driven by the Egistec trustlet on the
//! ganges platform.
//!
//! # Backends
//!
//! Capture, matching and template storage happen inside a vendor trustlet in the secure world.
//! This crate only adapts the request/callback protocol of the biometrics framework to the call
//! surface of that trustlet.  A [`BiometricsFingerprint`] therefore needs implementations of the
//! [`Device`][`backend::Device`], [`Keystore`][`backend::Keystore`] and
//! [`Trustlet`][`backend::Trustlet`] traits.  With the `virt` feature,
//! [`backend::virtual_platform`] provides in-memory implementations of all three.
//!
//! # Request handling
//!
//! [`BiometricsFingerprint::new`] runs the startup sequence (device enable, master key, sensor
//! and algorithm initialization, calibration, work mode).  Afterwards every framework request has
//! a method returning a [`RequestStatus`]; asynchronous outcomes are delivered to the
//! [`ClientCallback`] registered with [`BiometricsFingerprint::set_notify`].
//!
//! Only one sensor per process is supported: the device token handed out by `set_notify` is
//! derived from the adapter's address and is the same for every notification.

#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    non_ascii_idents,
    trivial_casts,
    unused,
    unused_qualifications,
    clippy::expect_used,
    clippy::unwrap_used
)]
#![deny(unsafe_code)]

#[macro_use]
extern crate log;

pub mod auth_token;
pub mod backend;
mod callback;
mod error;
mod fingerprint;
mod types;
mod utils;

pub use auth_token::{AuthToken, AuthenticatorType, AUTH_TOKEN_LEN};
pub use callback::{ClientCallback, Notification};
pub use error::{Error, Step};
pub use fingerprint::{
    BiometricsFingerprint, Options, DEFAULT_DATA_PATH, DEFAULT_POLL_INTERVAL_MS,
    DEFAULT_WORK_MODE,
};
pub use types::{AcquiredInfo, FingerId, FingerprintError, GroupId, RequestStatus};
