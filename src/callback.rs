// Copyright (C) 2022 Nitrokey GmbH
// SPDX-License-Identifier: LGPL-3.0-only

//! Notifications sent to the biometrics framework.

use core::fmt::Debug;

use crate::types::{AcquiredInfo, FingerId, FingerprintError, GroupId};

/// Listener registered with [`BiometricsFingerprint::set_notify`][crate::BiometricsFingerprint::set_notify].
///
/// `device_id` is the token returned by `set_notify`.  Methods may be called from worker threads
/// and must not block for long.
pub trait ClientCallback: Debug + Send + Sync {
    /// An enrollment sample was accepted; the print is stored when `remaining` is 0.
    fn on_enroll_result(&self, device_id: u64, fid: FingerId, gid: GroupId, remaining: u32);

    /// Feedback about the last touch.  `vendor_code` is only meaningful for
    /// [`AcquiredInfo::Vendor`].
    fn on_acquired(&self, device_id: u64, info: AcquiredInfo, vendor_code: i32);

    /// Result of an authentication attempt.  `fid` is 0 and `token` empty for a rejected finger.
    fn on_authenticated(&self, device_id: u64, fid: FingerId, gid: GroupId, token: &[u8]);

    /// The running operation ended with an error.
    fn on_error(&self, device_id: u64, error: FingerprintError, vendor_code: i32);

    /// A print was removed.
    fn on_removed(&self, device_id: u64, fid: FingerId, gid: GroupId, remaining: u32);

    /// One entry of an enumeration.  An empty group reports `fid` 0 with `remaining` 0.
    fn on_enumerate(&self, device_id: u64, fid: FingerId, gid: GroupId, remaining: u32);
}

/// Notification as a value, for listeners that forward or record them.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notification {
    EnrollResult {
        fid: FingerId,
        gid: GroupId,
        remaining: u32,
    },
    Acquired {
        info: AcquiredInfo,
        vendor_code: i32,
    },
    Authenticated {
        fid: FingerId,
        gid: GroupId,
        token: Vec<u8>,
    },
    Error {
        error: FingerprintError,
        vendor_code: i32,
    },
    Removed {
        fid: FingerId,
        gid: GroupId,
        remaining: u32,
    },
    Enumerate {
        fid: FingerId,
        gid: GroupId,
        remaining: u32,
    },
}

impl Notification {
    /// Delivers this notification to `callback`.
    pub fn send(&self, callback: &dyn ClientCallback, device_id: u64) {
        match self {
            Self::EnrollResult {
                fid,
                gid,
                remaining,
            } => callback.on_enroll_result(device_id, *fid, *gid, *remaining),
            Self::Acquired { info, vendor_code } => {
                callback.on_acquired(device_id, *info, *vendor_code)
            }
            Self::Authenticated { fid, gid, token } => {
                callback.on_authenticated(device_id, *fid, *gid, token)
            }
            Self::Error { error, vendor_code } => {
                callback.on_error(device_id, *error, *vendor_code)
            }
            Self::Removed {
                fid,
                gid,
                remaining,
            } => callback.on_removed(device_id, *fid, *gid, *remaining),
            Self::Enumerate {
                fid,
                gid,
                remaining,
            } => callback.on_enumerate(device_id, *fid, *gid, *remaining),
        }
    }
}
