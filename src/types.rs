// Copyright (C) 2022 Nitrokey GmbH
// SPDX-License-Identifier: LGPL-3.0-only

//! Status codes and notification values shared with the biometrics framework.

use serde_repr::{Deserialize_repr, Serialize_repr};

/// Group (user/profile) identifier.
pub type GroupId = u32;
/// Identifier of one enrolled fingerprint within a group.
pub type FingerId = u32;

/// Status returned synchronously from every request.
///
/// The numeric values are fixed by the host interface.
#[allow(missing_docs)]
#[derive(Serialize_repr, Deserialize_repr, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum RequestStatus {
    SysUnknown = 1,
    SysOk = 0,
    SysEnoent = -2,
    SysEintr = -4,
    SysEio = -5,
    SysEagain = -11,
    SysEnomem = -12,
    SysEacces = -13,
    SysEfault = -14,
    SysEbusy = -16,
    SysEinval = -22,
    SysEnospc = -28,
    SysEtimedout = -110,
}

impl RequestStatus {
    /// Returns `true` for [`RequestStatus::SysOk`].
    pub fn is_ok(self) -> bool {
        self == Self::SysOk
    }
}

impl From<RequestStatus> for i32 {
    fn from(status: RequestStatus) -> i32 {
        status as i32
    }
}

/// Error reported asynchronously through [`ClientCallback::on_error`][crate::ClientCallback::on_error].
#[allow(missing_docs)]
#[derive(Serialize_repr, Deserialize_repr, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum FingerprintError {
    HwUnavailable = 1,
    UnableToProcess = 2,
    Timeout = 3,
    NoSpace = 4,
    Canceled = 5,
    UnableToRemove = 6,
    Lockout = 7,
    Vendor = 8,
}

/// Sensor feedback reported through [`ClientCallback::on_acquired`][crate::ClientCallback::on_acquired].
#[allow(missing_docs)]
#[derive(Serialize_repr, Deserialize_repr, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum AcquiredInfo {
    Good = 0,
    Partial = 1,
    Insufficient = 2,
    ImagerDirty = 3,
    TooSlow = 4,
    TooFast = 5,
    Vendor = 6,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(i32::from(RequestStatus::SysOk), 0);
        assert_eq!(i32::from(RequestStatus::SysEinval), -22);
        assert_eq!(i32::from(RequestStatus::SysEfault), -14);
        assert_eq!(i32::from(RequestStatus::SysUnknown), 1);
    }

    #[test]
    fn serialized_as_number() {
        assert_eq!(ron::to_string(&RequestStatus::SysEbusy).unwrap(), "-16");
        assert_eq!(
            ron::from_str::<FingerprintError>("5").unwrap(),
            FingerprintError::Canceled
        );
        assert_eq!(ron::to_string(&AcquiredInfo::TooFast).unwrap(), "5");
    }
}
