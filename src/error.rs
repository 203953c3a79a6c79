// Copyright (C) 2022 Nitrokey GmbH
// SPDX-License-Identifier: LGPL-3.0-only

use crate::backend::ReturnCode;
use crate::types::RequestStatus;

/// Initialization step of the adapter, in the order they are executed.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    EnableDevice,
    LoadMasterKey,
    SetDataPath,
    SetMasterKey,
    InitializeSensor,
    InitializeAlgo,
    Calibrate,
    SetWorkMode,
}

impl Step {
    fn name(self) -> &'static str {
        match self {
            Step::EnableDevice => "EnableDevice",
            Step::LoadMasterKey => "LoadMasterKey",
            Step::SetDataPath => "SetDataPath",
            Step::SetMasterKey => "SetMasterKey",
            Step::InitializeSensor => "InitializeSensor",
            Step::InitializeAlgo => "InitializeAlgo",
            Step::Calibrate => "Calibrate",
            Step::SetWorkMode => "SetWorkMode",
        }
    }
}

/// Errors produced by the adapter and its collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// An initialization step failed.
    Init {
        /// The failing step.
        step: Step,
        /// Return code of the trustlet, 0 if the failure did not come from the trustlet.
        rc: i32,
    },
    /// The keystore could not provide the master key.
    KeyProvisioning,
    /// The sensor device could not be powered.
    Device,
    /// A trustlet call returned a non-zero code.
    Trustlet(ReturnCode),
    /// The request targets a group that is not active.
    InvalidGroup,
    /// The authentication token is malformed.
    InvalidToken,
    /// The authentication token does not carry the outstanding enrollment challenge.
    ChallengeMismatch,
    /// Another enroll or authenticate operation is in progress.
    Busy,
}

impl Error {
    /// Default translation into the host status taxonomy.
    pub fn status(&self) -> RequestStatus {
        match self {
            Error::InvalidGroup
            | Error::InvalidToken
            | Error::ChallengeMismatch
            | Error::Trustlet(_) => RequestStatus::SysEinval,
            Error::Busy => RequestStatus::SysEbusy,
            Error::Device => RequestStatus::SysEio,
            Error::Init { .. } | Error::KeyProvisioning => RequestStatus::SysEfault,
        }
    }

    /// Whether the adapter can keep serving requests after this error during startup.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::Init {
                step: Step::SetWorkMode,
                ..
            }
        )
    }
}

impl From<ReturnCode> for Error {
    fn from(rc: ReturnCode) -> Self {
        Error::Trustlet(rc)
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Init { step, rc } => write!(f, "{} failed with rc = {rc}", step.name()),
            Error::KeyProvisioning => f.write_str("Failed to retrieve the master key"),
            Error::Device => f.write_str("Failed to enable the sensor device"),
            Error::Trustlet(rc) => write!(f, "Trustlet call failed with rc = {}", rc.0),
            Error::InvalidGroup => f.write_str("Group is not the active group"),
            Error::InvalidToken => f.write_str("Authentication token invalid"),
            Error::ChallengeMismatch => {
                f.write_str("Authentication token not bound to the enrollment challenge")
            }
            Error::Busy => f.write_str("Another operation is in progress"),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        let err = Error::Init {
            step: Step::InitializeSensor,
            rc: -3,
        };
        assert_eq!(err.to_string(), "InitializeSensor failed with rc = -3");
        assert!(err.is_fatal());
        let err = Error::Init {
            step: Step::SetWorkMode,
            rc: 7,
        };
        assert!(!err.is_fatal());
    }

    #[test]
    fn status() {
        assert_eq!(Error::InvalidGroup.status(), RequestStatus::SysEinval);
        assert_eq!(Error::Busy.status(), RequestStatus::SysEbusy);
        assert_eq!(
            Error::Trustlet(ReturnCode(4)).status(),
            RequestStatus::SysEinval
        );
    }
}
