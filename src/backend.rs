// Copyright (C) 2022 Nitrokey GmbH
// SPDX-License-Identifier: LGPL-3.0-only

//! Collaborators the adapter drives.
//!
//! The fingerprint logic itself (capture, matching, template storage) lives in a vendor trustlet
//! running in the secure world.  A [`BiometricsFingerprint`][`crate::BiometricsFingerprint`] is
//! provided with three implementations:
//!
//! - a [`Device`] that powers the sensor,
//! - a [`Keystore`] that hands out the per-device master key,
//! - a [`Trustlet`] session exposing the vendor call surface.
//!
//! With the `virt` feature, [`virtual_platform`] provides in-memory implementations of all three.

#[cfg(any(test, feature = "virt"))]
pub mod virtual_platform;

use core::fmt::Debug;
use core::time::Duration;

use crate::error::Error;
use crate::types::{AcquiredInfo, FingerId, FingerprintError, GroupId};

/// Non-zero return code of a trustlet call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReturnCode(pub i32);

/// Result of a trustlet call.
pub type TrustletResult<T> = Result<T, ReturnCode>;

/// Converts a raw vendor return code into a [`TrustletResult`].
pub fn check_rc(rc: i32) -> TrustletResult<()> {
    match rc {
        0 => Ok(()),
        rc => Err(ReturnCode(rc)),
    }
}

/// The raw sensor device.
pub trait Device: Debug + Send + Sync {
    /// Powers the sensor up.
    fn enable(&self) -> Result<(), Error>;
    /// Powers the sensor down.
    fn disable(&self);
}

/// Keeps a [`Device`] enabled while it is alive.
#[derive(Debug)]
pub struct DeviceEnableGuard<'a, D: Device + ?Sized> {
    device: &'a D,
}

impl<'a, D: Device + ?Sized> DeviceEnableGuard<'a, D> {
    /// Enables `device`.  It is disabled again when the guard is dropped.
    pub fn new(device: &'a D) -> Result<Self, Error> {
        device.enable()?;
        Ok(Self { device })
    }
}

impl<D: Device + ?Sized> Drop for DeviceEnableGuard<'_, D> {
    fn drop(&mut self) {
        self.device.disable();
    }
}

/// Master key used by the trustlet to encrypt its template storage.
#[derive(Clone, PartialEq, Eq)]
pub struct MasterKey(pub Vec<u8>);

impl Debug for MasterKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "MasterKey({} bytes)", self.0.len())
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.0.iter_mut().for_each(|b| *b = 0);
    }
}

/// Platform key provisioning service.
pub trait Keystore: Debug + Send + Sync {
    /// Retrieves the per-device master key.
    fn master_key(&self) -> Result<MasterKey, Error>;
}

/// One poll of an enrollment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnrollStep {
    /// No finger on the sensor yet.
    Waiting,
    /// Sensor feedback for the last touch.
    Acquired(AcquiredInfo),
    /// A sample was accepted.  The print is stored once `remaining` reaches 0.
    Sample {
        /// Identifier the new print will be stored under.
        fid: FingerId,
        /// Samples still needed.
        remaining: u32,
    },
    /// The enrollment cannot continue.
    Failed(FingerprintError),
}

/// One poll of an authentication.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthenticateStep {
    /// No finger on the sensor yet.
    Waiting,
    /// Sensor feedback for the last touch.
    Acquired(AcquiredInfo),
    /// The finger did not match any enrolled print.
    NoMatch,
    /// The finger matched.
    Match {
        /// The matching print.
        fid: FingerId,
        /// Hardware authentication token minted by the trustlet.
        token: Vec<u8>,
    },
    /// The authentication cannot continue.
    Failed(FingerprintError),
}

/// Session to the vendor fingerprint trustlet.
///
/// Calls may be issued from several threads at once; in particular [`Trustlet::cancel`] is
/// called while another thread is blocked in a `*_step` call.
pub trait Trustlet: Debug + Send + Sync {
    /// Sets the root directory of the trustlet's persistent data.
    fn set_data_path(&self, path: &str) -> TrustletResult<()>;
    /// Installs the master key for the encrypted template storage.
    fn set_master_key(&self, key: &MasterKey) -> TrustletResult<()>;
    /// Initializes the sensor hardware.
    fn initialize_sensor(&self) -> TrustletResult<()>;
    /// Initializes the matching algorithm.
    fn initialize_algo(&self) -> TrustletResult<()>;
    /// Calibrates the sensor.
    fn calibrate(&self) -> TrustletResult<()>;
    /// Selects the power/performance mode.
    fn set_work_mode(&self, mode: u32) -> TrustletResult<()>;

    /// Binds `gid` to its template storage directory.
    fn set_user_data_path(&self, gid: GroupId, path: &str) -> TrustletResult<()>;
    /// Lists the prints enrolled for `gid`.
    fn get_print_ids(&self, gid: GroupId) -> TrustletResult<Vec<FingerId>>;
    /// Identifier of the current enrolled-template generation.
    fn get_authenticator_id(&self) -> u64;
    /// Deletes one print.
    fn remove_print(&self, gid: GroupId, fid: FingerId) -> TrustletResult<()>;
    /// Forgets the enrollment challenge.
    fn clear_challenge(&self) -> TrustletResult<()>;

    /// Starts an enrollment for `gid`.  `token` is the raw authentication token.
    fn begin_enroll(&self, gid: GroupId, token: &[u8]) -> TrustletResult<()>;
    /// Waits at most `wait` for the next enrollment event.
    fn enroll_step(&self, wait: Duration) -> TrustletResult<EnrollStep>;
    /// Starts an authentication for `gid`.
    fn begin_authenticate(&self, gid: GroupId, operation_id: u64) -> TrustletResult<()>;
    /// Waits at most `wait` for the next authentication event.
    fn authenticate_step(&self, wait: Duration) -> TrustletResult<AuthenticateStep>;
    /// Aborts the running enrollment or authentication.
    fn cancel(&self) -> TrustletResult<()>;
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::virtual_platform::VirtualDevice;
    use super::*;

    #[test]
    fn rc() {
        assert_eq!(check_rc(0), Ok(()));
        assert_eq!(check_rc(-5), Err(ReturnCode(-5)));
    }

    #[test]
    fn guard_disables() {
        let device = VirtualDevice::default();
        {
            let _guard = DeviceEnableGuard::new(&device).unwrap();
            assert!(device.is_enabled());
        }
        assert!(!device.is_enabled());
        assert_eq!(device.enable_count(), 1);
    }

    #[test]
    fn guard_not_created_on_failure() {
        let device = VirtualDevice::broken();
        assert_eq!(DeviceEnableGuard::new(&device).err(), Some(Error::Device));
        assert!(!device.is_enabled());
    }

    #[test]
    fn master_key_debug_hides_bytes() {
        let key = MasterKey(vec![1, 2, 3]);
        assert_eq!(format!("{key:?}"), "MasterKey(3 bytes)");
    }
}
