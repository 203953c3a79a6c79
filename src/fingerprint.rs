// Copyright (C) 2022 Nitrokey GmbH
// SPDX-License-Identifier: LGPL-3.0-only

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};

mod operation;
mod state;

use crate::auth_token::{AuthToken, AUTH_TOKEN_LEN};
use crate::backend::{Device, DeviceEnableGuard, Keystore, Trustlet, TrustletResult};
use crate::callback::{ClientCallback, Notification};
use crate::error::{Error, Step};
use crate::types::{FingerId, FingerprintError, GroupId, RequestStatus};
use crate::utils::{lock, InspectErr};
use operation::{Operation, Task};
use state::Session;

/// Root of the trustlet's persistent data for the primary device user.
pub const DEFAULT_DATA_PATH: &str = "/data/system/users/0/fpdata";
/// Work mode installed at startup.
pub const DEFAULT_WORK_MODE: u32 = 2;
/// Upper bound for a single trustlet poll during enroll and authenticate.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

/// Options for the fingerprint adapter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct Options {
    /// Root directory of the trustlet's persistent data.
    pub data_path: String,
    /// Work mode passed to the trustlet after calibration.
    pub work_mode: u32,
    /// How long a single trustlet poll may block, in milliseconds.  Bounds the latency of
    /// `cancel` and of the enroll timeout.
    pub poll_interval_ms: u64,
}

impl Options {
    /// [`Options::poll_interval_ms`] as a duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for Options {
    fn default() -> Self {
        Self {
            data_path: DEFAULT_DATA_PATH.into(),
            work_mode: DEFAULT_WORK_MODE,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

#[derive(Debug)]
pub(crate) struct Inner<D, T> {
    device: D,
    trustlet: T,
    options: Options,
    session: Mutex<Session>,
    operation: Mutex<Option<Operation>>,
}

impl<D, T> Inner<D, T> {
    fn session(&self) -> MutexGuard<'_, Session> {
        lock(&self.session)
    }
}

/// Token identifying this sensor in notifications.
///
/// Stable for the lifetime of the adapter.  Only one sensor per process is supported: the token
/// carries no information beyond the adapter's address.
fn device_id<D, T>(inner: &Arc<Inner<D, T>>) -> u64 {
    Arc::as_ptr(inner) as usize as u64
}

fn init_step(step: Step, result: TrustletResult<()>) -> Result<(), Error> {
    result.map_err(|rc| {
        let err = Error::Init { step, rc: rc.0 };
        error!("{err}");
        err
    })
}

/// Fingerprint adapter between the biometrics framework and the vendor trustlet.
///
/// This is the main entry point for this crate.  All methods take `&self` and may be called
/// concurrently; notifications go to the callback registered with
/// [`BiometricsFingerprint::set_notify`].
#[derive(Debug)]
pub struct BiometricsFingerprint<D: Device + 'static, T: Trustlet + 'static> {
    inner: Arc<Inner<D, T>>,
    startup_error: Option<Error>,
}

impl<D: Device + 'static, T: Trustlet + 'static> BiometricsFingerprint<D, T> {
    /// Brings up the sensor and the trustlet.
    ///
    /// The device is enabled for the duration of the startup sequence.  Any failing step up to
    /// calibration is returned as an error.  A failure to install the work mode is not fatal; it
    /// is available through [`BiometricsFingerprint::startup_error`].
    pub fn new<K: Keystore>(
        device: D,
        keystore: &K,
        trustlet: T,
        options: Options,
    ) -> Result<Self, Error> {
        let startup_error = {
            let _guard = DeviceEnableGuard::new(&device)
                .inspect_err_stable(|err| error!("Failed to enable sensor: {err}"))?;

            let master_key = keystore
                .master_key()
                .inspect_err_stable(|err| error!("{err}"))?;

            init_step(
                Step::SetDataPath,
                trustlet.set_data_path(&options.data_path),
            )?;
            init_step(Step::SetMasterKey, trustlet.set_master_key(&master_key))?;
            init_step(Step::InitializeSensor, trustlet.initialize_sensor())?;
            init_step(Step::InitializeAlgo, trustlet.initialize_algo())?;
            init_step(Step::Calibrate, trustlet.calibrate())?;

            // TODO: pick the work mode from the display state once the power-saving modes are known
            match trustlet.set_work_mode(options.work_mode) {
                Ok(()) => None,
                Err(rc) => {
                    let err = Error::Init {
                        step: Step::SetWorkMode,
                        rc: rc.0,
                    };
                    warn!("{err}, continuing");
                    Some(err)
                }
            }
        };
        info!("Fingerprint sensor ready");

        Ok(Self {
            inner: Arc::new(Inner {
                device,
                trustlet,
                options,
                session: Mutex::new(Session::default()),
                operation: Mutex::new(None),
            }),
            startup_error,
        })
    }

    /// Like [`BiometricsFingerprint::new`], but aborts the process on a fatal error.
    ///
    /// Meant for the service entry point: the framework must not be served by an adapter whose
    /// sensor is not initialized.
    pub fn new_or_abort<K: Keystore>(device: D, keystore: &K, trustlet: T, options: Options) -> Self {
        match Self::new(device, keystore, trustlet, options) {
            Ok(hal) => hal,
            Err(err) => {
                error!("Fatal error during fingerprint startup: {err}");
                std::process::abort();
            }
        }
    }

    /// Recoverable error raised during startup, if any.
    pub fn startup_error(&self) -> Option<Error> {
        self.startup_error
    }

    /// The options the adapter was started with.
    pub fn options(&self) -> &Options {
        &self.inner.options
    }

    /// The trustlet session.
    pub fn trustlet(&self) -> &T {
        &self.inner.trustlet
    }

    /// The sensor device.
    pub fn device(&self) -> &D {
        &self.inner.device
    }

    /// Token passed as `device_id` in every notification.
    pub fn device_id(&self) -> u64 {
        device_id(&self.inner)
    }

    /// The currently active group.
    pub fn active_group(&self) -> GroupId {
        self.inner.session().gid
    }

    /// Registers the listener for all following notifications and returns the device token.
    pub fn set_notify(&self, callback: Arc<dyn ClientCallback>) -> u64 {
        debug!("Registering callback {callback:?}");
        self.inner.session().set_callback(callback);
        self.device_id()
    }

    /// Issues a fresh enrollment challenge.
    ///
    /// The challenge must come back inside the authentication token passed to
    /// [`BiometricsFingerprint::enroll`].  A new call replaces the previous challenge.
    pub fn pre_enroll(&self) -> u64 {
        let challenge = loop {
            let challenge = OsRng.next_u64();
            if challenge != 0 {
                break challenge;
            }
        };
        self.inner.session().challenge = Some(challenge);
        info!("Generated enroll challenge {challenge:#x}");
        challenge
    }

    /// Starts enrolling a finger for `gid`.
    ///
    /// Progress is reported with [`ClientCallback::on_enroll_result`] until `remaining` reaches 0.
    /// A `timeout_sec` of 0 disables the timeout.
    pub fn enroll(
        &self,
        hat: &[u8; AUTH_TOKEN_LEN],
        gid: GroupId,
        timeout_sec: u32,
    ) -> RequestStatus {
        let token = {
            let session = self.inner.session();
            if session.check_group(gid).is_err() {
                error!("Cannot enroll finger for different gid! Caller needs to update storePath first with setActiveGroup()!");
                return RequestStatus::SysEinval;
            }
            let token = match AuthToken::parse(hat) {
                Ok(token) => token,
                Err(err) => {
                    error!("enroll: {err}");
                    return err.status();
                }
            };
            let Some(challenge) = session.challenge else {
                error!("enroll: no challenge issued, preEnroll must be called first");
                return RequestStatus::SysEinval;
            };
            if let Err(err) = token.check_enroll(challenge) {
                error!("enroll: {err}");
                return err.status();
            }
            token
        };

        info!("Starting enroll for challenge {:#x}", token.challenge);
        let deadline = (timeout_sec > 0)
            .then(|| Instant::now() + Duration::from_secs(u64::from(timeout_sec)));
        let task = Task::Enroll {
            gid,
            token: *hat,
            deadline,
        };
        match self.start(task) {
            Ok(()) => RequestStatus::SysOk,
            Err(Error::Busy) => RequestStatus::SysEbusy,
            Err(_) => RequestStatus::SysEfault,
        }
    }

    /// Ends the enrollment transaction by forgetting the challenge.
    pub fn post_enroll(&self) -> RequestStatus {
        info!("postEnroll: clearing challenge");
        self.inner.session().challenge = None;
        match self.inner.trustlet.clear_challenge() {
            Ok(()) => RequestStatus::SysOk,
            Err(rc) => {
                error!("Failed to clear challenge: rc = {}", rc.0);
                RequestStatus::SysUnknown
            }
        }
    }

    /// Identifier of the current enrolled-template generation.
    pub fn get_authenticator_id(&self) -> u64 {
        let id = self.inner.trustlet.get_authenticator_id();
        info!("getAuthenticatorId: id = {id}");
        id
    }

    /// Aborts the running enroll or authenticate operation.
    ///
    /// The operation reports [`FingerprintError::Canceled`].  Without a running operation this
    /// does nothing.
    pub fn cancel(&self) -> RequestStatus {
        info!("Cancel requested");
        let Some(operation) = lock(&self.inner.operation).take() else {
            debug!("Nothing to cancel");
            return RequestStatus::SysOk;
        };
        if operation.is_finished() {
            debug!("{:?} already finished", operation.kind());
            operation.join();
            return RequestStatus::SysOk;
        }
        let stopping = operation.request_stop();
        let result = self.inner.trustlet.cancel();
        stopping.join();
        match result {
            Ok(()) => RequestStatus::SysOk,
            Err(rc) => {
                error!("Trustlet cancel failed: rc = {}", rc.0);
                RequestStatus::SysUnknown
            }
        }
    }

    /// Reports every print of the active group with [`ClientCallback::on_enumerate`].
    pub fn enumerate(&self) -> RequestStatus {
        let (gid, listener) = {
            let session = self.inner.session();
            (session.gid, session.listener(self.device_id()))
        };
        let fids = match self.inner.trustlet.get_print_ids(gid) {
            Ok(fids) => fids,
            Err(rc) => {
                error!("Failed to list prints of gid {gid}: rc = {}", rc.0);
                return RequestStatus::SysEinval;
            }
        };

        debug!("Enumerating {} fingers", fids.len());
        if fids.is_empty() {
            // fid 0 is not a fingerprint, it only marks the end of the enumeration
            listener.notify(Notification::Enumerate {
                fid: 0,
                gid,
                remaining: 0,
            });
        } else {
            for (fid, remaining) in fids.iter().zip((0..fids.len()).rev()) {
                listener.notify(Notification::Enumerate {
                    fid: *fid,
                    gid,
                    remaining: remaining as u32,
                });
            }
        }
        RequestStatus::SysOk
    }

    /// Removes print `fid` of `gid`, or all prints of `gid` if `fid` is 0.
    ///
    /// Every removed print is reported with [`ClientCallback::on_removed`].  Prints are removed
    /// one at a time, so if the trustlet fails partway through a removal of all prints, the
    /// prints reported so far stay removed, `remaining` never reaches 0, and
    /// [`FingerprintError::UnableToRemove`] follows.
    pub fn remove(&self, gid: GroupId, fid: FingerId) -> RequestStatus {
        info!("remove: gid = {gid}, fid = {fid}");
        let listener = {
            let session = self.inner.session();
            if session.check_group(gid).is_err() {
                error!("Change group and userpath through setActiveGroup first!");
                return RequestStatus::SysEinval;
            }
            session.listener(self.device_id())
        };

        let fids = if fid == 0 {
            match self.inner.trustlet.get_print_ids(gid) {
                Ok(fids) => fids,
                Err(rc) => {
                    error!("Failed to list prints of gid {gid}: rc = {}", rc.0);
                    listener.notify(Notification::Error {
                        error: FingerprintError::UnableToRemove,
                        vendor_code: rc.0,
                    });
                    return RequestStatus::SysEinval;
                }
            }
        } else {
            vec![fid]
        };

        if fids.is_empty() {
            listener.notify(Notification::Removed {
                fid: 0,
                gid,
                remaining: 0,
            });
            return RequestStatus::SysOk;
        }

        for (fid, remaining) in fids.iter().zip((0..fids.len()).rev()) {
            if let Err(rc) = self.inner.trustlet.remove_print(gid, *fid) {
                error!("Failed to remove fid {fid}: rc = {}", rc.0);
                listener.notify(Notification::Error {
                    error: FingerprintError::UnableToRemove,
                    vendor_code: rc.0,
                });
                return RequestStatus::SysEinval;
            }
            listener.notify(Notification::Removed {
                fid: *fid,
                gid,
                remaining: remaining as u32,
            });
        }
        RequestStatus::SysOk
    }

    /// Makes `gid` the active group and binds it to `store_path`.
    ///
    /// If the trustlet rejects the binding, the previous group stays active.
    pub fn set_active_group(&self, gid: GroupId, store_path: &str) -> RequestStatus {
        info!("setActiveGroup: gid = {gid}, path = {store_path}");
        let mut session = self.inner.session();
        let previous = core::mem::replace(&mut session.gid, gid);
        match self.inner.trustlet.set_user_data_path(gid, store_path) {
            Ok(()) => RequestStatus::SysOk,
            Err(rc) => {
                error!("Failed to set user data path: rc = {}", rc.0);
                session.gid = previous;
                RequestStatus::SysEinval
            }
        }
    }

    /// Starts authenticating against the prints of `gid`.
    ///
    /// Every rejected finger is reported with `fid` 0 and the operation keeps waiting; a match
    /// ends it.  `operation_id` is bound into the token minted on a match.
    pub fn authenticate(&self, operation_id: u64, gid: GroupId) -> RequestStatus {
        info!("authenticate: gid = {gid}, operation id = {operation_id:#x}");
        if self.inner.session().check_group(gid).is_err() {
            error!("Cannot authenticate finger for different gid! Caller needs to update storePath first with setActiveGroup()!");
            return RequestStatus::SysEinval;
        }
        match self.start(Task::Authenticate { gid, operation_id }) {
            Ok(()) => RequestStatus::SysOk,
            Err(err) => err.status(),
        }
    }

    fn start(&self, task: Task) -> Result<(), Error> {
        let mut slot = lock(&self.inner.operation);
        if let Some(running) = slot.as_ref() {
            if !running.is_finished() {
                warn!(
                    "Rejecting {:?}, {:?} is in progress",
                    task.kind(),
                    running.kind()
                );
                return Err(Error::Busy);
            }
        }
        if let Some(done) = slot.take() {
            done.join();
        }
        *slot = Some(Operation::start(&self.inner, task)?);
        Ok(())
    }
}

impl<D: Device + 'static, T: Trustlet + 'static> Drop for BiometricsFingerprint<D, T> {
    fn drop(&mut self) {
        let operation = lock(&self.inner.operation).take();
        if let Some(operation) = operation {
            let finished = operation.is_finished();
            let stopping = operation.request_stop();
            if !finished {
                self.inner.trustlet.cancel().ok();
            }
            stopping.join();
        }
    }
}
