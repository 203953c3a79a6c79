// Copyright (C) 2022 Nitrokey GmbH
// SPDX-License-Identifier: LGPL-3.0-only
//! Virtual sensor platform used for testing
//!
//! [`VirtualTrustlet`] keeps prints in memory and simulates finger touches that are queued with
//! [`VirtualTrustlet::touch`].  Every call is recorded so that tests can check which trustlet
//! primitives a request reached.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::{
    check_rc, AuthenticateStep, Device, EnrollStep, Keystore, MasterKey, Trustlet, TrustletResult,
};
use crate::auth_token::{AuthToken, AuthenticatorType};
use crate::error::Error;
use crate::types::{AcquiredInfo, FingerId, FingerprintError, GroupId};

/// Return code used for calls made in the wrong trustlet state.
pub const RC_BAD_STATE: i32 = -1;
/// Return code used when a print does not exist.
pub const RC_NOT_FOUND: i32 = -2;

#[derive(Debug, Default)]
struct Power {
    enabled: AtomicBool,
    enable_count: AtomicU32,
}

/// Sensor device that only tracks its power state.
///
/// Clones share the power state, so a test can keep a handle on a device it moved into the
/// adapter.
#[derive(Debug, Default, Clone)]
pub struct VirtualDevice {
    power: Arc<Power>,
    broken: bool,
}

impl VirtualDevice {
    /// A device that fails to power up.
    pub fn broken() -> Self {
        Self {
            broken: true,
            ..Default::default()
        }
    }

    /// Whether the device is currently enabled.
    pub fn is_enabled(&self) -> bool {
        self.power.enabled.load(Ordering::SeqCst)
    }

    /// How many times the device was enabled.
    pub fn enable_count(&self) -> u32 {
        self.power.enable_count.load(Ordering::SeqCst)
    }
}

impl Device for VirtualDevice {
    fn enable(&self) -> Result<(), Error> {
        if self.broken {
            return Err(Error::Device);
        }
        self.power.enabled.store(true, Ordering::SeqCst);
        self.power.enable_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn disable(&self) {
        self.power.enabled.store(false, Ordering::SeqCst);
    }
}

/// Keystore returning a fixed key.
#[derive(Debug, Clone)]
pub struct VirtualKeystore {
    key: Option<MasterKey>,
}

impl VirtualKeystore {
    /// A keystore without a key for this device.
    pub fn empty() -> Self {
        Self { key: None }
    }
}

impl Default for VirtualKeystore {
    fn default() -> Self {
        Self {
            key: Some(MasterKey(vec![0x42; 32])),
        }
    }
}

impl Keystore for VirtualKeystore {
    fn master_key(&self) -> Result<MasterKey, Error> {
        self.key.clone().ok_or(Error::KeyProvisioning)
    }
}

/// Trustlet primitives, as recorded by [`VirtualTrustlet::calls`].
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Call {
    SetDataPath,
    SetMasterKey,
    InitializeSensor,
    InitializeAlgo,
    Calibrate,
    SetWorkMode,
    SetUserDataPath,
    GetPrintIds,
    GetAuthenticatorId,
    RemovePrint,
    ClearChallenge,
    BeginEnroll,
    EnrollStep,
    BeginAuthenticate,
    AuthenticateStep,
    Cancel,
}

/// A simulated event on the sensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Touch {
    /// A finger was placed.  During authentication it matches if it is enrolled in the group.
    Finger(FingerId),
    /// A finger was placed but the image was not usable.
    Acquired(AcquiredInfo),
    /// The sensor reports a hardware error.
    Error(FingerprintError),
}

#[derive(Debug)]
enum Session {
    Idle,
    Enroll {
        gid: GroupId,
        fid: FingerId,
        remaining: u32,
    },
    Authenticate {
        gid: GroupId,
        operation_id: u64,
    },
}

#[derive(Debug)]
struct State {
    data_path: Option<String>,
    master_key: Option<MasterKey>,
    work_mode: Option<u32>,
    user_paths: BTreeMap<GroupId, String>,
    prints: BTreeMap<GroupId, Vec<FingerId>>,
    next_fid: FingerId,
    generation: u64,
    session: Session,
    touches: VecDeque<Touch>,
    failures: HashMap<Call, i32>,
    interrupted_rc: Option<i32>,
    calls: Vec<Call>,
}

impl State {
    fn interrupted(&self) -> TrustletResult<()> {
        check_rc(self.interrupted_rc.unwrap_or(0))
    }
}

/// In-memory trustlet.
#[derive(Debug)]
pub struct VirtualTrustlet {
    state: Mutex<State>,
    touched: Condvar,
    enroll_samples: u32,
}

impl Default for VirtualTrustlet {
    fn default() -> Self {
        Self::new(3)
    }
}

impl VirtualTrustlet {
    /// Creates a trustlet that requires `enroll_samples` touches per enrollment.
    pub fn new(enroll_samples: u32) -> Self {
        Self {
            state: Mutex::new(State {
                data_path: None,
                master_key: None,
                work_mode: None,
                user_paths: BTreeMap::new(),
                prints: BTreeMap::new(),
                next_fid: 1,
                generation: 1,
                session: Session::Idle,
                touches: VecDeque::new(),
                failures: HashMap::new(),
                interrupted_rc: None,
                calls: Vec::new(),
            }),
            touched: Condvar::new(),
            enroll_samples: enroll_samples.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        crate::utils::lock(&self.state)
    }

    fn enter(&self, call: Call) -> TrustletResult<MutexGuard<'_, State>> {
        let mut state = self.lock();
        state.calls.push(call);
        check_rc(state.failures.get(&call).copied().unwrap_or(0))?;
        Ok(state)
    }

    /// Makes every following call to `call` fail with `rc`.
    pub fn fail(&self, call: Call, rc: i32) {
        self.lock().failures.insert(call, rc);
    }

    /// Undoes [`VirtualTrustlet::fail`].
    pub fn heal(&self, call: Call) {
        self.lock().failures.remove(&call);
    }

    /// Makes enroll and authenticate steps fail with `rc` when no session is running, the way a
    /// step blocked in the secure world returns once it is canceled.
    pub fn fail_interrupted_steps(&self, rc: i32) {
        self.lock().interrupted_rc = Some(rc);
    }

    /// Stores prints for `gid` as if they had been enrolled.
    pub fn insert_prints(&self, gid: GroupId, fids: &[FingerId]) {
        let mut state = self.lock();
        state.prints.entry(gid).or_default().extend_from_slice(fids);
        if let Some(max) = fids.iter().max() {
            state.next_fid = state.next_fid.max(max + 1);
        }
    }

    /// Prints currently enrolled for `gid`.
    pub fn prints(&self, gid: GroupId) -> Vec<FingerId> {
        self.lock().prints.get(&gid).cloned().unwrap_or_default()
    }

    /// Queues a sensor event.
    pub fn touch(&self, touch: Touch) {
        self.lock().touches.push_back(touch);
        self.touched.notify_all();
    }

    /// All calls so far, in order.
    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    /// Number of calls to `call` so far.
    pub fn count(&self, call: Call) -> usize {
        self.lock().calls.iter().filter(|c| **c == call).count()
    }

    /// Forgets the recorded calls.
    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Storage path bound to `gid`.
    pub fn user_data_path(&self, gid: GroupId) -> Option<String> {
        self.lock().user_paths.get(&gid).cloned()
    }

    /// Root data path.
    pub fn data_path(&self) -> Option<String> {
        self.lock().data_path.clone()
    }

    /// Whether a master key was installed.
    pub fn has_master_key(&self) -> bool {
        self.lock().master_key.is_some()
    }

    /// Installed work mode.
    pub fn work_mode(&self) -> Option<u32> {
        self.lock().work_mode
    }

    /// Whether an enrollment or authentication is running.
    pub fn is_busy(&self) -> bool {
        !matches!(self.lock().session, Session::Idle)
    }

    fn next_touch(&self, wait: Duration) -> (MutexGuard<'_, State>, Option<Touch>) {
        let mut state = self.lock();
        if state.touches.is_empty() {
            state = self
                .touched
                .wait_timeout_while(state, wait, |state| {
                    state.touches.is_empty() && !matches!(state.session, Session::Idle)
                })
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        let touch = state.touches.pop_front();
        (state, touch)
    }
}

impl Trustlet for VirtualTrustlet {
    fn set_data_path(&self, path: &str) -> TrustletResult<()> {
        self.enter(Call::SetDataPath)?.data_path = Some(path.into());
        Ok(())
    }

    fn set_master_key(&self, key: &MasterKey) -> TrustletResult<()> {
        self.enter(Call::SetMasterKey)?.master_key = Some(key.clone());
        Ok(())
    }

    fn initialize_sensor(&self) -> TrustletResult<()> {
        self.enter(Call::InitializeSensor).map(drop)
    }

    fn initialize_algo(&self) -> TrustletResult<()> {
        self.enter(Call::InitializeAlgo).map(drop)
    }

    fn calibrate(&self) -> TrustletResult<()> {
        self.enter(Call::Calibrate).map(drop)
    }

    fn set_work_mode(&self, mode: u32) -> TrustletResult<()> {
        self.enter(Call::SetWorkMode)?.work_mode = Some(mode);
        Ok(())
    }

    fn set_user_data_path(&self, gid: GroupId, path: &str) -> TrustletResult<()> {
        self.enter(Call::SetUserDataPath)?
            .user_paths
            .insert(gid, path.into());
        Ok(())
    }

    fn get_print_ids(&self, gid: GroupId) -> TrustletResult<Vec<FingerId>> {
        let state = self.enter(Call::GetPrintIds)?;
        Ok(state.prints.get(&gid).cloned().unwrap_or_default())
    }

    fn get_authenticator_id(&self) -> u64 {
        let mut state = self.lock();
        state.calls.push(Call::GetAuthenticatorId);
        state.generation
    }

    fn remove_print(&self, gid: GroupId, fid: FingerId) -> TrustletResult<()> {
        let mut state = self.enter(Call::RemovePrint)?;
        let prints = state.prints.entry(gid).or_default();
        let before = prints.len();
        prints.retain(|f| *f != fid);
        if prints.len() == before {
            return check_rc(RC_NOT_FOUND);
        }
        state.generation += 1;
        Ok(())
    }

    fn clear_challenge(&self) -> TrustletResult<()> {
        self.enter(Call::ClearChallenge).map(drop)
    }

    fn begin_enroll(&self, gid: GroupId, token: &[u8]) -> TrustletResult<()> {
        let mut state = self.enter(Call::BeginEnroll)?;
        let valid = <&[u8; crate::auth_token::AUTH_TOKEN_LEN]>::try_from(token)
            .ok()
            .and_then(|token| AuthToken::parse(token).ok())
            .is_some();
        if !valid || !matches!(state.session, Session::Idle) {
            return check_rc(RC_BAD_STATE);
        }
        let fid = state.next_fid;
        state.next_fid += 1;
        state.session = Session::Enroll {
            gid,
            fid,
            remaining: self.enroll_samples,
        };
        Ok(())
    }

    fn enroll_step(&self, wait: Duration) -> TrustletResult<EnrollStep> {
        self.enter(Call::EnrollStep).map(drop)?;
        let (mut state, touch) = self.next_touch(wait);
        let Session::Enroll {
            gid,
            fid,
            remaining,
        } = state.session
        else {
            return state.interrupted().map(|()| EnrollStep::Waiting);
        };
        Ok(match touch {
            None => EnrollStep::Waiting,
            Some(Touch::Acquired(info)) => EnrollStep::Acquired(info),
            Some(Touch::Error(err)) => {
                state.session = Session::Idle;
                EnrollStep::Failed(err)
            }
            Some(Touch::Finger(_)) => {
                let remaining = remaining - 1;
                if remaining == 0 {
                    state.prints.entry(gid).or_default().push(fid);
                    state.generation += 1;
                    state.session = Session::Idle;
                } else {
                    state.session = Session::Enroll {
                        gid,
                        fid,
                        remaining,
                    };
                }
                EnrollStep::Sample { fid, remaining }
            }
        })
    }

    fn begin_authenticate(&self, gid: GroupId, operation_id: u64) -> TrustletResult<()> {
        let mut state = self.enter(Call::BeginAuthenticate)?;
        if !matches!(state.session, Session::Idle) {
            return check_rc(RC_BAD_STATE);
        }
        state.session = Session::Authenticate { gid, operation_id };
        Ok(())
    }

    fn authenticate_step(&self, wait: Duration) -> TrustletResult<AuthenticateStep> {
        self.enter(Call::AuthenticateStep).map(drop)?;
        let (mut state, touch) = self.next_touch(wait);
        let Session::Authenticate { gid, operation_id } = state.session else {
            return state.interrupted().map(|()| AuthenticateStep::Waiting);
        };
        Ok(match touch {
            None => AuthenticateStep::Waiting,
            Some(Touch::Acquired(info)) => AuthenticateStep::Acquired(info),
            Some(Touch::Error(err)) => {
                state.session = Session::Idle;
                AuthenticateStep::Failed(err)
            }
            Some(Touch::Finger(fid)) => {
                let enrolled = state
                    .prints
                    .get(&gid)
                    .map_or(false, |prints| prints.contains(&fid));
                if !enrolled {
                    AuthenticateStep::NoMatch
                } else {
                    state.session = Session::Idle;
                    let token = AuthToken {
                        version: crate::auth_token::AUTH_TOKEN_VERSION,
                        challenge: operation_id,
                        user_id: u64::from(gid),
                        authenticator_id: state.generation,
                        authenticator_type: AuthenticatorType::FINGERPRINT,
                        timestamp: 0,
                        hmac: [0; 32],
                    };
                    AuthenticateStep::Match {
                        fid,
                        token: token.to_bytes().to_vec(),
                    }
                }
            }
        })
    }

    fn cancel(&self) -> TrustletResult<()> {
        let mut state = self.enter(Call::Cancel)?;
        state.session = Session::Idle;
        drop(state);
        self.touched.notify_all();
        Ok(())
    }
}
