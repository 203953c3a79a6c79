// Copyright (C) 2022 Nitrokey GmbH
// SPDX-License-Identifier: LGPL-3.0-only

//! Enroll and authenticate run on a worker thread that polls the trustlet.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use stoppable_thread::StoppableHandle;

use super::{device_id, Inner};
use crate::auth_token::AUTH_TOKEN_LEN;
use crate::backend::{AuthenticateStep, Device, DeviceEnableGuard, EnrollStep, Trustlet};
use crate::callback::Notification;
use crate::error::Error;
use crate::types::{FingerprintError, GroupId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Enroll,
    Authenticate,
}

/// What the worker should do.
#[derive(Debug, Clone, Copy)]
pub enum Task {
    Enroll {
        gid: GroupId,
        token: [u8; AUTH_TOKEN_LEN],
        deadline: Option<Instant>,
    },
    Authenticate {
        gid: GroupId,
        operation_id: u64,
    },
}

impl Task {
    pub fn kind(&self) -> Kind {
        match self {
            Task::Enroll { .. } => Kind::Enroll,
            Task::Authenticate { .. } => Kind::Authenticate,
        }
    }
}

/// Marks the operation finished when the worker returns or unwinds.
struct Finished(Arc<AtomicBool>);

impl Drop for Finished {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// The in-flight enroll or authenticate operation.
pub struct Operation {
    kind: Kind,
    handle: StoppableHandle<()>,
    finished: Arc<AtomicBool>,
}

impl core::fmt::Debug for Operation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Operation")
            .field("kind", &self.kind)
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl Operation {
    /// Spawns the worker for `task` and waits until the trustlet accepted or refused it.
    pub fn start<D, T>(inner: &Arc<Inner<D, T>>, task: Task) -> Result<Self, Error>
    where
        D: Device + 'static,
        T: Trustlet + 'static,
    {
        let kind = task.kind();
        let finished = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();
        let worker = Arc::clone(inner);
        let marker = Finished(Arc::clone(&finished));
        let handle = stoppable_thread::spawn(move |stopped| {
            let _marker = marker;
            let is_stopped = || stopped.get();
            run(&worker, task, &tx, &is_stopped);
        });
        let operation = Self {
            kind,
            handle,
            finished,
        };
        match rx.recv() {
            Ok(Ok(())) => Ok(operation),
            Ok(Err(err)) => {
                operation.join();
                Err(err)
            }
            Err(_) => {
                error!("{kind:?} worker exited before starting");
                operation.join();
                Err(Error::Device)
            }
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Raises the worker's stop flag without waiting for it.
    ///
    /// The flag is up before anything interrupts the trustlet, so the worker reports an
    /// interrupted step as a cancellation.
    pub fn request_stop(self) -> StopRequested {
        let handle = self.handle.stop();
        // a callback reacting to a notification runs on the worker itself
        let handle = (handle.thread().id() != thread::current().id()).then_some(handle);
        StopRequested {
            kind: self.kind,
            handle,
        }
    }

    /// Waits for a worker that already finished or is about to.
    pub fn join(self) {
        self.request_stop().join()
    }
}

/// A worker whose stop flag is raised.
#[derive(Debug)]
pub struct StopRequested {
    kind: Kind,
    handle: Option<JoinHandle<()>>,
}

impl StopRequested {
    /// Waits for the worker, unless this is the worker thread.
    pub fn join(self) {
        let Some(handle) = self.handle else {
            return;
        };
        if handle.join().is_err() {
            error!("{:?} worker panicked", self.kind);
        }
    }
}

type Ready = mpsc::Sender<Result<(), Error>>;

fn run<D: Device, T: Trustlet>(
    inner: &Arc<Inner<D, T>>,
    task: Task,
    ready: &Ready,
    is_stopped: &dyn Fn() -> bool,
) {
    let _guard = match DeviceEnableGuard::new(&inner.device) {
        Ok(guard) => guard,
        Err(err) => {
            error!("Failed to enable sensor: {err}");
            ready.send(Err(err)).ok();
            return;
        }
    };
    match task {
        Task::Enroll {
            gid,
            token,
            deadline,
        } => {
            if let Err(rc) = inner.trustlet.begin_enroll(gid, &token) {
                error!("Failed to start enrollment: rc = {}", rc.0);
                ready.send(Err(rc.into())).ok();
                return;
            }
            ready.send(Ok(())).ok();
            enroll(inner, gid, deadline, is_stopped);
        }
        Task::Authenticate { gid, operation_id } => {
            if let Err(rc) = inner.trustlet.begin_authenticate(gid, operation_id) {
                error!("Failed to start authentication: rc = {}", rc.0);
                ready.send(Err(rc.into())).ok();
                return;
            }
            ready.send(Ok(())).ok();
            authenticate(inner, gid, is_stopped);
        }
    }
}

fn notify<D: Device, T: Trustlet>(inner: &Arc<Inner<D, T>>, notification: Notification) {
    // Resolved per notification so that a callback swap takes effect mid-operation.
    let listener = inner.session().listener(device_id(inner));
    listener.notify(notification);
}

fn notify_error<D: Device, T: Trustlet>(
    inner: &Arc<Inner<D, T>>,
    error: FingerprintError,
    vendor_code: i32,
) {
    notify(inner, Notification::Error { error, vendor_code });
}

fn enroll<D: Device, T: Trustlet>(
    inner: &Arc<Inner<D, T>>,
    gid: GroupId,
    deadline: Option<Instant>,
    is_stopped: &dyn Fn() -> bool,
) {
    let wait = inner.options.poll_interval();
    loop {
        if is_stopped() {
            info!("Enrollment canceled");
            notify_error(inner, FingerprintError::Canceled, 0);
            return;
        }
        if deadline.map_or(false, |deadline| Instant::now() >= deadline) {
            warn!("Enrollment timed out");
            if let Err(rc) = inner.trustlet.cancel() {
                error!("Failed to cancel timed out enrollment: rc = {}", rc.0);
            }
            notify_error(inner, FingerprintError::Timeout, 0);
            return;
        }
        let step = match inner.trustlet.enroll_step(wait) {
            Ok(step) => step,
            Err(rc) if is_stopped() => {
                debug!("Enroll step interrupted: rc = {}", rc.0);
                continue;
            }
            Err(rc) => {
                error!("Enrollment failed: rc = {}", rc.0);
                notify_error(inner, FingerprintError::UnableToProcess, rc.0);
                return;
            }
        };
        // A cancel may have unblocked the step; do not report its outcome.
        if is_stopped() {
            continue;
        }
        match step {
            EnrollStep::Waiting => {}
            EnrollStep::Acquired(info) => {
                debug!("Enroll acquired {info:?}");
                notify(
                    inner,
                    Notification::Acquired {
                        info,
                        vendor_code: 0,
                    },
                );
            }
            EnrollStep::Sample { fid, remaining } => {
                debug!("Enroll sample for fid {fid}, {remaining} remaining");
                notify(
                    inner,
                    Notification::EnrollResult {
                        fid,
                        gid,
                        remaining,
                    },
                );
                if remaining == 0 {
                    info!("Enrolled fid {fid} in gid {gid}");
                    return;
                }
            }
            EnrollStep::Failed(error) => {
                warn!("Enrollment failed: {error:?}");
                notify_error(inner, error, 0);
                return;
            }
        }
    }
}

fn authenticate<D: Device, T: Trustlet>(
    inner: &Arc<Inner<D, T>>,
    gid: GroupId,
    is_stopped: &dyn Fn() -> bool,
) {
    let wait = inner.options.poll_interval();
    loop {
        if is_stopped() {
            info!("Authentication canceled");
            notify_error(inner, FingerprintError::Canceled, 0);
            return;
        }
        let step = match inner.trustlet.authenticate_step(wait) {
            Ok(step) => step,
            Err(rc) if is_stopped() => {
                debug!("Authenticate step interrupted: rc = {}", rc.0);
                continue;
            }
            Err(rc) => {
                error!("Authentication failed: rc = {}", rc.0);
                notify_error(inner, FingerprintError::UnableToProcess, rc.0);
                return;
            }
        };
        if is_stopped() {
            continue;
        }
        match step {
            AuthenticateStep::Waiting => {}
            AuthenticateStep::Acquired(info) => {
                debug!("Authenticate acquired {info:?}");
                notify(
                    inner,
                    Notification::Acquired {
                        info,
                        vendor_code: 0,
                    },
                );
            }
            AuthenticateStep::NoMatch => {
                info!("Finger not recognized");
                notify(
                    inner,
                    Notification::Authenticated {
                        fid: 0,
                        gid,
                        token: Vec::new(),
                    },
                );
            }
            AuthenticateStep::Match { fid, token } => {
                info!("Authenticated fid {fid} in gid {gid}");
                notify(inner, Notification::Authenticated { fid, gid, token });
                return;
            }
            AuthenticateStep::Failed(error) => {
                warn!("Authentication failed: {error:?}");
                notify_error(inner, error, 0);
                return;
            }
        }
    }
}
