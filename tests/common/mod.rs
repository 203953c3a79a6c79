// Copyright (C) 2022 Nitrokey GmbH
// SPDX-License-Identifier: LGPL-3.0-only
#![allow(unused)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use ganges_fingerprint::backend::virtual_platform::{
    VirtualDevice, VirtualKeystore, VirtualTrustlet,
};
use ganges_fingerprint::{
    AcquiredInfo, AuthToken, AuthenticatorType, BiometricsFingerprint, ClientCallback, FingerId,
    FingerprintError, GroupId, Notification, Options, AUTH_TOKEN_LEN,
};

pub type Hal = BiometricsFingerprint<VirtualDevice, VirtualTrustlet>;

pub const WAIT: Duration = Duration::from_secs(5);

/// Callback forwarding every notification into a channel.
#[derive(Debug)]
pub struct Recorder {
    tx: Mutex<mpsc::Sender<Notification>>,
    count: AtomicUsize,
}

impl Recorder {
    pub fn new() -> (Arc<Self>, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel();
        let recorder = Self {
            tx: Mutex::new(tx),
            count: AtomicUsize::new(0),
        };
        (Arc::new(recorder), rx)
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    fn push(&self, notification: Notification) {
        self.count.fetch_add(1, Ordering::SeqCst);
        self.tx.lock().unwrap().send(notification).ok();
    }
}

impl ClientCallback for Recorder {
    fn on_enroll_result(&self, _: u64, fid: FingerId, gid: GroupId, remaining: u32) {
        self.push(Notification::EnrollResult {
            fid,
            gid,
            remaining,
        });
    }

    fn on_acquired(&self, _: u64, info: AcquiredInfo, vendor_code: i32) {
        self.push(Notification::Acquired { info, vendor_code });
    }

    fn on_authenticated(&self, _: u64, fid: FingerId, gid: GroupId, token: &[u8]) {
        self.push(Notification::Authenticated {
            fid,
            gid,
            token: token.to_vec(),
        });
    }

    fn on_error(&self, _: u64, error: FingerprintError, vendor_code: i32) {
        self.push(Notification::Error { error, vendor_code });
    }

    fn on_removed(&self, _: u64, fid: FingerId, gid: GroupId, remaining: u32) {
        self.push(Notification::Removed {
            fid,
            gid,
            remaining,
        });
    }

    fn on_enumerate(&self, _: u64, fid: FingerId, gid: GroupId, remaining: u32) {
        self.push(Notification::Enumerate {
            fid,
            gid,
            remaining,
        });
    }
}

pub fn options() -> Options {
    let mut options = Options::default();
    options.poll_interval_ms = 10;
    options
}

pub fn with_trustlet(trustlet: VirtualTrustlet) -> (Hal, Arc<Recorder>, mpsc::Receiver<Notification>) {
    let hal = Hal::new(
        VirtualDevice::default(),
        &VirtualKeystore::default(),
        trustlet,
        options(),
    )
    .expect("failed to start the adapter");
    let (recorder, rx) = Recorder::new();
    hal.set_notify(recorder.clone());
    (hal, recorder, rx)
}

pub fn hal() -> (Hal, Arc<Recorder>, mpsc::Receiver<Notification>) {
    with_trustlet(VirtualTrustlet::default())
}

pub fn password_token(challenge: u64) -> [u8; AUTH_TOKEN_LEN] {
    AuthToken {
        version: 0,
        challenge,
        user_id: 10,
        authenticator_id: 20,
        authenticator_type: AuthenticatorType::PASSWORD,
        timestamp: 1,
        hmac: [0x11; 32],
    }
    .to_bytes()
}
