// Copyright (C) 2022 Nitrokey GmbH
// SPDX-License-Identifier: LGPL-3.0-only

#![cfg(feature = "virt")]

mod common;

use std::env;
use std::process::Command;

use ganges_fingerprint::backend::virtual_platform::{
    Call, VirtualDevice, VirtualKeystore, VirtualTrustlet,
};
use ganges_fingerprint::{Error, RequestStatus, Step};
use test_log::test;

use common::{options, with_trustlet, Hal};

fn start(device: VirtualDevice, trustlet: VirtualTrustlet) -> Result<Hal, Error> {
    Hal::new(device, &VirtualKeystore::default(), trustlet, options())
}

#[test]
fn every_core_step_is_fatal() {
    for (call, step) in [
        (Call::SetDataPath, Step::SetDataPath),
        (Call::SetMasterKey, Step::SetMasterKey),
        (Call::InitializeSensor, Step::InitializeSensor),
        (Call::InitializeAlgo, Step::InitializeAlgo),
        (Call::Calibrate, Step::Calibrate),
    ] {
        let device = VirtualDevice::default();
        let trustlet = VirtualTrustlet::default();
        trustlet.fail(call, -7);
        let err = start(device.clone(), trustlet).expect_err("startup should fail");
        assert_eq!(err, Error::Init { step, rc: -7 });
        assert!(err.is_fatal());
        assert_eq!(device.enable_count(), 1);
        assert!(!device.is_enabled(), "{step:?} left the device enabled");
    }
}

#[test]
fn missing_key_disables_device() {
    let device = VirtualDevice::default();
    let err = Hal::new(
        device.clone(),
        &VirtualKeystore::empty(),
        VirtualTrustlet::default(),
        options(),
    )
    .expect_err("startup should fail");
    assert_eq!(err, Error::KeyProvisioning);
    assert_eq!(device.enable_count(), 1);
    assert!(!device.is_enabled());
}

const ABORT_CHILD: &str = "GANGES_FINGERPRINT_ABORT_CHILD";

#[test]
fn fatal_startup_aborts_process() {
    if env::var_os(ABORT_CHILD).is_some() {
        let trustlet = VirtualTrustlet::default();
        trustlet.fail(Call::InitializeSensor, -3);
        Hal::new_or_abort(
            VirtualDevice::default(),
            &VirtualKeystore::default(),
            trustlet,
            options(),
        );
        return;
    }

    let output = Command::new(env::current_exe().unwrap())
        .args([
            "fatal_startup_aborts_process",
            "--exact",
            "--nocapture",
            "--test-threads=1",
        ])
        .env(ABORT_CHILD, "1")
        .env("RUST_LOG", "error")
        .output()
        .unwrap();
    let log = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(!output.status.success(), "child survived: {log}");
    #[cfg(unix)]
    assert_eq!(output.status.code(), None, "child exited instead of aborting: {log}");
    assert!(log.contains("InitializeSensor failed with rc = -3"), "{log}");
}

#[test]
fn broken_device() {
    let err = Hal::new(
        VirtualDevice::broken(),
        &VirtualKeystore::default(),
        VirtualTrustlet::default(),
        options(),
    )
    .expect_err("startup should fail");
    assert_eq!(err, Error::Device);
}

#[test]
fn work_mode_failure_keeps_adapter_usable() {
    let trustlet = VirtualTrustlet::default();
    trustlet.fail(Call::SetWorkMode, 1);
    trustlet.insert_prints(0, &[6]);
    let (hal, _recorder, rx) = with_trustlet(trustlet);
    assert_eq!(
        hal.startup_error(),
        Some(Error::Init {
            step: Step::SetWorkMode,
            rc: 1
        })
    );
    assert_eq!(hal.enumerate(), RequestStatus::SysOk);
    assert_eq!(rx.try_iter().count(), 1);
}

#[test]
fn custom_options() {
    let mut options = options();
    options.data_path = "/mnt/vendor/fpdata".into();
    options.work_mode = 0;
    let hal = Hal::new(
        VirtualDevice::default(),
        &VirtualKeystore::default(),
        VirtualTrustlet::default(),
        options,
    )
    .unwrap();
    assert_eq!(
        hal.trustlet().data_path().as_deref(),
        Some("/mnt/vendor/fpdata")
    );
    assert_eq!(hal.trustlet().work_mode(), Some(0));
    assert_eq!(hal.options().work_mode, 0);
}
