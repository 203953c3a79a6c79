// Copyright (C) 2022 Nitrokey GmbH
// SPDX-License-Identifier: LGPL-3.0-only

use std::sync::Arc;

use crate::callback::{ClientCallback, Notification};
use crate::error::Error;
use crate::types::GroupId;

/// Mutable adapter state shared between request threads and the worker.
///
/// Group id and callback live under the same lock so that a request always sees a consistent
/// pair.
#[derive(Debug, Default)]
pub struct Session {
    pub gid: GroupId,
    /// Challenge issued by the last `pre_enroll`, until `post_enroll`.
    pub challenge: Option<u64>,
    callback: Option<Arc<dyn ClientCallback>>,
}

impl Session {
    pub fn check_group(&self, gid: GroupId) -> Result<(), Error> {
        if gid == self.gid {
            Ok(())
        } else {
            Err(Error::InvalidGroup)
        }
    }

    pub fn set_callback(&mut self, callback: Arc<dyn ClientCallback>) {
        self.callback = Some(callback);
    }

    /// Snapshot of the registered callback.
    pub fn listener(&self, device_id: u64) -> Listener {
        Listener {
            callback: self.callback.clone(),
            device_id,
        }
    }
}

/// The callback that was registered when a request started.
#[derive(Debug, Clone)]
pub struct Listener {
    callback: Option<Arc<dyn ClientCallback>>,
    device_id: u64,
}

impl Listener {
    pub fn notify(&self, notification: Notification) {
        match &self.callback {
            Some(callback) => {
                trace!("Notifying {notification:?}");
                notification.send(callback.as_ref(), self.device_id);
            }
            None => warn!("No callback registered, dropping {notification:?}"),
        }
    }
}
