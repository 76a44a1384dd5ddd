// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Scoped access to the hardware-ops transport.
//!
//! The device can be detached at any time (for example, when the underlying
//! auxiliary device goes away). Every operation acquires a [`DeviceRef`]
//! before touching the transport; dropping the reference releases it on every
//! path, and [`DeviceClient::detach`] waits until no references remain.

use crate::Error;
use parking_lot::Condvar;
use parking_lot::Mutex;
use std::ops::Deref;
use std::sync::Arc;

pub(crate) struct DeviceClient<T> {
    state: Mutex<ClientState<T>>,
    released: Condvar,
}

struct ClientState<T> {
    device: Option<Arc<T>>,
    users: usize,
}

impl<T> DeviceClient<T> {
    pub fn new(device: T) -> Self {
        Self {
            state: Mutex::new(ClientState {
                device: Some(Arc::new(device)),
                users: 0,
            }),
            released: Condvar::new(),
        }
    }

    /// Acquires the device, failing if it has been detached.
    pub fn acquire(&self) -> Result<DeviceRef<'_, T>, Error> {
        let mut state = self.state.lock();
        let device = state.device.clone().ok_or(Error::DeviceUnavailable)?;
        state.users += 1;
        Ok(DeviceRef {
            client: self,
            device,
        })
    }

    /// Detaches the device, waiting for all outstanding references to be
    /// released first. Returns `None` if already detached.
    pub fn detach(&self) -> Option<Arc<T>> {
        let mut state = self.state.lock();
        let device = state.device.take()?;
        while state.users != 0 {
            self.released.wait(&mut state);
        }
        Some(device)
    }

    /// The number of currently acquired references.
    #[cfg(test)]
    pub fn users(&self) -> usize {
        self.state.lock().users
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.users -= 1;
        if state.users == 0 {
            self.released.notify_all();
        }
    }
}

/// An acquired reference to the device.
pub(crate) struct DeviceRef<'a, T> {
    client: &'a DeviceClient<T>,
    device: Arc<T>,
}

impl<T> Deref for DeviceRef<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.device
    }
}

impl<T> Drop for DeviceRef<'_, T> {
    fn drop(&mut self) {
        self.client.release();
    }
}
