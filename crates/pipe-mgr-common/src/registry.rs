//! Process-wide registry of per-device contexts.
//!
//! Each device gets a dynamically allocated context when it is brought up and
//! loses it when it is removed. Every lookup validates the device id against
//! the configured bound before touching the map.

use parking_lot::{Mutex, RwLock};
use pipe_mgr_types::{DevId, PipeMgrError, PipeResult};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Default number of devices a registry accepts.
pub const DEFAULT_MAX_DEVICES: DevId = 8;

/// Map from device id to a shared, lockable per-device context.
pub struct DeviceRegistry<T> {
    name: &'static str,
    max_devices: DevId,
    devices: RwLock<HashMap<DevId, Arc<Mutex<T>>>>,
}

impl<T> DeviceRegistry<T> {
    pub fn new(name: &'static str, max_devices: DevId) -> Self {
        Self {
            name,
            max_devices,
            devices: RwLock::new(HashMap::new()),
        }
    }

    pub fn max_devices(&self) -> DevId {
        self.max_devices
    }

    /// Rejects device ids outside `0..max_devices`.
    pub fn check_dev_id(&self, dev_id: DevId) -> PipeResult<()> {
        if dev_id >= self.max_devices {
            return Err(PipeMgrError::invalid_arg(format!(
                "{}: device id {} out of range (max {})",
                self.name, dev_id, self.max_devices
            )));
        }
        Ok(())
    }

    /// Registers a context for a device that has none yet.
    pub fn insert(&self, dev_id: DevId, ctx: T) -> PipeResult<Arc<Mutex<T>>> {
        self.check_dev_id(dev_id)?;
        let mut devices = self.devices.write();
        if devices.contains_key(&dev_id) {
            return Err(PipeMgrError::already_exists(format!(
                "{} context for device {}",
                self.name, dev_id
            )));
        }
        let ctx = Arc::new(Mutex::new(ctx));
        devices.insert(dev_id, Arc::clone(&ctx));
        info!(registry = self.name, dev_id, "Device context created");
        Ok(ctx)
    }

    /// Returns the context of a device, creating it on first use.
    pub fn get_or_init<F>(&self, dev_id: DevId, init: F) -> PipeResult<Arc<Mutex<T>>>
    where
        F: FnOnce() -> T,
    {
        self.check_dev_id(dev_id)?;
        if let Some(ctx) = self.devices.read().get(&dev_id) {
            return Ok(Arc::clone(ctx));
        }
        let mut devices = self.devices.write();
        let ctx = devices.entry(dev_id).or_insert_with(|| {
            debug!(registry = self.name, dev_id, "Device context created on first use");
            Arc::new(Mutex::new(init()))
        });
        Ok(Arc::clone(ctx))
    }

    pub fn get(&self, dev_id: DevId) -> PipeResult<Arc<Mutex<T>>> {
        self.check_dev_id(dev_id)?;
        self.devices
            .read()
            .get(&dev_id)
            .cloned()
            .ok_or_else(|| {
                PipeMgrError::not_found(format!("{} context for device {}", self.name, dev_id))
            })
    }

    /// Runs `f` with the device context locked.
    pub fn with_device<R, F>(&self, dev_id: DevId, f: F) -> PipeResult<R>
    where
        F: FnOnce(&mut T) -> PipeResult<R>,
    {
        let ctx = self.get(dev_id)?;
        let mut guard = ctx.lock();
        f(&mut guard)
    }

    /// Tears down the context of a removed device.
    pub fn remove(&self, dev_id: DevId) -> PipeResult<Arc<Mutex<T>>> {
        self.check_dev_id(dev_id)?;
        let removed = self.devices.write().remove(&dev_id);
        match removed {
            Some(ctx) => {
                info!(registry = self.name, dev_id, "Device context removed");
                Ok(ctx)
            }
            None => Err(PipeMgrError::not_found(format!(
                "{} context for device {}",
                self.name, dev_id
            ))),
        }
    }

    pub fn contains(&self, dev_id: DevId) -> bool {
        self.devices.read().contains_key(&dev_id)
    }

    pub fn device_ids(&self) -> Vec<DevId> {
        let mut ids: Vec<_> = self.devices.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
