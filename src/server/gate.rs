//! Device gate: serializes driver invocations and fences them off once the
//! driver has been released.
//!
//! Every invocation holds the read side of `live` for its whole duration, so
//! [`DeviceGate::release`] (write side) waits for in-flight calls and no call can
//! start afterwards, whichever worker or background task it comes from.

use parking_lot::{Mutex, RwLock};

#[derive(Debug)]
pub(crate) struct DeviceGate {
    live: RwLock<bool>,
    exclusive: Mutex<()>,
}

impl Default for DeviceGate {
    fn default() -> Self {
        Self {
            live: RwLock::new(true),
            exclusive: Mutex::new(()),
        }
    }
}

impl DeviceGate {
    /// Run `f` against the driver, under the dispatch lock when `exclusive`.
    ///
    /// Returns `None` without running `f` once the driver has been released.
    /// Blocks; call from the blocking pool.
    pub(crate) fn run<T>(&self, exclusive: bool, f: impl FnOnce() -> T) -> Option<T> {
        let live = self.live.read();
        if !*live {
            return None;
        }
        let _device = exclusive.then(|| self.exclusive.lock());
        Some(f())
    }

    /// Close the gate and run `cleanup` once no invocation is in flight.
    ///
    /// Returns `false` if the gate was already closed; `cleanup` is then not run.
    pub(crate) fn release(&self, cleanup: impl FnOnce()) -> bool {
        let mut live = self.live.write();
        if !*live {
            return false;
        }
        *live = false;
        cleanup();
        true
    }

    pub(crate) fn is_released(&self) -> bool {
        !*self.live.read()
    }
}
