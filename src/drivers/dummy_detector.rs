//! Simulated single-shot detector.

use crate::driver::{Driver, DriverFault};
use crate::manifest::{ManifestBuilder, ParamKind};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

const TICK: Duration = Duration::from_millis(5);

/// Detector that "exposes" for `exposure_time` seconds per snap.
pub struct DummyDetector {
    exposure_time: Mutex<f64>,
    frames: AtomicU64,
    acquiring: AtomicBool,
    abort_requested: AtomicBool,
}

impl DummyDetector {
    /// Detector with a 10 ms exposure.
    pub fn new() -> Self {
        Self::with_exposure(0.01)
    }

    /// Detector with the given exposure, in seconds.
    pub fn with_exposure(seconds: f64) -> Self {
        Self {
            exposure_time: Mutex::new(seconds),
            frames: AtomicU64::new(0),
            acquiring: AtomicBool::new(false),
            abort_requested: AtomicBool::new(false),
        }
    }

    /// Exposure per frame in seconds.
    pub fn exposure_time(&self) -> f64 {
        *self.exposure_time.lock()
    }

    /// Change the exposure; fails with `invalid_value` unless positive and finite.
    pub fn set_exposure_time(&self, seconds: f64) -> anyhow::Result<()> {
        if !(seconds > 0.0 && seconds.is_finite()) {
            return Err(DriverFault::new(
                "invalid_value",
                format!("exposure_time must be > 0, got {seconds}"),
            )
            .into());
        }
        *self.exposure_time.lock() = seconds;
        Ok(())
    }

    /// Frames acquired since start-up.
    pub fn frame_count(&self) -> u64 {
        self.frames.load(Ordering::SeqCst)
    }

    /// Acquire one frame. Returns `{"frame": n, "mean": counts}`.
    pub fn snap(&self) -> anyhow::Result<Value> {
        let exposure = Duration::from_secs_f64(self.exposure_time());
        self.abort_requested.store(false, Ordering::SeqCst);
        self.acquiring.store(true, Ordering::SeqCst);

        let began = Instant::now();
        let mut aborted = false;
        while began.elapsed() < exposure {
            if self.abort_requested.swap(false, Ordering::SeqCst) {
                aborted = true;
                break;
            }
            thread::sleep(TICK.min(exposure.saturating_sub(began.elapsed())));
        }
        self.acquiring.store(false, Ordering::SeqCst);

        if aborted {
            return Err(DriverFault::new("aborted", "acquisition aborted").into());
        }
        let frame = self.frames.fetch_add(1, Ordering::SeqCst) + 1;
        // Dark level plus signal proportional to exposure.
        let mean = 100.0 + 1.0e4 * exposure.as_secs_f64();
        Ok(json!({ "frame": frame, "mean": mean }))
    }

    /// Acquire `count` frames back to back; an abort ends the whole series.
    pub fn acquire_series(&self, count: u64) -> anyhow::Result<Value> {
        let mut frames = Vec::new();
        for _ in 0..count {
            frames.push(self.snap()?);
        }
        Ok(Value::Array(frames))
    }

    /// Stop a running acquisition. Returns whether one was running.
    pub fn abort(&self) -> bool {
        let acquiring = self.acquiring.load(Ordering::SeqCst);
        if acquiring {
            self.abort_requested.store(true, Ordering::SeqCst);
        }
        acquiring
    }
}

impl Default for DummyDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for DummyDetector {
    fn name(&self) -> &str {
        "DummyDetector"
    }

    fn register(builder: &mut ManifestBuilder<Self>) {
        builder
            .operation("snap")
            .requires_admin()
            .handler(|det: &DummyDetector, _| det.snap());
        builder
            .operation("acquire_series")
            .param("count", ParamKind::Integer)
            .requires_admin()
            .blocking(false)
            .doc("Acquire several frames in the background")
            .handler(|det: &DummyDetector, args| det.acquire_series(args.get(0, "count")?));
        builder
            .operation("frame_count")
            .handler(|det: &DummyDetector, _| Ok(json!(det.frame_count())));
        builder
            .property("exposure_time", ParamKind::Float)
            .requires_admin()
            .doc("Exposure per frame in seconds")
            .read_write(
                |det: &DummyDetector| Ok(json!(det.exposure_time())),
                |det: &DummyDetector, value| det.set_exposure_time(serde_json::from_value(value)?),
            );
        builder
            .operation("abort")
            .interrupt()
            .handler(|det: &DummyDetector, _| Ok(Value::Bool(det.abort())));
    }

    fn shutdown(&self) {
        self.abort();
    }
}
