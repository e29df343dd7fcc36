//! Simulated motion stage.
//!
//! Moves at `speed` mm/s and updates its position while travelling, so `status`
//! (which does not take the dispatch lock) can watch a move in progress and
//! `abort` can stop it half way.

use crate::driver::{Driver, DriverFault};
use crate::manifest::{ManifestBuilder, ParamKind};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

const TICK: Duration = Duration::from_millis(5);

/// Mock motion stage with realistic timing
///
/// ```rust,ignore
/// let motor = DummyMotor::with_speed(100.0);
/// motor.move_to(10.0)?; // takes ~100 ms
/// assert_eq!(motor.position(), 10.0);
/// ```
pub struct DummyMotor {
    position: Mutex<f64>,
    speed: Mutex<f64>,
    moving: AtomicBool,
    abort_requested: AtomicBool,
}

impl DummyMotor {
    /// Stage at 0 mm moving at 10 mm/s.
    pub fn new() -> Self {
        Self::with_speed(10.0)
    }

    /// Stage at 0 mm moving at `speed_mm_per_sec`.
    pub fn with_speed(speed_mm_per_sec: f64) -> Self {
        Self {
            position: Mutex::new(0.0),
            speed: Mutex::new(speed_mm_per_sec),
            moving: AtomicBool::new(false),
            abort_requested: AtomicBool::new(false),
        }
    }

    /// Current position in mm, updated while moving.
    pub fn position(&self) -> f64 {
        *self.position.lock()
    }

    /// Travel speed in mm/s.
    pub fn speed(&self) -> f64 {
        *self.speed.lock()
    }

    /// Change the speed; fails with `invalid_value` unless positive and finite.
    pub fn set_speed(&self, speed: f64) -> anyhow::Result<()> {
        if !(speed > 0.0 && speed.is_finite()) {
            return Err(DriverFault::new("invalid_value", format!("speed must be > 0, got {speed}")).into());
        }
        *self.speed.lock() = speed;
        Ok(())
    }

    /// Blocking move to `target`. Fails with kind `aborted` if interrupted.
    pub fn move_to(&self, target: f64) -> anyhow::Result<()> {
        if !target.is_finite() {
            return Err(DriverFault::new("invalid_value", "target position must be finite").into());
        }
        let start = self.position();
        let travel = Duration::from_secs_f64((target - start).abs() / self.speed());
        self.abort_requested.store(false, Ordering::SeqCst);
        self.moving.store(true, Ordering::SeqCst);
        tracing::debug!(from = start, to = target, ?travel, "DummyMotor moving");

        let began = Instant::now();
        let outcome: anyhow::Result<()> = loop {
            let elapsed = began.elapsed();
            if elapsed >= travel {
                *self.position.lock() = target;
                break Ok(());
            }
            let fraction = elapsed.as_secs_f64() / travel.as_secs_f64();
            *self.position.lock() = start + (target - start) * fraction;
            if self.abort_requested.swap(false, Ordering::SeqCst) {
                break Err(DriverFault::new(
                    "aborted",
                    format!("move to {target} aborted at {:.3}", self.position()),
                )
                .into());
            }
            thread::sleep(TICK.min(travel - elapsed));
        };
        self.moving.store(false, Ordering::SeqCst);
        outcome
    }

    /// Request a running move to stop. Returns whether a move was running.
    pub fn abort(&self) -> bool {
        let moving = self.moving.load(Ordering::SeqCst);
        if moving {
            self.abort_requested.store(true, Ordering::SeqCst);
        }
        moving
    }

    /// Whether a move is in progress.
    pub fn is_moving(&self) -> bool {
        self.moving.load(Ordering::SeqCst)
    }
}

impl Default for DummyMotor {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for DummyMotor {
    fn name(&self) -> &str {
        "DummyMotor"
    }

    fn register(builder: &mut ManifestBuilder<Self>) {
        builder
            .operation("get_position")
            .doc("Current position in mm")
            .handler(|motor: &DummyMotor, _| Ok(json!(motor.position())));
        builder
            .operation("move")
            .param("position", ParamKind::Float)
            .requires_admin()
            .doc("Move to an absolute position in mm, blocking until reached")
            .handler(|motor: &DummyMotor, args| {
                motor.move_to(args.get(0, "position")?)?;
                Ok(json!(motor.position()))
            });
        builder
            .operation("status")
            .concurrency_safe()
            .handler(|motor: &DummyMotor, _| {
                Ok(json!({
                    "position": motor.position(),
                    "moving": motor.is_moving(),
                    "speed": motor.speed(),
                }))
            });
        builder
            .operation("abort")
            .interrupt()
            .doc("Stop a running move")
            .handler(|motor: &DummyMotor, _| Ok(Value::Bool(motor.abort())));
        builder
            .property("speed", ParamKind::Float)
            .requires_admin()
            .doc("Travel speed in mm/s")
            .read_write(
                |motor: &DummyMotor| Ok(json!(motor.speed())),
                |motor: &DummyMotor, value| motor.set_speed(serde_json::from_value(value)?),
            );
        builder
            .property("pos", ParamKind::Float)
            .read_only(|motor: &DummyMotor| Ok(json!(motor.position())));
    }

    fn shutdown(&self) {
        self.abort();
        tracing::info!(position = self.position(), "DummyMotor parked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_move_reaches_target() {
        let motor = DummyMotor::with_speed(1000.0);
        motor.move_to(5.0).unwrap();
        assert_eq!(motor.position(), 5.0);
        assert!(!motor.is_moving());
    }

    #[test]
    fn test_abort_stops_midway() {
        let motor = Arc::new(DummyMotor::with_speed(10.0));
        let mover = {
            let motor = Arc::clone(&motor);
            thread::spawn(move || motor.move_to(100.0))
        };
        while !motor.is_moving() {
            thread::sleep(Duration::from_millis(1));
        }
        thread::sleep(Duration::from_millis(20));
        assert!(motor.abort());

        let err = mover.join().unwrap().unwrap_err();
        assert_eq!(err.downcast_ref::<DriverFault>().unwrap().kind, "aborted");
        assert!(motor.position() < 100.0);
        assert!(!motor.abort());
    }

    #[test]
    fn test_speed_must_be_positive() {
        let motor = DummyMotor::new();
        assert!(motor.set_speed(0.0).is_err());
        assert!(motor.set_speed(-1.0).is_err());
        motor.set_speed(2.5).unwrap();
        assert_eq!(motor.speed(), 2.5);
    }

    #[test]
    fn test_manifest_shape() {
        let mut builder = ManifestBuilder::new("DummyMotor");
        DummyMotor::register(&mut builder);
        let table = builder.build().unwrap();
        let manifest = table.manifest();

        assert!(manifest.operation("move").unwrap().requires_admin);
        assert!(!manifest.operation("get_position").unwrap().requires_admin);
        assert_eq!(manifest.interrupt_operation().unwrap().name, "abort");
        let pos = manifest.operation("pos").unwrap();
        assert!(pos.is_property && !pos.writable);
        let speed = manifest.operation("speed").unwrap();
        assert!(speed.is_property && speed.writable && speed.requires_admin);
    }
}
