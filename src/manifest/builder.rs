//! Registration step that turns a driver type into a manifest plus dispatch table.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut builder = ManifestBuilder::<DummyMotor>::new("DummyMotor");
//! builder
//!     .operation("move")
//!     .param("position", ParamKind::Float)
//!     .requires_admin()
//!     .handler(|motor, args| {
//!         motor.move_to(args.get(0, "position")?)?;
//!         Ok(Value::Null)
//!     });
//! builder
//!     .property("speed", ParamKind::Float)
//!     .requires_admin()
//!     .read_write(|motor| Ok(json!(motor.speed())), |motor, v| motor.set_speed(v));
//! let table = builder.build()?;
//! ```

use super::{CapabilityManifest, OperationSpec, ParamKind, ParamSpec};
use crate::error::{AppResult, ProxyError};
use crate::protocol::CallArgs;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

type MethodFn<D> = Arc<dyn Fn(&D, &CallArgs) -> anyhow::Result<Value> + Send + Sync>;
type GetterFn<D> = Arc<dyn Fn(&D) -> anyhow::Result<Value> + Send + Sync>;
type SetterFn<D> = Arc<dyn Fn(&D, Value) -> anyhow::Result<()> + Send + Sync>;

enum Handler<D> {
    Method(MethodFn<D>),
    Property {
        get: GetterFn<D>,
        set: Option<SetterFn<D>>,
    },
}

/// A registered operation: its published spec and the code that runs it.
pub(crate) struct Operation<D> {
    pub(crate) spec: OperationSpec,
    handler: Handler<D>,
}

impl<D> Operation<D> {
    /// Run the operation against `driver`. Arguments must already be validated.
    pub(crate) fn invoke(&self, driver: &D, args: &CallArgs) -> anyhow::Result<Value> {
        match &self.handler {
            Handler::Method(f) => f(driver, args),
            Handler::Property { get, set } => match (args.positional.first(), set) {
                (None, _) => get(driver),
                (Some(value), Some(set)) => {
                    set(driver, value.clone())?;
                    Ok(Value::Null)
                }
                (Some(_), None) => Err(anyhow::anyhow!("property '{}' is read-only", self.spec.name)),
            },
        }
    }
}

/// Immutable manifest plus name-indexed handlers, shared by every session.
pub(crate) struct DispatchTable<D> {
    manifest: Arc<CapabilityManifest>,
    fingerprint: String,
    operations: HashMap<String, Arc<Operation<D>>>,
}

impl<D> DispatchTable<D> {
    pub(crate) fn manifest(&self) -> &Arc<CapabilityManifest> {
        &self.manifest
    }

    pub(crate) fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub(crate) fn get(&self, name: &str) -> Option<Arc<Operation<D>>> {
        self.operations.get(name).cloned()
    }
}

/// Collects operation declarations for driver type `D`.
pub struct ManifestBuilder<D> {
    driver: String,
    operations: Vec<Operation<D>>,
    conflicts: Vec<String>,
}

impl<D: 'static> ManifestBuilder<D> {
    /// Start a manifest for the driver type called `driver`.
    pub fn new(driver: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            operations: Vec::new(),
            conflicts: Vec::new(),
        }
    }

    /// Declare a method. Registration happens when [`OperationBuilder::handler`] is called.
    pub fn operation(&mut self, name: impl Into<String>) -> OperationBuilder<'_, D> {
        OperationBuilder {
            spec: OperationSpec {
                name: name.into(),
                doc: None,
                params: Vec::new(),
                requires_admin: false,
                is_property: false,
                writable: false,
                concurrency_safe: false,
                interrupt: false,
                blocking: true,
            },
            builder: self,
        }
    }

    /// Declare a property holding values of `kind`.
    pub fn property(&mut self, name: impl Into<String>, kind: ParamKind) -> PropertyBuilder<'_, D> {
        PropertyBuilder {
            spec: OperationSpec {
                name: name.into(),
                doc: None,
                params: Vec::new(),
                requires_admin: false,
                is_property: true,
                writable: false,
                concurrency_safe: false,
                interrupt: false,
                blocking: true,
            },
            kind,
            builder: self,
        }
    }

    fn push(&mut self, operation: Operation<D>) {
        if self
            .operations
            .iter()
            .any(|existing| existing.spec.name == operation.spec.name)
        {
            self.conflicts.push(operation.spec.name.clone());
            return;
        }
        self.operations.push(operation);
    }

    /// Names registered so far, in order.
    pub fn names(&self) -> Vec<&str> {
        self.operations.iter().map(|op| op.spec.name.as_str()).collect()
    }

    /// Freeze the declarations.
    ///
    /// Fails with `ManifestConflict` if a name was declared twice, more than one
    /// operation is flagged as the interrupt, or the interrupt is non-blocking.
    pub(crate) fn build(self) -> AppResult<DispatchTable<D>> {
        if let Some(name) = self.conflicts.first() {
            return Err(ProxyError::ManifestConflict(format!(
                "operation '{name}' is declared more than once in {}",
                self.driver
            )));
        }

        let interrupts: Vec<&str> = self
            .operations
            .iter()
            .filter(|op| op.spec.interrupt)
            .map(|op| op.spec.name.as_str())
            .collect();
        if interrupts.len() > 1 {
            return Err(ProxyError::ManifestConflict(format!(
                "{} declares several interrupt operations: {}",
                self.driver,
                interrupts.join(", ")
            )));
        }
        if let Some(op) = self
            .operations
            .iter()
            .find(|op| op.spec.interrupt && !op.spec.blocking)
        {
            return Err(ProxyError::ManifestConflict(format!(
                "interrupt '{}' of {} cannot run in the background",
                op.spec.name, self.driver
            )));
        }

        let manifest = CapabilityManifest {
            driver: self.driver,
            operations: self.operations.iter().map(|op| op.spec.clone()).collect(),
        };
        let fingerprint = manifest.fingerprint();
        let operations = self
            .operations
            .into_iter()
            .map(|op| (op.spec.name.clone(), Arc::new(op)))
            .collect();

        Ok(DispatchTable {
            manifest: Arc::new(manifest),
            fingerprint,
            operations,
        })
    }
}

/// Pending method declaration.
#[must_use = "an operation is only registered once `handler` is called"]
pub struct OperationBuilder<'a, D> {
    builder: &'a mut ManifestBuilder<D>,
    spec: OperationSpec,
}

impl<'a, D: 'static> OperationBuilder<'a, D> {
    /// Add a required parameter.
    pub fn param(mut self, name: impl Into<String>, kind: ParamKind) -> Self {
        self.spec.params.push(ParamSpec {
            name: name.into(),
            kind,
            required: true,
        });
        self
    }

    /// Add an optional parameter.
    pub fn optional_param(mut self, name: impl Into<String>, kind: ParamKind) -> Self {
        self.spec.params.push(ParamSpec {
            name: name.into(),
            kind,
            required: false,
        });
        self
    }

    /// Only the admin session may call this operation.
    pub fn requires_admin(mut self) -> Self {
        self.spec.requires_admin = true;
        self
    }

    /// Skip the dispatch lock for this operation.
    ///
    /// The handler may then run concurrently with any other driver call, so the
    /// driver state it touches must be safe for that.
    pub fn concurrency_safe(mut self) -> Self {
        self.spec.concurrency_safe = true;
        self
    }

    /// Mark this operation as the emergency stop. Implies `concurrency_safe`.
    pub fn interrupt(mut self) -> Self {
        self.spec.interrupt = true;
        self.spec.concurrency_safe = true;
        self
    }

    /// With `false`, the call is acknowledged immediately and runs in the
    /// background; the caller collects the outcome later. Each session may
    /// have one uncollected background call.
    pub fn blocking(mut self, blocking: bool) -> Self {
        self.spec.blocking = blocking;
        self
    }

    /// Human-readable description published in the manifest.
    pub fn doc(mut self, doc: impl Into<String>) -> Self {
        self.spec.doc = Some(doc.into());
        self
    }

    /// Attach the implementation and register the operation.
    pub fn handler<F>(self, f: F)
    where
        F: Fn(&D, &CallArgs) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.builder.push(Operation {
            spec: self.spec,
            handler: Handler::Method(Arc::new(f)),
        });
    }
}

/// Pending property declaration.
#[must_use = "a property is only registered once `read_only` or `read_write` is called"]
pub struct PropertyBuilder<'a, D> {
    builder: &'a mut ManifestBuilder<D>,
    spec: OperationSpec,
    kind: ParamKind,
}

impl<'a, D: 'static> PropertyBuilder<'a, D> {
    /// Writing the property needs admin. Reading never does.
    pub fn requires_admin(mut self) -> Self {
        self.spec.requires_admin = true;
        self
    }

    /// Skip the dispatch lock for reads and writes of this property.
    pub fn concurrency_safe(mut self) -> Self {
        self.spec.concurrency_safe = true;
        self
    }

    /// Human-readable description published in the manifest.
    pub fn doc(mut self, doc: impl Into<String>) -> Self {
        self.spec.doc = Some(doc.into());
        self
    }

    /// Register a property that can only be read.
    pub fn read_only<G>(self, get: G)
    where
        G: Fn(&D) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.builder.push(Operation {
            spec: self.spec,
            handler: Handler::Property {
                get: Arc::new(get),
                set: None,
            },
        });
    }

    /// Register a property with a getter and a setter.
    pub fn read_write<G, S>(mut self, get: G, set: S)
    where
        G: Fn(&D) -> anyhow::Result<Value> + Send + Sync + 'static,
        S: Fn(&D, Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.spec.writable = true;
        self.spec.params.push(ParamSpec {
            name: "value".to_string(),
            kind: self.kind,
            required: true,
        });
        self.builder.push(Operation {
            spec: self.spec,
            handler: Handler::Property {
                get: Arc::new(get),
                set: Some(Arc::new(set)),
            },
        });
    }
}
