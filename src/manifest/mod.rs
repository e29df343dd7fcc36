//! Capability manifest: the declared surface of a wrapped driver.
//!
//! A [`CapabilityManifest`] lists, in registration order, every operation a
//! remote client may invoke together with its parameter schema and access
//! requirements. It is produced once per server by [`ManifestBuilder`], sent
//! verbatim in `HELLO_ACK`, and never mutated afterwards.
//!
//! Clients compare [`CapabilityManifest::fingerprint`] against the fingerprint
//! advertised by the server (and optionally against an expected one) so that a
//! renamed or re-typed operation is caught at connect time rather than on the
//! first call.

pub mod builder;

pub use builder::{ManifestBuilder, OperationBuilder, PropertyBuilder};

use crate::error::{AppResult, ProxyError};
use crate::protocol::CallArgs;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Value type accepted by a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    /// Any JSON number.
    Float,
    /// A JSON integer.
    Integer,
    /// `true` or `false`.
    Bool,
    /// A JSON string.
    String,
    /// No type check.
    Any,
}

impl ParamKind {
    fn accepts(self, value: &Value) -> bool {
        match self {
            ParamKind::Float => value.is_number(),
            ParamKind::Integer => value.is_i64() || value.is_u64(),
            ParamKind::Bool => value.is_boolean(),
            ParamKind::String => value.is_string(),
            ParamKind::Any => true,
        }
    }
}

/// One declared parameter of an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    /// Keyword name, also used in error messages.
    pub name: String,
    /// Accepted JSON type.
    pub kind: ParamKind,
    /// Calls missing a required parameter fail with `InvalidArguments`.
    pub required: bool,
}

/// Manifest entry for a single remotely callable operation or property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationSpec {
    /// Name used in `CALL` frames.
    pub name: String,
    /// Free-form description for humans.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<String>,
    /// Parameters of a method, or the single value parameter of a writable property.
    pub params: Vec<ParamSpec>,
    /// Methods: calling needs admin. Properties: writing needs admin.
    pub requires_admin: bool,
    /// Called without arguments it reads, with one value it writes.
    pub is_property: bool,
    /// Only meaningful for properties.
    pub writable: bool,
    /// Runs without taking the server-wide dispatch lock.
    pub concurrency_safe: bool,
    /// The emergency-stop operation invoked by `ProxyClient::abort`.
    pub interrupt: bool,
    /// `false`: the server acknowledges the call at once, runs it in the
    /// background and hands the outcome out on `GET_RESULT`.
    #[serde(default = "default_blocking")]
    pub blocking: bool,
}

fn default_blocking() -> bool {
    true
}

impl OperationSpec {
    /// True when a call with `args` would mutate the device and therefore needs admin.
    pub fn needs_admin(&self, args: &CallArgs) -> bool {
        if self.is_property {
            self.requires_admin && !args.is_empty()
        } else {
            self.requires_admin
        }
    }

    /// Check `args` against the declared parameter schema.
    pub fn validate(&self, args: &CallArgs) -> AppResult<()> {
        if self.is_property {
            return self.validate_property_access(args);
        }

        if args.positional.len() > self.params.len() {
            return Err(ProxyError::InvalidArguments(format!(
                "{} takes at most {} argument(s), {} given",
                self.name,
                self.params.len(),
                args.positional.len()
            )));
        }

        for keyword in args.keyword.keys() {
            let position = self.params.iter().position(|p| &p.name == keyword);
            match position {
                None => {
                    return Err(ProxyError::InvalidArguments(format!(
                        "{} got an unexpected keyword argument '{}'",
                        self.name, keyword
                    )))
                }
                Some(index) if index < args.positional.len() => {
                    return Err(ProxyError::InvalidArguments(format!(
                        "{} got multiple values for argument '{}'",
                        self.name, keyword
                    )))
                }
                Some(_) => {}
            }
        }

        for (index, param) in self.params.iter().enumerate() {
            match args.value(index, &param.name) {
                Some(value) if !param.kind.accepts(value) => {
                    return Err(ProxyError::InvalidArguments(format!(
                        "{}: argument '{}' expects {:?}, got {}",
                        self.name, param.name, param.kind, value
                    )))
                }
                None if param.required => {
                    return Err(ProxyError::InvalidArguments(format!(
                        "{} missing required argument '{}'",
                        self.name, param.name
                    )))
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn validate_property_access(&self, args: &CallArgs) -> AppResult<()> {
        if args.is_empty() {
            return Ok(());
        }
        if !self.writable {
            return Err(ProxyError::InvalidArguments(format!(
                "property '{}' is read-only",
                self.name
            )));
        }
        if args.positional.len() != 1 || !args.keyword.is_empty() {
            return Err(ProxyError::InvalidArguments(format!(
                "setting property '{}' takes exactly one positional value",
                self.name
            )));
        }
        if let Some(param) = self.params.first() {
            if !param.kind.accepts(&args.positional[0]) {
                return Err(ProxyError::InvalidArguments(format!(
                    "property '{}' expects {:?}, got {}",
                    self.name, param.kind, args.positional[0]
                )));
            }
        }
        Ok(())
    }
}

/// Ordered, immutable description of a driver's remote surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityManifest {
    /// Driver type name.
    pub driver: String,
    /// Declared operations, in registration order.
    pub operations: Vec<OperationSpec>,
}

impl CapabilityManifest {
    /// Look up an operation by name.
    pub fn operation(&self, name: &str) -> Option<&OperationSpec> {
        self.operations.iter().find(|op| op.name == name)
    }

    /// The declared interrupt operation, if any.
    pub fn interrupt_operation(&self) -> Option<&OperationSpec> {
        self.operations.iter().find(|op| op.interrupt)
    }

    /// Operation names in registration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.operations.iter().map(|op| op.name.as_str())
    }

    /// Hex SHA-256 of the canonical JSON encoding.
    ///
    /// Field order is fixed by the struct definitions and operations keep their
    /// registration order, so equal manifests always hash equally.
    pub fn fingerprint(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        format!("{:x}", Sha256::digest(&canonical))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn move_spec() -> OperationSpec {
        OperationSpec {
            name: "move".into(),
            doc: None,
            params: vec![
                ParamSpec {
                    name: "position".into(),
                    kind: ParamKind::Float,
                    required: true,
                },
                ParamSpec {
                    name: "relative".into(),
                    kind: ParamKind::Bool,
                    required: false,
                },
            ],
            requires_admin: true,
            is_property: false,
            writable: false,
            concurrency_safe: false,
            interrupt: false,
            blocking: true,
        }
    }

    fn speed_property(writable: bool) -> OperationSpec {
        OperationSpec {
            name: "speed".into(),
            doc: None,
            params: vec![ParamSpec {
                name: "value".into(),
                kind: ParamKind::Float,
                required: true,
            }],
            requires_admin: true,
            is_property: true,
            writable,
            concurrency_safe: false,
            interrupt: false,
            blocking: true,
        }
    }

    #[test]
    fn test_method_argument_validation() {
        let spec = move_spec();
        assert!(spec.validate(&CallArgs::positional([10])).is_ok());
        assert!(spec.validate(&CallArgs::none().with_keyword("position", 1.5)).is_ok());
        assert!(spec
            .validate(&CallArgs::positional([json!(1.0), json!(true)]))
            .is_ok());

        assert!(matches!(
            spec.validate(&CallArgs::none()),
            Err(ProxyError::InvalidArguments(_))
        ));
        assert!(matches!(
            spec.validate(&CallArgs::positional(["ten"])),
            Err(ProxyError::InvalidArguments(_))
        ));
        assert!(matches!(
            spec.validate(&CallArgs::positional([1, 2, 3])),
            Err(ProxyError::InvalidArguments(_))
        ));
        assert!(matches!(
            spec.validate(&CallArgs::positional([1]).with_keyword("position", 2)),
            Err(ProxyError::InvalidArguments(_))
        ));
        assert!(matches!(
            spec.validate(&CallArgs::positional([1]).with_keyword("velocity", 2)),
            Err(ProxyError::InvalidArguments(_))
        ));
    }

    #[test]
    fn test_property_reads_are_never_gated() {
        let spec = speed_property(true);
        assert!(!spec.needs_admin(&CallArgs::none()));
        assert!(spec.needs_admin(&CallArgs::positional([2.0])));
        assert!(move_spec().needs_admin(&CallArgs::none()));
    }

    #[test]
    fn test_read_only_property_rejects_writes() {
        let spec = speed_property(false);
        assert!(spec.validate(&CallArgs::none()).is_ok());
        assert!(matches!(
            spec.validate(&CallArgs::positional([2.0])),
            Err(ProxyError::InvalidArguments(_))
        ));
    }

    #[test]
    fn test_fingerprint_tracks_signature_changes() {
        let manifest = CapabilityManifest {
            driver: "DummyMotor".into(),
            operations: vec![move_spec()],
        };
        let same = manifest.clone();
        assert_eq!(manifest.fingerprint(), same.fingerprint());
        assert_eq!(manifest.fingerprint().len(), 64);

        let mut changed = manifest.clone();
        changed.operations[0].params[0].kind = ParamKind::Integer;
        assert_ne!(manifest.fingerprint(), changed.fingerprint());
    }
}
