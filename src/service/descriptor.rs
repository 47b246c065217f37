//! Service descriptors: the method table of one bound service.
//!
//! A descriptor is built once at startup by checking an instance's
//! [`Bindings`] against the declared [`Interface`]. After that the method
//! table is read-only and needs no locking; only the per-client counters
//! change.
//!
//! Method names are matched case-sensitively against the interface, but
//! stored lowercased: lookups from the wire are case-insensitive.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

use super::context::CallContext;
use super::interface::{Binding, Bindings, Callable, Interface};
use super::types::TypeDescriptor;
use crate::accounting::{ClientCallCounter, InvokePerClient};

/// Group id matching any deployment partition.
pub const DEFAULT_GROUP: &str = "*";

/// Why a service cannot be served. Always a deployment mistake.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("{service}: instance does not implement {interface}.{method}")]
    MissingMethod {
        service: String,
        interface: String,
        method: String,
    },

    #[error("{service}: {method} is bound as {bound} but declared as {declared}")]
    SignatureMismatch {
        service: String,
        method: String,
        declared: String,
        bound: String,
    },

    #[error("{service}: {method} must return 1 or 2 values ending in an error-like type, got {returns}")]
    InvalidReturnShape {
        service: String,
        method: String,
        returns: String,
    },

    #[error("{service}: {method} collides with another method once lowercased")]
    DuplicateMethod { service: String, method: String },
}

/// Registry entry for one callable method.
#[derive(Clone)]
pub struct MethodMeta {
    name: String,
    callable: Callable,
    param_types: Vec<TypeDescriptor>,
    return_types: Vec<TypeDescriptor>,
    wants_context: bool,
}

impl MethodMeta {
    /// Name as declared on the interface.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn callable(&self) -> &Callable {
        &self.callable
    }

    /// All declared parameters, including an injected context slot.
    pub fn param_types(&self) -> &[TypeDescriptor] {
        &self.param_types
    }

    pub fn return_types(&self) -> &[TypeDescriptor] {
        &self.return_types
    }

    /// First parameter is a [`CallContext`] supplied by the engine.
    pub fn wants_context(&self) -> bool {
        self.wants_context
    }

    /// Number of arguments expected on the wire.
    pub fn wire_arity(&self) -> usize {
        self.param_types.len() - usize::from(self.wants_context)
    }
}

impl fmt::Debug for MethodMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodMeta")
            .field("name", &self.name)
            .field("param_types", &self.param_types)
            .field("return_types", &self.return_types)
            .field("wants_context", &self.wants_context)
            .finish()
    }
}

/// A service instance bound to its routing key.
pub struct ServiceDescriptor {
    service_uri: String,
    group_id: String,
    interface: String,
    methods: HashMap<String, MethodMeta>,
    invokes: ClientCallCounter,
}

impl ServiceDescriptor {
    /// Build the method table, panicking on any deployment mistake.
    ///
    /// # Panics
    ///
    /// If the instance lacks a declared method, binds it with a different
    /// signature, a return shape is invalid, or two methods collide once
    /// lowercased.
    pub fn build<S: Send + Sync + 'static>(
        service_uri: &str,
        group_id: &str,
        bindings: Bindings<S>,
        interface: &Interface,
    ) -> Self {
        match Self::try_build(service_uri, group_id, bindings, interface) {
            Ok(descriptor) => descriptor,
            Err(e) => panic!("invalid service: {}", e),
        }
    }

    /// Build the method table, reporting mistakes as [`BuildError`].
    pub fn try_build<S: Send + Sync + 'static>(
        service_uri: &str,
        group_id: &str,
        bindings: Bindings<S>,
        interface: &Interface,
    ) -> Result<Self, BuildError> {
        let mut bound: HashMap<String, Binding> = bindings
            .into_bindings()
            .into_iter()
            .map(|b| (b.signature.name.clone(), b))
            .collect();

        let context = TypeDescriptor::of::<CallContext>();
        let mut methods = HashMap::with_capacity(interface.methods().len());

        for declared in interface.methods() {
            let binding = bound.remove(&declared.name).ok_or_else(|| BuildError::MissingMethod {
                service: service_uri.to_string(),
                interface: interface.name().to_string(),
                method: declared.name.clone(),
            })?;

            if binding.signature != *declared {
                return Err(BuildError::SignatureMismatch {
                    service: service_uri.to_string(),
                    method: declared.name.clone(),
                    declared: format_signature(&declared.param_types, &declared.return_types),
                    bound: format_signature(
                        &binding.signature.param_types,
                        &binding.signature.return_types,
                    ),
                });
            }

            let returns = &declared.return_types;
            let shape_ok = matches!(returns.len(), 1 | 2)
                && returns.last().map_or(false, TypeDescriptor::is_error_like);
            if !shape_ok {
                return Err(BuildError::InvalidReturnShape {
                    service: service_uri.to_string(),
                    method: declared.name.clone(),
                    returns: format!("{:?}", returns),
                });
            }

            let meta = MethodMeta {
                name: declared.name.clone(),
                callable: binding.callable,
                param_types: declared.param_types.clone(),
                return_types: declared.return_types.clone(),
                wants_context: declared.param_types.first() == Some(&context),
            };
            if methods.insert(declared.name.to_lowercase(), meta).is_some() {
                return Err(BuildError::DuplicateMethod {
                    service: service_uri.to_string(),
                    method: declared.name.clone(),
                });
            }
        }

        for extra in bound.keys() {
            tracing::debug!(service = %service_uri, method = %extra, "bound method not in interface, ignored");
        }

        Ok(Self {
            service_uri: service_uri.to_string(),
            group_id: if group_id.is_empty() {
                DEFAULT_GROUP.to_string()
            } else {
                group_id.to_string()
            },
            interface: interface.name().to_string(),
            methods,
            invokes: ClientCallCounter::new(),
        })
    }

    pub fn service_uri(&self) -> &str {
        &self.service_uri
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn interface_name(&self) -> &str {
        &self.interface
    }

    /// Case-insensitive method lookup.
    pub fn method(&self, name: &str) -> Option<&MethodMeta> {
        match self.methods.get(name) {
            Some(meta) => Some(meta),
            None => self.methods.get(&name.to_lowercase()),
        }
    }

    /// Lowercased method names, sorted.
    pub fn method_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Per-client call counters for this service.
    pub fn invokes(&self) -> &ClientCallCounter {
        &self.invokes
    }

    /// Per-client, per-method call counts.
    pub fn list_invokes(&self) -> Vec<InvokePerClient> {
        self.invokes.snapshot(&self.service_uri)
    }
}

impl fmt::Debug for ServiceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDescriptor")
            .field("service_uri", &self.service_uri)
            .field("group_id", &self.group_id)
            .field("interface", &self.interface)
            .field("methods", &self.method_names())
            .finish()
    }
}

fn format_signature(params: &[TypeDescriptor], returns: &[TypeDescriptor]) -> String {
    format!("{:?} -> {:?}", params, returns)
}
