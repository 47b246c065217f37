//! Capability interfaces and the bindings that implement them.
//!
//! An [`Interface`] is the declared contract of a service: method names with
//! their parameter and return descriptors. [`Bindings`] is what an instance
//! actually offers: typed async closures over a shared `Arc<S>`. The two are
//! checked against each other when a
//! [`ServiceDescriptor`](super::ServiceDescriptor) is built.
//!
//! # Example
//!
//! ```ignore
//! let interface = Interface::new("UserService")
//!     .method::<(String, Query), Result<User, String>>("GetUser")
//!     .method::<(), Fallible<String>>("Flush");
//!
//! let bindings = Bindings::new(UserStore::default())
//!     .bind("GetUser", |svc, (name, query): (String, Query)| async move {
//!         svc.get_user(&name, query).await
//!     })
//!     .bind("Flush", |svc, (): ()| async move { svc.flush().await.into() });
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use super::context::CallContext;
use super::types::{ArgError, CallOutcome, MethodArgs, MethodReturn, TypeDescriptor};
use crate::protocol::OpaqueValue;

/// Boxed future for method results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Type-erased method handle.
///
/// Coerces the wire arguments first and only then hands back the future that
/// runs the method, so decode failures never reach the worker pool.
pub type Callable = Arc<
    dyn Fn(CallContext, &[OpaqueValue]) -> Result<BoxFuture<'static, CallOutcome>, ArgError>
        + Send
        + Sync,
>;

/// Declared shape of one method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSignature {
    pub name: String,
    /// All parameters, including a leading [`CallContext`] slot if any.
    pub param_types: Vec<TypeDescriptor>,
    pub return_types: Vec<TypeDescriptor>,
}

/// Declared capability interface of a service.
#[derive(Debug, Clone)]
pub struct Interface {
    name: String,
    methods: Vec<MethodSignature>,
}

impl Interface {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
        }
    }

    /// Declare a method taking positional wire arguments `A`.
    pub fn method<A: MethodArgs, R: MethodReturn>(self, name: &str) -> Self {
        self.declare(name, A::param_types(), R::return_types())
    }

    /// Declare a method whose first parameter is an injected [`CallContext`].
    pub fn method_with_context<A: MethodArgs, R: MethodReturn>(self, name: &str) -> Self {
        let mut params = vec![TypeDescriptor::of::<CallContext>()];
        params.extend(A::param_types());
        self.declare(name, params, R::return_types())
    }

    /// Declare a method from explicit descriptors.
    pub fn declare(
        mut self,
        name: &str,
        param_types: Vec<TypeDescriptor>,
        return_types: Vec<TypeDescriptor>,
    ) -> Self {
        self.methods.push(MethodSignature {
            name: name.to_string(),
            param_types,
            return_types,
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn methods(&self) -> &[MethodSignature] {
        &self.methods
    }
}

/// One method an instance provides.
#[derive(Clone)]
pub struct Binding {
    pub(crate) signature: MethodSignature,
    pub(crate) callable: Callable,
}

/// Methods bound to a shared service instance.
pub struct Bindings<S> {
    instance: Arc<S>,
    methods: Vec<Binding>,
}

impl<S: Send + Sync + 'static> Bindings<S> {
    pub fn new(instance: S) -> Self {
        Self::from_arc(Arc::new(instance))
    }

    pub fn from_arc(instance: Arc<S>) -> Self {
        Self {
            instance,
            methods: Vec::new(),
        }
    }

    /// Bind a method that only takes wire arguments.
    pub fn bind<A, R, F, Fut>(self, name: &str, f: F) -> Self
    where
        A: MethodArgs,
        R: MethodReturn,
        F: Fn(Arc<S>, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
    {
        let instance = Arc::clone(&self.instance);
        let callable: Callable = Arc::new(
            move |_ctx: CallContext,
                  args: &[OpaqueValue]|
                  -> Result<BoxFuture<'static, CallOutcome>, ArgError> {
                let args = A::decode(args)?;
                let fut = f(Arc::clone(&instance), args);
                Ok(Box::pin(async move { fut.await.into_outcome() }))
            },
        );
        self.bind_raw(name, A::param_types(), R::return_types(), callable)
    }

    /// Bind a method that also receives the [`CallContext`].
    pub fn bind_with_context<A, R, F, Fut>(self, name: &str, f: F) -> Self
    where
        A: MethodArgs,
        R: MethodReturn,
        F: Fn(Arc<S>, CallContext, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
    {
        let instance = Arc::clone(&self.instance);
        let callable: Callable = Arc::new(
            move |ctx: CallContext,
                  args: &[OpaqueValue]|
                  -> Result<BoxFuture<'static, CallOutcome>, ArgError> {
                let args = A::decode(args)?;
                let fut = f(Arc::clone(&instance), ctx, args);
                Ok(Box::pin(async move { fut.await.into_outcome() }))
            },
        );
        let mut params = vec![TypeDescriptor::of::<CallContext>()];
        params.extend(A::param_types());
        self.bind_raw(name, params, R::return_types(), callable)
    }

    /// Bind a pre-built callable under explicit descriptors.
    pub fn bind_raw(
        mut self,
        name: &str,
        param_types: Vec<TypeDescriptor>,
        return_types: Vec<TypeDescriptor>,
        callable: Callable,
    ) -> Self {
        self.methods.push(Binding {
            signature: MethodSignature {
                name: name.to_string(),
                param_types,
                return_types,
            },
            callable,
        });
        self
    }

    /// The bound instance.
    pub fn instance(&self) -> &Arc<S> {
        &self.instance
    }

    pub(crate) fn into_bindings(self) -> Vec<Binding> {
        self.methods
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::Fallible;
    use std::collections::HashMap;
    use tokio::time::Instant;

    struct Counter;

    fn ctx() -> CallContext {
        CallContext::new("/c", "m", "local", HashMap::new(), Instant::now())
    }

    #[test]
    fn test_interface_declarations() {
        let iface = Interface::new("Counter")
            .method::<(i64, i64), Result<i64, String>>("Add")
            .method_with_context::<(String,), Fallible<String>>("Log");

        assert_eq!(iface.name(), "Counter");
        let methods = iface.methods();
        assert_eq!(methods.len(), 2);
        assert_eq!(methods[0].param_types.len(), 2);
        assert_eq!(methods[1].param_types[0], TypeDescriptor::of::<CallContext>());
        assert_eq!(methods[1].return_types.len(), 1);
    }

    #[tokio::test]
    async fn test_bound_callable_decodes_then_runs() {
        let bindings = Bindings::new(Counter).bind("Add", |_svc, (a, b): (i64, i64)| async move {
            Ok::<_, String>(a + b)
        });
        let methods = bindings.into_bindings();
        let args = [
            OpaqueValue::encode(&2).unwrap(),
            OpaqueValue::encode(&3).unwrap(),
        ];

        let fut = (methods[0].callable)(ctx(), &args).unwrap();
        match fut.await {
            CallOutcome::Value(Ok(v)) => assert_eq!(v.as_json(), "5"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_bound_callable_rejects_bad_args() {
        let bindings = Bindings::new(Counter).bind("Add", |_svc, (a, b): (i64, i64)| async move {
            Ok::<_, String>(a + b)
        });
        let methods = bindings.into_bindings();
        let args = [
            OpaqueValue::encode(&2).unwrap(),
            OpaqueValue::encode("x").unwrap(),
        ];

        let err = (methods[0].callable)(ctx(), &args).err().unwrap();
        assert!(matches!(err, ArgError::Decode { index: 1, .. }));
    }

    #[tokio::test]
    async fn test_context_binding_sees_call_context() {
        let bindings = Bindings::new(Counter).bind_with_context(
            "Who",
            |_svc, ctx: CallContext, (): ()| async move { Ok::<_, String>(ctx.source_address().to_string()) },
        );
        let methods = bindings.into_bindings();
        assert_eq!(methods[0].signature.param_types.len(), 1);

        let fut = (methods[0].callable)(ctx(), &[]).unwrap();
        match fut.await {
            CallOutcome::Value(Ok(v)) => assert_eq!(v.as_json(), "\"local\""),
            other => panic!("unexpected {:?}", other),
        }
    }
}
