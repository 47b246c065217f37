//! Invocation engine: request in, at most one response out.
//!
//! For each request the engine:
//!
//! 1. drops it silently if its budget was already spent before it got here
//! 2. resolves service and method (misses answer 404/405)
//! 3. counts the call per client and in the aggregate `received` flow
//! 4. checks the argument count (400) and coerces every argument (502)
//! 5. hands the prepared call to the [`WorkerPool`] and races it against
//!    the remaining budget
//! 6. turns the outcome into a [`Response`], unless the budget ran out
//!    while the worker was finishing, in which case nothing is delivered
//!
//! Nothing a method does (panic, error, hang) escapes as anything but a
//! response code.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::accounting::CallAccounting;
use crate::error::Result;
use crate::pool::{panic_message, TaskResult, WorkerPool};
use crate::protocol::{now_millis, ErrorCode, Request, Response};
use crate::service::{CallContext, CallOutcome, MethodMeta, ServiceDescriptor};

/// Calls slower than this are logged.
const SLOW_CALL: Duration = Duration::from_secs(1);

/// Resolves and executes requests against the registered services.
pub struct InvocationEngine {
    services: HashMap<String, Arc<ServiceDescriptor>>,
    pool: WorkerPool,
    accounting: Arc<CallAccounting>,
}

impl InvocationEngine {
    pub fn new(
        services: impl IntoIterator<Item = Arc<ServiceDescriptor>>,
        pool: WorkerPool,
        accounting: Arc<CallAccounting>,
    ) -> Self {
        let services = services
            .into_iter()
            .map(|s| (s.service_uri().to_string(), s))
            .collect();
        Self {
            services,
            pool,
            accounting,
        }
    }

    pub fn service(&self, service_uri: &str) -> Option<&Arc<ServiceDescriptor>> {
        self.services.get(service_uri)
    }

    pub fn services(&self) -> impl Iterator<Item = &Arc<ServiceDescriptor>> {
        self.services.values()
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn accounting(&self) -> &Arc<CallAccounting> {
        &self.accounting
    }

    /// Execute one request and hand its response to `on_complete`.
    ///
    /// `on_complete` runs at most once: never for a stale request, and never
    /// when the result showed up after the deadline. A failure inside
    /// `on_complete` is logged, not retried.
    pub async fn invoke<F, Fut>(&self, request: Request, on_complete: F)
    where
        F: FnOnce(Response) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let started = Instant::now();
        let remaining = request.remaining_millis(now_millis());
        if remaining <= 0 {
            tracing::warn!(
                service = %request.service_uri,
                method = %request.method_name,
                source = %request.source_address,
                timeout_ms = request.timeout.as_millis() as u64,
                "request expired before dispatch, dropped"
            );
            return;
        }
        let deadline = started + Duration::from_millis(remaining as u64);

        let response = match self.execute(request, deadline).await {
            Some(response) => response,
            None => return,
        };

        if let Err(e) = on_complete(response).await {
            tracing::error!(error = %e, "failed to deliver response");
        }
    }

    async fn execute(&self, request: Request, deadline: Instant) -> Option<Response> {
        let Some(service) = self.services.get(&request.service_uri) else {
            self.accounting.incr_error();
            tracing::debug!(service = %request.service_uri, "service not found");
            return Some(Response::failure(
                ErrorCode::ServiceNotFound,
                format!("no service found: {}", request.service_uri),
            ));
        };
        let Some(method) = service.method(&request.method_name) else {
            self.accounting.incr_error();
            tracing::debug!(
                service = %request.service_uri,
                method = %request.method_name,
                "method not found"
            );
            return Some(Response::failure(
                ErrorCode::MethodNotFound,
                format!("no method found: {}", request.method_name),
            ));
        };

        service.invokes().incr(&request.source_address, method.name());
        self.accounting.incr_received();

        if request.args.len() != method.wire_arity() {
            self.accounting.incr_error();
            return Some(Response::failure(
                ErrorCode::Serialization,
                format!(
                    "params not matched: got {} args, {} declared",
                    request.args.len(),
                    method.wire_arity()
                ),
            ));
        }

        let started = Instant::now();
        let response = self.run(service, method, request, deadline).await;

        let elapsed = started.elapsed();
        self.accounting
            .record_latency(service.service_uri(), method.name(), elapsed);
        if elapsed >= SLOW_CALL {
            tracing::warn!(
                service = %service.service_uri(),
                method = %method.name(),
                cost_ms = elapsed.as_millis() as u64,
                "slow call"
            );
        }
        response
    }

    async fn run(
        &self,
        service: &ServiceDescriptor,
        method: &MethodMeta,
        request: Request,
        deadline: Instant,
    ) -> Option<Response> {
        let Request {
            service_uri,
            method_name,
            args,
            properties,
            source_address,
            ..
        } = request;

        let ctx = CallContext::new(
            service_uri.as_str(),
            method_name.as_str(),
            source_address.as_str(),
            properties,
            deadline,
        );

        // Coercion runs user-side code (Deserialize impls, the binding's
        // synchronous prologue), so it gets the same panic boundary.
        let prepared = std::panic::catch_unwind(AssertUnwindSafe(|| {
            (method.callable())(ctx, &args)
        }));
        let call = match prepared {
            Ok(Ok(call)) => call,
            Ok(Err(e)) => {
                self.accounting.incr_error();
                tracing::error!(
                    service = %service_uri,
                    method = %method.name(),
                    source = %source_address,
                    error = %e,
                    "argument decode failed"
                );
                return Some(Response::failure(
                    ErrorCode::SerializationServer,
                    format!("serialization failed: {}", e),
                ));
            }
            Err(panic) => {
                return Some(self.panicked(service, method, panic_message(panic.as_ref())));
            }
        };

        let (tx, rx) = oneshot::channel();
        self.pool.submit(call, tx);

        // A result that is already waiting wins over the timer; whether it
        // still counts is decided against the deadline below.
        let result = tokio::select! {
            biased;
            result = rx => result,
            _ = tokio::time::sleep_until(deadline) => {
                self.accounting.incr_timeout();
                tracing::warn!(
                    service = %service_uri,
                    method = %method.name(),
                    source = %source_address,
                    "call timed out, late result will be discarded"
                );
                return Some(Response::failure(
                    ErrorCode::TimeoutServer,
                    format!("timeout: {}#{}", service_uri, method_name),
                ));
            }
        };

        if Instant::now() >= deadline {
            self.accounting.incr_timeout();
            tracing::warn!(
                service = %service_uri,
                method = %method.name(),
                source = %source_address,
                "result arrived after deadline, discarded"
            );
            return None;
        }

        let response = match result {
            Ok(TaskResult::Completed(outcome)) => self.finish(service, method, outcome),
            Ok(TaskResult::Panicked(msg)) => self.panicked(service, method, msg),
            Err(_) => {
                self.accounting.incr_error();
                Response::failure(ErrorCode::InvocationTarget, "no result")
            }
        };
        Some(response)
    }

    fn finish(&self, service: &ServiceDescriptor, method: &MethodMeta, outcome: CallOutcome) -> Response {
        match outcome {
            CallOutcome::Value(Ok(value)) => {
                self.accounting.incr_processed();
                Response::success(value)
            }
            CallOutcome::Value(Err(e)) => {
                self.accounting.incr_error();
                tracing::error!(
                    service = %service.service_uri(),
                    method = %method.name(),
                    error = %e,
                    "result encode failed"
                );
                Response::failure(
                    ErrorCode::SerializationServer,
                    format!("serialization failed: {}", e),
                )
            }
            CallOutcome::BusinessError(e) => {
                self.accounting.incr_processed();
                Response::failure(ErrorCode::Success, format!("method invoke error: {}", e))
            }
            CallOutcome::Failed(e) => {
                self.accounting.incr_error();
                tracing::error!(
                    service = %service.service_uri(),
                    method = %method.name(),
                    error = %e,
                    "method failed"
                );
                Response::failure(
                    ErrorCode::InvocationTarget,
                    format!("invocation target error: {}", e),
                )
            }
        }
    }

    fn panicked(&self, service: &ServiceDescriptor, method: &MethodMeta, msg: String) -> Response {
        self.accounting.incr_error();
        tracing::error!(
            service = %service.service_uri(),
            method = %method.name(),
            panic = %msg,
            "method panicked"
        );
        Response::failure(
            ErrorCode::InvocationTarget,
            format!("invocation target error: {}", msg),
        )
    }
}
