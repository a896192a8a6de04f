use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    Error,
};
use futures_util::future::LocalBoxFuture;
use std::{
    future::{ready, Ready},
    time::Instant,
};
use tracing::{debug, error, info, warn};

/// Paths polled often enough that their start/completion lines go to debug.
const QUIET_PATHS: &[&str] = &["/health", "/api/v1/health", "/api/v1/purity/status", "/api/v1/purity/frame"];

/// Logs every request on arrival and on completion with status and latency.
pub struct RequestLogging;

impl<S, B> Transform<S, ServiceRequest> for RequestLogging
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = RequestLoggingMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RequestLoggingMiddleware { service }))
    }
}

pub struct RequestLoggingMiddleware<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for RequestLoggingMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let started = Instant::now();
        let method = req.method().to_string();
        let uri = req.uri().to_string();
        let remote_addr = req
            .connection_info()
            .realip_remote_addr()
            .unwrap_or("unknown")
            .to_string();
        let quiet = QUIET_PATHS.contains(&req.path());

        if quiet {
            debug!(method = %method, uri = %uri, remote_addr = %remote_addr, "Request started");
        } else {
            info!(method = %method, uri = %uri, remote_addr = %remote_addr, "Request started");
        }

        let fut = self.service.call(req);

        Box::pin(async move {
            let result = fut.await;
            let duration_ms = started.elapsed().as_millis() as u64;

            match &result {
                Ok(response) if response.status().is_server_error() => {
                    warn!(
                        method = %method,
                        uri = %uri,
                        remote_addr = %remote_addr,
                        status = response.status().as_u16(),
                        duration_ms,
                        "Request completed with server error"
                    );
                }
                Ok(response) if quiet => {
                    debug!(method = %method, uri = %uri, status = response.status().as_u16(), duration_ms, "Request completed");
                }
                Ok(response) => {
                    info!(
                        method = %method,
                        uri = %uri,
                        remote_addr = %remote_addr,
                        status = response.status().as_u16(),
                        duration_ms,
                        "Request completed"
                    );
                }
                Err(err) => {
                    error!(
                        method = %method,
                        uri = %uri,
                        remote_addr = %remote_addr,
                        duration_ms,
                        error = %err,
                        "Request failed"
                    );
                }
            }

            result
        })
    }
}
