use crate::algorithms::{Decision, RateLimiter};
use crate::client_ip::client_ip;
use crate::error::Result;
use crate::response;
use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};

/// What to do when the store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Reject the request.
    #[default]
    Closed,
    /// Let the request through unmetered.
    Open,
}

/// Result of consulting the limiter for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionOutcome {
    Forward(Decision),
    /// No caller identity could be resolved. Distinct from a rate-limit denial.
    Unauthorized,
    RateLimited(Decision),
    /// Admitted, but debug mode answers with the remaining budget instead.
    Debug(Decision),
}

/// Either the continuation's output or the reason it was not run.
#[derive(Debug)]
pub enum Gate<T> {
    Passed {
        /// `None` when the store was down and the failure policy let the request through.
        decision: Option<Decision>,
        output: T,
    },
    Unauthorized,
    RateLimited(Decision),
    Debug(Decision),
}

/// Admission control in front of a request pipeline.
///
/// Every limiter is consulted in order; the first denial wins, otherwise the
/// decision with the least remaining budget is reported.
#[derive(Clone)]
pub struct Admission {
    limiter: Arc<dyn RateLimiter>,
    additional: Vec<Arc<dyn RateLimiter>>,
    debug: bool,
    failure_policy: FailurePolicy,
}

impl Admission {
    pub fn new(limiter: Arc<dyn RateLimiter>) -> Self {
        Self {
            limiter,
            additional: Vec::new(),
            debug: false,
            failure_policy: FailurePolicy::default(),
        }
    }

    /// Also require `limiter` to admit each request.
    pub fn with_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.additional.push(limiter);
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn limiter(&self) -> &Arc<dyn RateLimiter> {
        &self.limiter
    }

    pub fn limiters(&self) -> impl Iterator<Item = &Arc<dyn RateLimiter>> {
        std::iter::once(&self.limiter).chain(self.additional.iter())
    }

    /// Clears `identity` from every limiter.
    pub async fn reset(&self, identity: &str) -> Result<()> {
        for limiter in self.limiters() {
            limiter.reset(identity).await?;
        }
        Ok(())
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    /// Resolves the caller and consults the limiters. Store failures are returned as errors.
    pub async fn admit(&self, headers: &HeaderMap, fallback: Option<&str>) -> Result<AdmissionOutcome> {
        let Some(identity) = client_ip(headers, fallback) else {
            warn!(target: "limitgate::middleware", "No client IP address found in request");
            return Ok(AdmissionOutcome::Unauthorized);
        };

        let mut decision = self.limiter.check(&identity).await?;
        if decision.allowed {
            for limiter in &self.additional {
                let next = limiter.check(&identity).await?;
                if !next.allowed || next.remaining < decision.remaining {
                    decision = next;
                }
                if !decision.allowed {
                    break;
                }
            }
        }

        if !decision.allowed {
            info!(
                target: "limitgate::middleware",
                client_ip = %identity,
                limit = decision.limit,
                "Rate limit exceeded"
            );
            return Ok(AdmissionOutcome::RateLimited(decision));
        }

        if self.debug {
            Ok(AdmissionOutcome::Debug(decision))
        } else {
            Ok(AdmissionOutcome::Forward(decision))
        }
    }

    /// Runs `next` only if the request is admitted, applying the failure policy
    /// when the store is unavailable.
    pub async fn run<F, Fut, T>(&self, headers: &HeaderMap, fallback: Option<&str>, next: F) -> Result<Gate<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        match self.admit(headers, fallback).await {
            Ok(AdmissionOutcome::Forward(decision)) => Ok(Gate::Passed {
                decision: Some(decision),
                output: next().await,
            }),
            Ok(AdmissionOutcome::Unauthorized) => Ok(Gate::Unauthorized),
            Ok(AdmissionOutcome::RateLimited(decision)) => Ok(Gate::RateLimited(decision)),
            Ok(AdmissionOutcome::Debug(decision)) => Ok(Gate::Debug(decision)),
            Err(err) if err.is_store_failure() && self.failure_policy == FailurePolicy::Open => {
                warn!(
                    target: "limitgate::middleware",
                    error = %err,
                    "Rate limiter store failed, admitting request"
                );
                Ok(Gate::Passed {
                    decision: None,
                    output: next().await,
                })
            }
            Err(err) => Err(err),
        }
    }
}

/// axum middleware gating requests through an [`Admission`].
pub async fn rate_limit(State(admission): State<Admission>, request: Request, next: Next) -> Response {
    let fallback = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string());
    let headers = request.headers().clone();

    match admission
        .run(&headers, fallback.as_deref(), || next.run(request))
        .await
    {
        Ok(Gate::Passed { decision, output: mut response }) => {
            if let Some(decision) = decision {
                response::apply_rate_limit_headers(response.headers_mut(), &decision);
            }
            response
        }
        Ok(Gate::Unauthorized) => response::unauthorized(),
        Ok(Gate::RateLimited(decision)) => response::rate_limited(&decision),
        Ok(Gate::Debug(decision)) => response::debug_remaining(&decision),
        Err(err) => {
            error!(target: "limitgate::middleware", error = %err, "Rate limiter failed");
            err.into_response()
        }
    }
}

/// Logging middleware for request/response tracking
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let fallback = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string());
    let client_ip = client_ip(request.headers(), fallback.as_deref())
        .unwrap_or_else(|| "unknown".to_string());

    info!(
        target: "limitgate::middleware",
        method = %method,
        uri = %uri,
        client_ip = %client_ip,
        "Incoming request"
    );

    let response = next.run(request).await;

    info!(
        target: "limitgate::middleware",
        method = %method,
        uri = %uri,
        status = %response.status(),
        "Request completed"
    );

    response
}
