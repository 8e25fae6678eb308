// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Liveness and readiness probes served over plain HTTP.

use bytes::Bytes;
use http::{Method, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{OperatorError, Result};

/// A named probe. `Err` carries the reason shown in verbose output.
pub trait HealthCheck: Send + Sync {
    fn check(&self) -> std::result::Result<(), String>;
}

/// Always healthy; proves the process can answer HTTP
pub struct Ping;

impl HealthCheck for Ping {
    fn check(&self) -> std::result::Result<(), String> {
        Ok(())
    }
}

/// Healthy once the webhook server accepts connections
pub struct WebhookStarted(pub Arc<AtomicBool>);

impl HealthCheck for WebhookStarted {
    fn check(&self) -> std::result::Result<(), String> {
        if self.0.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err("webhook server has not started".to_string())
        }
    }
}

/// Fails once shutdown has been requested
pub struct ShutdownCheck(pub CancellationToken);

impl HealthCheck for ShutdownCheck {
    fn check(&self) -> std::result::Result<(), String> {
        if self.0.is_cancelled() {
            Err("shutting down".to_string())
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Probe {
    Liveness,
    Readiness,
}

impl Probe {
    fn from_segment(segment: &str) -> Option<Self> {
        match segment {
            "healthz" => Some(Probe::Liveness),
            "readyz" => Some(Probe::Readiness),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Probe::Liveness => "healthz",
            Probe::Readiness => "readyz",
        }
    }
}

type NamedCheck = (String, Arc<dyn HealthCheck>);

#[derive(Clone, Default)]
pub struct HealthGate {
    liveness: Vec<NamedCheck>,
    readiness: Vec<NamedCheck>,
}

impl HealthGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_liveness(&mut self, name: &str, check: impl HealthCheck + 'static) -> Result<()> {
        register(&mut self.liveness, Probe::Liveness, name, Arc::new(check))
    }

    pub fn add_readiness(&mut self, name: &str, check: impl HealthCheck + 'static) -> Result<()> {
        register(&mut self.readiness, Probe::Readiness, name, Arc::new(check))
    }

    pub fn is_live(&self) -> bool {
        self.liveness.iter().all(|(_, c)| c.check().is_ok())
    }

    pub fn is_ready(&self) -> bool {
        self.readiness.iter().all(|(_, c)| c.check().is_ok())
    }

    fn checks(&self, probe: Probe) -> &[NamedCheck] {
        match probe {
            Probe::Liveness => &self.liveness,
            Probe::Readiness => &self.readiness,
        }
    }

    /// Answer a probe request: `/healthz`, `/readyz` or `/<probe>/<check>`
    pub fn route<B>(&self, req: &Request<B>) -> Response<Full<Bytes>> {
        if req.method() != Method::GET && req.method() != Method::HEAD {
            return text(StatusCode::METHOD_NOT_ALLOWED, "method not allowed".to_string());
        }

        let mut segments = req.uri().path().trim_matches('/').splitn(2, '/');
        let Some(probe) = segments.next().and_then(Probe::from_segment) else {
            return text(StatusCode::NOT_FOUND, "not found".to_string());
        };
        let verbose = req
            .uri()
            .query()
            .is_some_and(|q| q.split('&').any(|p| p == "verbose" || p.starts_with("verbose=")));

        let checks = self.checks(probe);
        let selected: Vec<&NamedCheck> = match segments.next() {
            Some(name) => match checks.iter().find(|(n, _)| n == name) {
                Some(check) => vec![check],
                None => {
                    return text(
                        StatusCode::NOT_FOUND,
                        format!("{} check {} not found", probe.as_str(), name),
                    )
                }
            },
            None => checks.iter().collect(),
        };

        let mut report = String::new();
        let mut healthy = true;
        for (name, check) in selected {
            match check.check() {
                Ok(()) => {
                    let _ = writeln!(report, "[+]{} ok", name);
                }
                Err(reason) => {
                    healthy = false;
                    debug!(probe = probe.as_str(), check = %name, "Health check failed: {}", reason);
                    let _ = writeln!(report, "[-]{} failed: {}", name, reason);
                }
            }
        }

        match (healthy, verbose) {
            (true, false) => text(StatusCode::OK, "ok".to_string()),
            (true, true) => {
                let _ = write!(report, "{} check passed", probe.as_str());
                text(StatusCode::OK, report)
            }
            (false, _) => {
                let _ = write!(report, "{} check failed", probe.as_str());
                text(StatusCode::INTERNAL_SERVER_ERROR, report)
            }
        }
    }
}

fn register(
    checks: &mut Vec<NamedCheck>,
    probe: Probe,
    name: &str,
    check: Arc<dyn HealthCheck>,
) -> Result<()> {
    if name.is_empty() || name.contains('/') {
        return Err(OperatorError::ConfigError(format!(
            "invalid {} check name '{}'",
            probe.as_str(),
            name
        )));
    }
    if checks.iter().any(|(n, _)| n == name) {
        return Err(OperatorError::ConfigError(format!(
            "{} check '{}' is already registered",
            probe.as_str(),
            name
        )));
    }
    checks.push((name.to_string(), check));
    Ok(())
}

fn text(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Serves the probes of a [`HealthGate`]
pub struct HealthServer {
    listener: TcpListener,
    gate: Arc<HealthGate>,
}

impl HealthServer {
    pub async fn bind(addr: SocketAddr, gate: HealthGate) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            OperatorError::ConfigError(format!("cannot bind health probe address {}: {}", addr, e))
        })?;
        Ok(Self {
            listener,
            gate: Arc::new(gate),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!(addr = ?self.listener.local_addr().ok(), "Health probe server started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let gate = self.gate.clone();
                        tokio::spawn(async move {
                            let service = service_fn(move |req: Request<Incoming>| {
                                let response = gate.route(&req);
                                async move { Ok::<_, Infallible>(response) }
                            });
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(TokioIo::new(stream), service)
                                .await
                            {
                                debug!("Health probe connection closed with error: {}", e);
                            }
                        });
                    }
                    Err(e) => error!("Failed to accept health probe connection: {}", e),
                }
            }
        }

        info!("Health probe server stopped");
    }
}
