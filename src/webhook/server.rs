// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! HTTPS server exposing the mutating and validating endpoints of an [`AdmissionPipeline`].

use bytes::Bytes;
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use kube::{
    api::DynamicObject,
    core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview},
    Resource,
};
use serde::{de::DeserializeOwned, Serialize};
use std::convert::Infallible;
use std::fmt::Display;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::rustls::{crypto::ring, ServerConfig};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::AdmissionPipeline;
use crate::constants::tls;
use crate::error::{OperatorError, Result};

/// Build a TLS acceptor from `tls.crt` and `tls.key` in `cert_dir`
pub async fn load_tls_acceptor(cert_dir: &Path) -> Result<TlsAcceptor> {
    let read = |file: &'static str| {
        let path = cert_dir.join(file);
        async move {
            tokio::fs::read(&path).await.map_err(|e| {
                OperatorError::TlsError(format!("cannot read {}: {}", path.display(), e))
            })
        }
    };
    let cert_pem = read(tls::CERT_FILE).await?;
    let key_pem = read(tls::KEY_FILE).await?;

    let certs = rustls_pemfile::certs(&mut cert_pem.as_slice()).collect::<std::result::Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(OperatorError::TlsError(format!(
            "no certificates found in {}",
            tls::CERT_FILE
        )));
    }
    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())?.ok_or_else(|| {
        OperatorError::TlsError(format!("no private key found in {}", tls::KEY_FILE))
    })?;

    let mut config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| OperatorError::TlsError(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| OperatorError::TlsError(e.to_string()))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}

pub struct WebhookServer<K> {
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    pipeline: Arc<AdmissionPipeline<K>>,
    started: Arc<AtomicBool>,
}

impl<K> WebhookServer<K>
where
    K: Resource<DynamicType = ()> + Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Bind the webhook port. `tls` is only optional for tests; production always serves HTTPS.
    pub async fn bind(
        addr: SocketAddr,
        tls: Option<TlsAcceptor>,
        pipeline: AdmissionPipeline<K>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            OperatorError::WebhookError(format!("cannot bind webhook port {}: {}", addr, e))
        })?;

        Ok(Self {
            listener,
            tls,
            pipeline: Arc::new(pipeline),
            started: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Set while the server accepts connections
    pub fn started(&self) -> Arc<AtomicBool> {
        self.started.clone()
    }

    /// Accept connections until `shutdown` fires
    pub async fn run(self, shutdown: CancellationToken) {
        self.started.store(true, Ordering::SeqCst);
        info!(
            addr = ?self.listener.local_addr().ok(),
            mutate = %AdmissionPipeline::<K>::mutate_path(),
            validate = %AdmissionPipeline::<K>::validate_path(),
            "Webhook server started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let pipeline = self.pipeline.clone();
                        let tls = self.tls.clone();
                        tokio::spawn(async move {
                            match tls {
                                Some(acceptor) => match acceptor.accept(stream).await {
                                    Ok(stream) => serve_connection(TokioIo::new(stream), pipeline).await,
                                    Err(e) => warn!(%peer, "TLS handshake failed: {}", e),
                                },
                                None => serve_connection(TokioIo::new(stream), pipeline).await,
                            }
                        });
                    }
                    Err(e) => error!("Failed to accept webhook connection: {}", e),
                }
            }
        }

        self.started.store(false, Ordering::SeqCst);
        info!("Webhook server stopped accepting connections");
    }
}

async fn serve_connection<I, K>(io: I, pipeline: Arc<AdmissionPipeline<K>>)
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
    K: Resource<DynamicType = ()> + Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    let service = service_fn(move |req: Request<Incoming>| {
        let pipeline = pipeline.clone();
        async move { Ok::<_, Infallible>(route(&pipeline, req).await) }
    });

    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
        debug!("Webhook connection closed with error: {}", e);
    }
}

enum Stage {
    Mutate,
    Validate,
}

/// Dispatch one HTTP request to the matching admission stage
pub async fn route<K, B>(pipeline: &AdmissionPipeline<K>, req: Request<B>) -> Response<Full<Bytes>>
where
    K: Resource<DynamicType = ()> + Serialize + DeserializeOwned + Clone,
    B: Body,
    B::Error: Display,
{
    let path = req.uri().path();
    let stage = if path == AdmissionPipeline::<K>::mutate_path() {
        Stage::Mutate
    } else if path == AdmissionPipeline::<K>::validate_path() {
        Stage::Validate
    } else {
        return text(StatusCode::NOT_FOUND, "not found");
    };
    if req.method() != Method::POST {
        return text(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
    }

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => return invalid_review(format!("cannot read request body: {}", e)),
    };
    let review: AdmissionReview<DynamicObject> = match serde_json::from_slice(&body) {
        Ok(review) => review,
        Err(e) => return invalid_review(format!("cannot decode AdmissionReview: {}", e)),
    };
    let request: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(request) => request,
        Err(e) => return invalid_review(format!("invalid AdmissionReview: {}", e)),
    };

    debug!(
        uid = %request.uid,
        name = %request.name,
        operation = ?request.operation,
        "Handling admission request"
    );
    let response = match stage {
        Stage::Mutate => pipeline.mutate(&request),
        Stage::Validate => pipeline.validate(&request),
    };

    json(StatusCode::OK, &response.into_review())
}

fn invalid_review(message: String) -> Response<Full<Bytes>> {
    warn!("Rejecting malformed admission request: {}", message);
    json(
        StatusCode::BAD_REQUEST,
        &AdmissionResponse::invalid(message).into_review(),
    )
}

fn json<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(body) {
        Ok(bytes) => build(status, "application/json", Bytes::from(bytes)),
        Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

fn text(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    build(status, "text/plain", Bytes::from(body.to_string()))
}

fn build(status: StatusCode, content_type: &str, body: Bytes) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    if let Ok(value) = http::HeaderValue::from_str(content_type) {
        response.headers_mut().insert(http::header::CONTENT_TYPE, value);
    }
    response
}
