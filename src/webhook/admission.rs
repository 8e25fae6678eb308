// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Turns admission requests into decisions by dispatching to the capabilities a resource type
//! registered: [`Defaulter`] for the mutating stage, [`Validator`] for the validating stage.

use kube::{
    api::DynamicObject,
    core::admission::{AdmissionRequest, AdmissionResponse, Operation},
    Resource,
};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::{Defaulter, FailurePolicy, Rejection, Validator};

/// Why the webhook could not reach a decision; distinct from a [`Rejection`]
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("cannot decode {what}: {source}")]
    Decode {
        what: &'static str,
        source: serde_json::Error,
    },

    #[error("request carries no {0}")]
    MissingObject(&'static str),

    #[error("cannot encode object: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("cannot build patch: {0}")]
    Patch(String),
}

impl AdmissionError {
    fn code(&self) -> u16 {
        match self {
            AdmissionError::Decode { .. } | AdmissionError::MissingObject(_) => 400,
            AdmissionError::Encode(_) | AdmissionError::Patch(_) => 500,
        }
    }

    fn reason(&self) -> &'static str {
        match self {
            AdmissionError::Decode { .. } | AdmissionError::MissingObject(_) => "BadRequest",
            AdmissionError::Encode(_) | AdmissionError::Patch(_) => "InternalError",
        }
    }
}

struct ValidatorFns<K> {
    create: fn(&K) -> Result<(), Rejection>,
    update: fn(&K, &K) -> Result<(), Rejection>,
    delete: fn(&K) -> Result<(), Rejection>,
}

pub struct AdmissionPipeline<K> {
    defaulter: Option<fn(&mut K)>,
    validator: Option<ValidatorFns<K>>,
    mutating_policy: FailurePolicy,
    validating_policy: FailurePolicy,
}

impl<K> AdmissionPipeline<K>
where
    K: Resource<DynamicType = ()> + Serialize + DeserializeOwned + Clone,
{
    pub fn new(mutating_policy: FailurePolicy, validating_policy: FailurePolicy) -> Self {
        Self {
            defaulter: None,
            validator: None,
            mutating_policy,
            validating_policy,
        }
    }

    pub fn with_defaulter(mut self) -> Self
    where
        K: Defaulter,
    {
        self.defaulter = Some(K::set_defaults);
        self
    }

    pub fn with_validator(mut self) -> Self
    where
        K: Validator,
    {
        self.validator = Some(ValidatorFns {
            create: K::validate_create,
            update: K::validate_update,
            delete: K::validate_delete,
        });
        self
    }

    /// Path the mutating stage is served on, e.g. `/mutate-operator-rekor-dev-v1alpha1-rekor`
    pub fn mutate_path() -> String {
        format!("/mutate-{}", Self::path_suffix())
    }

    pub fn validate_path() -> String {
        format!("/validate-{}", Self::path_suffix())
    }

    fn path_suffix() -> String {
        format!(
            "{}-{}-{}",
            K::group(&()).replace('.', "-"),
            K::version(&()),
            K::kind(&()).to_lowercase()
        )
    }

    /// Mutating stage: answer with a JSON patch filling in defaults. Never rejects on policy.
    pub fn mutate(&self, req: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
        match self.try_mutate(req) {
            Ok(resp) => resp,
            Err(e) => handler_error(req, e, self.mutating_policy),
        }
    }

    /// Validating stage: accept, or reject with a reason
    pub fn validate(&self, req: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
        match self.try_validate(req) {
            Ok(Ok(())) => AdmissionResponse::from(req),
            Ok(Err(rejection)) => {
                info!(
                    uid = %req.uid,
                    name = %req.name,
                    reason = rejection.reason.as_str(),
                    "Rejected {:?}: {}",
                    req.operation,
                    rejection
                );
                reject(req, &rejection)
            }
            Err(e) => handler_error(req, e, self.validating_policy),
        }
    }

    fn try_mutate(
        &self,
        req: &AdmissionRequest<DynamicObject>,
    ) -> Result<AdmissionResponse, AdmissionError> {
        let resp = AdmissionResponse::from(req);
        let Some(set_defaults) = self.defaulter else {
            return Ok(resp);
        };
        if !matches!(req.operation, Operation::Create | Operation::Update) {
            return Ok(resp);
        }

        let mut obj: K = decode(req.object.as_ref(), "object")?;
        let before = serde_json::to_value(&obj)?;
        set_defaults(&mut obj);
        let after = serde_json::to_value(&obj)?;

        let patch = json_patch::diff(&before, &after);
        if patch.0.is_empty() {
            return Ok(resp);
        }

        debug!(uid = %req.uid, operations = patch.0.len(), "Defaulted object");
        resp.with_patch(patch)
            .map_err(|e| AdmissionError::Patch(e.to_string()))
    }

    fn try_validate(
        &self,
        req: &AdmissionRequest<DynamicObject>,
    ) -> Result<Result<(), Rejection>, AdmissionError> {
        let Some(validator) = &self.validator else {
            return Ok(Ok(()));
        };

        match req.operation {
            Operation::Create => {
                let obj = self.decode_defaulted(req.object.as_ref(), "object")?;
                Ok((validator.create)(&obj))
            }
            Operation::Update => {
                let obj = self.decode_defaulted(req.object.as_ref(), "object")?;
                let old = self.decode_defaulted(req.old_object.as_ref(), "oldObject")?;
                Ok((validator.update)(&obj, &old))
            }
            Operation::Delete => {
                let old = decode(req.old_object.as_ref(), "oldObject")?;
                Ok((validator.delete)(&old))
            }
            _ => Ok(Ok(())),
        }
    }

    /// Validators always see defaults applied, even when the mutating stage was skipped
    fn decode_defaulted(
        &self,
        obj: Option<&DynamicObject>,
        what: &'static str,
    ) -> Result<K, AdmissionError> {
        let mut obj: K = decode(obj, what)?;
        if let Some(set_defaults) = self.defaulter {
            set_defaults(&mut obj);
        }
        Ok(obj)
    }
}

fn decode<K: DeserializeOwned>(
    obj: Option<&DynamicObject>,
    what: &'static str,
) -> Result<K, AdmissionError> {
    let obj = obj.ok_or(AdmissionError::MissingObject(what))?;
    let value = serde_json::to_value(obj)?;
    serde_json::from_value(value).map_err(|source| AdmissionError::Decode { what, source })
}

fn reject(req: &AdmissionRequest<DynamicObject>, rejection: &Rejection) -> AdmissionResponse {
    let mut resp = AdmissionResponse::from(req).deny(rejection.to_string());
    resp.result.code = rejection.reason.code();
    resp.result.reason = rejection.reason.as_str().to_string();
    resp
}

fn handler_error(
    req: &AdmissionRequest<DynamicObject>,
    err: AdmissionError,
    policy: FailurePolicy,
) -> AdmissionResponse {
    match policy {
        FailurePolicy::Ignore => {
            warn!(uid = %req.uid, "Admitting {:?} despite webhook error: {}", req.operation, err);
            AdmissionResponse::from(req)
        }
        FailurePolicy::Fail => {
            warn!(uid = %req.uid, "Denying {:?} on webhook error: {}", req.operation, err);
            let mut resp = AdmissionResponse::from(req).deny(err.to_string());
            resp.result.code = err.code();
            resp.result.reason = err.reason().to_string();
            resp
        }
    }
}
