// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Defaulting and validation rules for Rekor resources.

use tracing::debug;

use super::{Defaulter, Rejection, Validator};
use crate::constants::defaults;
use crate::types::Rekor;

impl Defaulter for Rekor {
    fn set_defaults(&mut self) {
        debug!(name = ?self.metadata.name, "Defaulting Rekor");
        let spec = &mut self.spec;
        spec.version.get_or_insert_with(|| defaults::VERSION.to_string());
        spec.image.get_or_insert_with(|| defaults::IMAGE.to_string());
        spec.replicas.get_or_insert(defaults::REPLICAS);
        spec.port.get_or_insert(defaults::PORT);
    }
}

impl Rekor {
    fn validate_spec(&self) -> Result<(), Rejection> {
        if self.spec.version.as_deref().is_some_and(|v| v.trim().is_empty()) {
            return Err(Rejection::invalid("spec.version", "must not be empty"));
        }
        if self.spec.image.as_deref().is_some_and(|i| i.trim().is_empty()) {
            return Err(Rejection::invalid("spec.image", "must not be empty"));
        }
        if let Some(replicas) = self.spec.replicas.filter(|r| *r < 0) {
            return Err(Rejection::invalid(
                "spec.replicas",
                format!("must not be negative, got {}", replicas),
            ));
        }
        if let Some(port) = self.spec.port.filter(|p| !(1..=65535).contains(p)) {
            return Err(Rejection::invalid(
                "spec.port",
                format!("must be between 1 and 65535, got {}", port),
            ));
        }
        Ok(())
    }
}

impl Validator for Rekor {
    fn validate_create(&self) -> Result<(), Rejection> {
        self.validate_spec()
    }

    fn validate_update(&self, old: &Self) -> Result<(), Rejection> {
        if let Some(previous) = old.spec.tree_id {
            if self.spec.tree_id != Some(previous) {
                return Err(Rejection::forbidden(
                    Some("spec.treeId"),
                    format!("field is immutable once set (was {})", previous),
                ));
            }
        }
        self.validate_spec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webhook::{AdmissionPipeline, FailurePolicy, RejectionReason};
    use kube::api::DynamicObject;
    use kube::core::admission::{AdmissionRequest, AdmissionReview};
    use serde_json::{json, Value};

    fn request(operation: &str, spec: Value, old_spec: Option<Value>) -> AdmissionRequest<DynamicObject> {
        let rekor = |spec: Value| {
            json!({
                "apiVersion": "operator.rekor.dev/v1alpha1",
                "kind": "Rekor",
                "metadata": {"name": "rekor", "namespace": "sigstore"},
                "spec": spec
            })
        };
        let review: AdmissionReview<DynamicObject> = serde_json::from_value(json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "b0e2c4a6-0c43-4f8e-9a27-6d5f1b3e8c11",
                "kind": {"group": "operator.rekor.dev", "version": "v1alpha1", "kind": "Rekor"},
                "resource": {"group": "operator.rekor.dev", "version": "v1alpha1", "resource": "rekors"},
                "name": "rekor",
                "namespace": "sigstore",
                "operation": operation,
                "userInfo": {"username": "alice"},
                "object": rekor(spec),
                "oldObject": old_spec.map(rekor),
                "dryRun": false
            }
        }))
        .unwrap();
        review.try_into().unwrap()
    }

    fn pipeline() -> AdmissionPipeline<Rekor> {
        AdmissionPipeline::new(FailurePolicy::Fail, FailurePolicy::Fail)
            .with_defaulter()
            .with_validator()
    }

    /// Apply the mutating stage's patch the way the API server would
    fn apply_mutation(req: &AdmissionRequest<DynamicObject>) -> Value {
        let resp = pipeline().mutate(req);
        assert!(resp.allowed);
        let mut object = serde_json::to_value(req.object.as_ref().unwrap()).unwrap();
        if let Some(patch) = &resp.patch {
            let patch: json_patch::Patch = serde_json::from_slice(patch).unwrap();
            json_patch::patch(&mut object, &patch).unwrap();
        }
        object
    }

    #[test]
    fn test_defaults_fill_only_unset_fields() {
        let mut rekor = Rekor::new("rekor", Default::default());
        rekor.spec.replicas = Some(3);
        rekor.set_defaults();

        assert_eq!(rekor.spec.version.as_deref(), Some("v1"));
        assert_eq!(rekor.spec.image.as_deref(), Some(defaults::IMAGE));
        assert_eq!(rekor.spec.replicas, Some(3));
        assert_eq!(rekor.spec.port, Some(3000));
        assert_eq!(rekor.spec.tree_id, None);
    }

    #[test]
    fn test_create_without_version_is_defaulted_then_accepted() {
        let req = request("CREATE", json!({"replicas": 2}), None);

        let mutated = apply_mutation(&req);
        assert_eq!(mutated["spec"]["version"], "v1");
        assert_eq!(mutated["spec"]["replicas"], 2);

        let validated = pipeline().validate(&request("CREATE", mutated["spec"].clone(), None));
        assert!(validated.allowed);
    }

    #[test]
    fn test_update_changing_tree_id_is_rejected() {
        let req = request(
            "UPDATE",
            json!({"version": "v1", "treeId": 2}),
            Some(json!({"version": "v1", "treeId": 1})),
        );
        let resp = pipeline().validate(&req);

        assert!(!resp.allowed);
        assert_eq!(resp.result.code, RejectionReason::Forbidden.code());
        assert_eq!(resp.result.reason, "Forbidden");
        assert!(resp.result.message.contains("spec.treeId"));
    }

    #[test]
    fn test_update_setting_tree_id_first_time_is_allowed() {
        let req = request("UPDATE", json!({"treeId": 7}), Some(json!({})));
        assert!(pipeline().validate(&req).allowed);
    }

    #[test]
    fn test_update_keeping_tree_id_is_allowed() {
        let req = request(
            "UPDATE",
            json!({"version": "v2", "treeId": 1}),
            Some(json!({"version": "v1", "treeId": 1})),
        );
        assert!(pipeline().validate(&req).allowed);
    }

    #[test]
    fn test_invalid_fields_are_rejected() {
        for (spec, field) in [
            (json!({"replicas": -1}), "spec.replicas"),
            (json!({"port": 0}), "spec.port"),
            (json!({"port": 70000}), "spec.port"),
            (json!({"version": " "}), "spec.version"),
        ] {
            let resp = pipeline().validate(&request("CREATE", spec, None));
            assert!(!resp.allowed);
            assert_eq!(resp.result.code, 422);
            assert!(resp.result.message.starts_with(field), "{}", resp.result.message);
        }
    }

    #[test]
    fn test_delete_is_allowed() {
        let mut req = request("DELETE", json!({}), Some(json!({"treeId": 1})));
        req.object = None;
        assert!(pipeline().validate(&req).allowed);
    }

    #[test]
    fn test_handler_error_respects_failure_policy() {
        let mut req = request("UPDATE", json!({"treeId": 1}), None);
        req.old_object = None;

        let closed = pipeline().validate(&req);
        assert!(!closed.allowed);
        assert_ne!(closed.result.reason, "Forbidden");

        let open = AdmissionPipeline::<Rekor>::new(FailurePolicy::Ignore, FailurePolicy::Ignore)
            .with_defaulter()
            .with_validator()
            .validate(&req);
        assert!(open.allowed);
    }
}
