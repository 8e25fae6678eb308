// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! `LeaseStore` backed by a `coordination.k8s.io/v1` Lease object.

use crate::error::{OperatorError, Result};
use crate::leader::{LeaseRecord, LeaseStore, VersionedLease};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::{
    api::{ObjectMeta, PostParams},
    Api, Client,
};
use tracing::instrument;

pub struct KubeLeaseStore {
    api: Api<Lease>,
    name: String,
}

impl KubeLeaseStore {
    pub fn new(client: Client, namespace: &str, name: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: name.to_string(),
        }
    }

    fn to_lease(&self, record: &LeaseRecord, version: Option<&str>) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                resource_version: version.map(str::to_string),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: record.holder_identity.clone(),
                lease_duration_seconds: Some(record.lease_duration_seconds),
                acquire_time: record.acquire_time.map(MicroTime),
                renew_time: record.renew_time.map(MicroTime),
                lease_transitions: Some(record.leader_transitions),
                ..Default::default()
            }),
        }
    }
}

fn from_lease(lease: &Lease) -> VersionedLease {
    let spec = lease.spec.clone().unwrap_or_default();
    VersionedLease {
        record: LeaseRecord {
            holder_identity: spec.holder_identity,
            lease_duration_seconds: spec.lease_duration_seconds.unwrap_or_default(),
            acquire_time: spec.acquire_time.map(|t| t.0),
            renew_time: spec.renew_time.map(|t| t.0),
            leader_transitions: spec.lease_transitions.unwrap_or_default(),
        },
        version: lease.metadata.resource_version.clone().unwrap_or_default(),
    }
}

/// Map API failures onto the store contract: 409 is a lost race, anything unreachable is an outage
fn classify(name: &str, err: kube::Error) -> OperatorError {
    let code = match &err {
        kube::Error::Api(resp) => Some(resp.code),
        _ => None,
    };

    match code {
        Some(409) => OperatorError::LeaseConflict(format!(
            "lease {} was modified concurrently: {}",
            name, err
        )),
        Some(c) if c >= 500 || c == 429 => OperatorError::LeaseStoreError(err.to_string()),
        Some(_) => OperatorError::KubeError(err),
        None => OperatorError::LeaseStoreError(err.to_string()),
    }
}

impl LeaseStore for KubeLeaseStore {
    #[instrument(skip(self), fields(lease = %self.name))]
    async fn get(&self) -> Result<Option<VersionedLease>> {
        let lease = self
            .api
            .get_opt(&self.name)
            .await
            .map_err(|e| classify(&self.name, e))?;
        Ok(lease.as_ref().map(from_lease))
    }

    #[instrument(skip(self, record), fields(lease = %self.name))]
    async fn create(&self, record: &LeaseRecord) -> Result<VersionedLease> {
        let created = self
            .api
            .create(&PostParams::default(), &self.to_lease(record, None))
            .await
            .map_err(|e| classify(&self.name, e))?;
        Ok(from_lease(&created))
    }

    #[instrument(skip(self, record), fields(lease = %self.name))]
    async fn update(&self, record: &LeaseRecord, version: &str) -> Result<VersionedLease> {
        let replaced = self
            .api
            .replace(
                &self.name,
                &PostParams::default(),
                &self.to_lease(record, Some(version)),
            )
            .await
            .map_err(|e| classify(&self.name, e))?;
        Ok(from_lease(&replaced))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{lease_json, MockService};
    use chrono::{TimeZone, Utc};

    const LEASE_PATH: &str = "/apis/coordination.k8s.io/v1/namespaces/rekor-system/leases/operator.rekor.dev";
    const LEASES_PATH: &str = "/apis/coordination.k8s.io/v1/namespaces/rekor-system/leases";

    fn store(mock: MockService) -> KubeLeaseStore {
        KubeLeaseStore::new(mock.into_client(), "rekor-system", "operator.rekor.dev")
    }

    fn record(holder: &str) -> LeaseRecord {
        let t = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        LeaseRecord {
            holder_identity: Some(holder.to_string()),
            lease_duration_seconds: 15,
            acquire_time: Some(t),
            renew_time: Some(t),
            leader_transitions: 2,
        }
    }

    #[tokio::test]
    async fn test_get_missing_lease() {
        let store = store(MockService::new());
        assert_eq!(store.get().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_get_existing_lease() {
        let mock = MockService::new().on_get(LEASE_PATH, 200, &lease_json("replica-a", "42"));
        let lease = store(mock).get().await.unwrap().unwrap();

        assert!(lease.record.is_held_by("replica-a"));
        assert_eq!(lease.record.lease_duration_seconds, 15);
        assert_eq!(lease.version, "42");
    }

    #[tokio::test]
    async fn test_create_conflict() {
        let mock = MockService::new().on_post(
            LEASES_PATH,
            409,
            r#"{"kind":"Status","apiVersion":"v1","status":"Failure","message":"already exists","reason":"AlreadyExists","code":409}"#,
        );

        let err = store(mock).create(&record("replica-a")).await.unwrap_err();
        assert!(matches!(err, OperatorError::LeaseConflict(_)));
    }

    #[tokio::test]
    async fn test_update_sends_expected_version() {
        let mock = MockService::new().on_put(LEASE_PATH, 200, &lease_json("replica-a", "43"));
        let lease = store(mock.clone())
            .update(&record("replica-a"), "42")
            .await
            .unwrap();

        assert_eq!(lease.version, "43");

        let sent = mock.requests();
        let (method, path, body) = sent.last().unwrap();
        assert_eq!(method, "PUT");
        assert_eq!(path, LEASE_PATH);
        let body: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(body["metadata"]["resourceVersion"], "42");
        assert_eq!(body["spec"]["holderIdentity"], "replica-a");
        assert_eq!(body["spec"]["leaseTransitions"], 2);
    }

    #[tokio::test]
    async fn test_update_conflict() {
        let mock = MockService::new().on_put(
            LEASE_PATH,
            409,
            r#"{"kind":"Status","apiVersion":"v1","status":"Failure","message":"the object has been modified","reason":"Conflict","code":409}"#,
        );

        let err = store(mock).update(&record("replica-a"), "41").await.unwrap_err();
        assert!(matches!(err, OperatorError::LeaseConflict(_)));
    }

    #[tokio::test]
    async fn test_server_errors_are_store_errors() {
        let mock = MockService::new().on_get(
            LEASE_PATH,
            503,
            r#"{"kind":"Status","apiVersion":"v1","status":"Failure","message":"etcd unavailable","reason":"ServiceUnavailable","code":503}"#,
        );

        let err = store(mock).get().await.unwrap_err();
        assert!(matches!(err, OperatorError::LeaseStoreError(_)));
    }
}
