use anyhow::Result;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Affinity, Node, NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm,
    PersistentVolume, PersistentVolumeClaim,
};
use std::collections::BTreeSet;
use tracing::debug;

use crate::db::models::Mount;
use crate::server::instance::error::{InstanceError, InstanceResult};

/// Storage class whose persistent volumes are pinned to a single node.
pub const LOCAL_STORAGE_CLASS: &str = "local-storage";

/// Label keys a local PV may use to name its node.
const HOSTNAME_LABEL_KEYS: &[&str] = &[
    "kubernetes.io/hostname",
    "node.kubernetes.io/hostname",
    "kubernetes.io/instance",
];

/// Cluster lookups the planner needs. Implemented by the Kubernetes
/// runtime; tests provide a canned inventory.
#[async_trait]
pub trait ClusterInventory: Send + Sync {
    async fn get_node(&self, name: &str) -> Result<Option<Node>>;
    async fn get_pvc(&self, name: &str) -> Result<Option<PersistentVolumeClaim>>;
    async fn get_pv(&self, name: &str) -> Result<Option<PersistentVolume>>;
}

/// Compute the hard node affinity implied by a mount list.
///
/// hostPath mounts pin to their named node; PVCs backed by the
/// local-storage class pin to the node their bound PV names; configMap
/// mounts and non-local PVCs add no constraint. Returns `None` when the
/// mounts impose nothing.
pub async fn plan_node_affinity(
    inventory: &dyn ClusterInventory,
    mounts: &[Mount],
) -> InstanceResult<Option<Affinity>> {
    let mut nodes: BTreeSet<String> = BTreeSet::new();

    for mount in mounts {
        match mount {
            Mount::HostPath {
                node_name,
                mount_path,
                ..
            } => {
                if node_name.is_empty() {
                    return Err(InstanceError::validation(format!(
                        "hostPath mount {} requires a node name",
                        mount_path
                    )));
                }
                let node = inventory
                    .get_node(node_name)
                    .await
                    .map_err(InstanceError::upstream)?;
                if node.is_none() {
                    return Err(InstanceError::not_found(format!("node {}", node_name)));
                }
                nodes.insert(node_name.clone());
            }
            Mount::Pvc { pvc_name, .. } => {
                let pvc = inventory
                    .get_pvc(pvc_name)
                    .await
                    .map_err(InstanceError::upstream)?
                    .ok_or_else(|| InstanceError::not_found(format!("pvc {}", pvc_name)))?;

                let storage_class = pvc
                    .spec
                    .as_ref()
                    .and_then(|s| s.storage_class_name.as_deref())
                    .unwrap_or_default();
                if storage_class != LOCAL_STORAGE_CLASS {
                    debug!(pvc = pvc_name, storage_class, "PVC is not local-storage, no constraint");
                    continue;
                }

                let phase = pvc
                    .status
                    .as_ref()
                    .and_then(|s| s.phase.as_deref())
                    .unwrap_or_default();
                let volume_name = pvc
                    .spec
                    .as_ref()
                    .and_then(|s| s.volume_name.clone())
                    .unwrap_or_default();
                if phase != "Bound" || volume_name.is_empty() {
                    return Err(InstanceError::validation(format!(
                        "local-storage pvc {} is not bound",
                        pvc_name
                    )));
                }

                let pv = inventory
                    .get_pv(&volume_name)
                    .await
                    .map_err(InstanceError::upstream)?
                    .ok_or_else(|| InstanceError::not_found(format!("pv {}", volume_name)))?;

                let pv_nodes = hostnames_from_pv(&pv);
                if pv_nodes.is_empty() {
                    return Err(InstanceError::validation(format!(
                        "local-storage pv {} names no node in its nodeAffinity",
                        volume_name
                    )));
                }
                nodes.extend(pv_nodes);
            }
            Mount::ConfigMap { .. } => {}
        }
    }

    if nodes.is_empty() {
        return Ok(None);
    }

    Ok(Some(node_affinity_for(&nodes)))
}

/// Hostnames a local PV's required nodeAffinity selects via an `In`
/// expression on one of the recognized hostname label keys.
fn hostnames_from_pv(pv: &PersistentVolume) -> BTreeSet<String> {
    let mut nodes = BTreeSet::new();
    let Some(required) = pv
        .spec
        .as_ref()
        .and_then(|s| s.node_affinity.as_ref())
        .and_then(|a| a.required.as_ref())
    else {
        return nodes;
    };

    for term in &required.node_selector_terms {
        let Some(expressions) = &term.match_expressions else {
            continue;
        };
        for expr in expressions {
            if expr.operator == "In" && HOSTNAME_LABEL_KEYS.contains(&expr.key.as_str()) {
                if let Some(values) = &expr.values {
                    nodes.extend(values.iter().cloned());
                }
            }
        }
    }

    nodes
}

/// One OR-ed term per hostname, so the pod may land on any node of the set.
fn node_affinity_for(nodes: &BTreeSet<String>) -> Affinity {
    let terms = nodes
        .iter()
        .map(|node| NodeSelectorTerm {
            match_expressions: Some(vec![NodeSelectorRequirement {
                key: "kubernetes.io/hostname".to_string(),
                operator: "In".to_string(),
                values: Some(vec![node.clone()]),
            }]),
            ..Default::default()
        })
        .collect();

    Affinity {
        node_affinity: Some(NodeAffinity {
            required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                node_selector_terms: terms,
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        PersistentVolumeClaimSpec, PersistentVolumeClaimStatus, PersistentVolumeSpec,
        VolumeNodeAffinity,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::HashMap;

    struct FakeInventory {
        nodes: Vec<String>,
        pvcs: HashMap<String, PersistentVolumeClaim>,
        pvs: HashMap<String, PersistentVolume>,
    }

    #[async_trait]
    impl ClusterInventory for FakeInventory {
        async fn get_node(&self, name: &str) -> Result<Option<Node>> {
            Ok(self.nodes.iter().any(|n| n == name).then(|| Node {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    ..Default::default()
                },
                ..Default::default()
            }))
        }

        async fn get_pvc(&self, name: &str) -> Result<Option<PersistentVolumeClaim>> {
            Ok(self.pvcs.get(name).cloned())
        }

        async fn get_pv(&self, name: &str) -> Result<Option<PersistentVolume>> {
            Ok(self.pvs.get(name).cloned())
        }
    }

    fn pvc(storage_class: &str, phase: &str, volume: &str) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            spec: Some(PersistentVolumeClaimSpec {
                storage_class_name: Some(storage_class.to_string()),
                volume_name: (!volume.is_empty()).then(|| volume.to_string()),
                ..Default::default()
            }),
            status: Some(PersistentVolumeClaimStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn local_pv(key: &str, node: &str) -> PersistentVolume {
        PersistentVolume {
            spec: Some(PersistentVolumeSpec {
                node_affinity: Some(VolumeNodeAffinity {
                    required: Some(NodeSelector {
                        node_selector_terms: vec![NodeSelectorTerm {
                            match_expressions: Some(vec![NodeSelectorRequirement {
                                key: key.to_string(),
                                operator: "In".to_string(),
                                values: Some(vec![node.to_string()]),
                            }]),
                            ..Default::default()
                        }],
                    }),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn host_path_mount(node: &str) -> Mount {
        Mount::HostPath {
            mount_path: "/data".to_string(),
            host_path: "/var/lib/data".to_string(),
            node_name: node.to_string(),
            read_only: false,
            sub_path: String::new(),
        }
    }

    fn pvc_mount(name: &str) -> Mount {
        Mount::Pvc {
            mount_path: "/data".to_string(),
            pvc_name: name.to_string(),
            read_only: false,
            sub_path: String::new(),
        }
    }

    fn planned_hostnames(affinity: &Affinity) -> Vec<String> {
        affinity
            .node_affinity
            .as_ref()
            .unwrap()
            .required_during_scheduling_ignored_during_execution
            .as_ref()
            .unwrap()
            .node_selector_terms
            .iter()
            .flat_map(|t| t.match_expressions.iter().flatten())
            .flat_map(|e| e.values.iter().flatten())
            .cloned()
            .collect()
    }

    #[tokio::test]
    async fn host_path_pins_to_its_node() {
        let inventory = FakeInventory {
            nodes: vec!["node-1".to_string()],
            pvcs: HashMap::new(),
            pvs: HashMap::new(),
        };
        let affinity = plan_node_affinity(&inventory, &[host_path_mount("node-1")])
            .await
            .unwrap()
            .expect("affinity expected");
        assert_eq!(planned_hostnames(&affinity), vec!["node-1".to_string()]);
    }

    #[tokio::test]
    async fn missing_host_path_node_fails_the_plan() {
        let inventory = FakeInventory {
            nodes: vec![],
            pvcs: HashMap::new(),
            pvs: HashMap::new(),
        };
        let err = plan_node_affinity(&inventory, &[host_path_mount("node-9")])
            .await
            .unwrap_err();
        assert!(matches!(err, InstanceError::NotFound(_)));
    }

    #[tokio::test]
    async fn local_storage_pvc_pins_to_the_bound_node() {
        let mut pvcs = HashMap::new();
        pvcs.insert("data".to_string(), pvc(LOCAL_STORAGE_CLASS, "Bound", "pv-7"));
        let mut pvs = HashMap::new();
        pvs.insert("pv-7".to_string(), local_pv("kubernetes.io/hostname", "node-7"));

        let inventory = FakeInventory {
            nodes: vec![],
            pvcs,
            pvs,
        };
        let affinity = plan_node_affinity(&inventory, &[pvc_mount("data")])
            .await
            .unwrap()
            .expect("affinity expected");
        assert_eq!(planned_hostnames(&affinity), vec!["node-7".to_string()]);
    }

    #[tokio::test]
    async fn non_local_pvc_adds_no_constraint() {
        let mut pvcs = HashMap::new();
        pvcs.insert("data".to_string(), pvc("standard", "Bound", "pv-1"));

        let inventory = FakeInventory {
            nodes: vec![],
            pvcs,
            pvs: HashMap::new(),
        };
        let planned = plan_node_affinity(&inventory, &[pvc_mount("data")])
            .await
            .unwrap();
        assert!(planned.is_none());
    }

    #[tokio::test]
    async fn unbound_local_pvc_fails_the_plan() {
        let mut pvcs = HashMap::new();
        pvcs.insert("data".to_string(), pvc(LOCAL_STORAGE_CLASS, "Pending", ""));

        let inventory = FakeInventory {
            nodes: vec![],
            pvcs,
            pvs: HashMap::new(),
        };
        let err = plan_node_affinity(&inventory, &[pvc_mount("data")])
            .await
            .unwrap_err();
        assert!(matches!(err, InstanceError::Validation(_)));
    }

    #[tokio::test]
    async fn union_of_mounts_and_config_map_ignored() {
        let mut pvcs = HashMap::new();
        pvcs.insert("data".to_string(), pvc(LOCAL_STORAGE_CLASS, "Bound", "pv-7"));
        pvcs.insert("cache".to_string(), pvc("standard", "Bound", "pv-2"));
        let mut pvs = HashMap::new();
        pvs.insert(
            "pv-7".to_string(),
            local_pv("node.kubernetes.io/hostname", "node-7"),
        );

        let inventory = FakeInventory {
            nodes: vec!["node-1".to_string()],
            pvcs,
            pvs,
        };
        let mounts = vec![
            host_path_mount("node-1"),
            pvc_mount("data"),
            pvc_mount("cache"),
            Mount::ConfigMap {
                mount_path: "/etc/conf".to_string(),
                config_map_name: "conf".to_string(),
                read_only: true,
                sub_path: String::new(),
            },
        ];
        let affinity = plan_node_affinity(&inventory, &mounts)
            .await
            .unwrap()
            .expect("affinity expected");
        let mut hostnames = planned_hostnames(&affinity);
        hostnames.sort();
        assert_eq!(hostnames, vec!["node-1".to_string(), "node-7".to_string()]);
    }
}
