//! Clone source worker pod factory
//!
//! The source pod runs in the source PVC's namespace, mounts the source
//! volume read-only and pushes its contents to the target's upload server
//! over mutual TLS. Everything the worker needs (client keypair, server CA,
//! upload URL, attachment mode) is passed through environment variables.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, PersistentVolumeClaim, PersistentVolumeClaimVolumeSource,
    Pod, PodSecurityContext, PodSpec, ResourceRequirements, Volume, VolumeDevice, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use super::{
    clone_source_pod_name, upload_server_url, ANN_CREATED_BY, ANN_OWNER_REF,
    LABEL_CLONE_UNIQUE_ID,
};
use crate::UPLOAD_PATH_SYNC;

/// Container (and component label) name of the clone source worker
pub const CLONE_SOURCE_POD_NAME: &str = "cdi-clone-source";

/// Name of the volume carrying the source PVC inside the worker pod
const DATA_VOLUME_NAME: &str = "cdi-data-vol";

/// Mount point of the source volume in filesystem mode
const CLONER_MOUNT_PATH: &str = "/var/run/cdi/clone/source";

/// Device path of the source volume in block mode
const WRITE_BLOCK_PATH: &str = "/dev/cdi-block-volume";

const APP_LABEL_KEY: &str = "app";
const APP_LABEL_VALUE: &str = "containerized-data-importer";
const COMPONENT_LABEL_KEY: &str = "cdi.kubevirt.io";
const PROMETHEUS_LABEL_KEY: &str = "prometheus.cdi.kubevirt.io";

/// Build the clone source pod for `target_pvc`.
///
/// The pod is named `<target uid>-source-pod`, lives in the source PVC's
/// namespace and carries the unique-id label used for lookup. Parentage to
/// the target PVC is encoded in the `ownerRef` annotation since owner
/// references cannot cross namespaces.
#[allow(clippy::too_many_arguments)]
pub fn make_clone_source_pod_spec(
    image: &str,
    pull_policy: &str,
    source_pvc_name: &str,
    source_pvc_namespace: &str,
    owner_ref: &str,
    client_key: &[u8],
    client_cert: &[u8],
    server_ca_cert: &[u8],
    target_pvc: &PersistentVolumeClaim,
    resource_requirements: Option<&ResourceRequirements>,
) -> Pod {
    let pod_name = clone_source_pod_name(target_pvc);
    let target_namespace = target_pvc.metadata.namespace.as_deref().unwrap_or_default();
    let target_name = target_pvc.metadata.name.as_deref().unwrap_or_default();
    let url = upload_server_url(target_namespace, target_name, UPLOAD_PATH_SYNC);

    // Identity of the controlling DataVolume when the target is owned by one
    let owner_uid = target_pvc
        .metadata
        .owner_references
        .as_ref()
        .and_then(|refs| {
            refs.iter()
                .find(|r| r.controller == Some(true) && r.kind == "DataVolume")
        })
        .map(|r| r.uid.clone())
        .unwrap_or_default();

    let mut annotations = BTreeMap::new();
    annotations.insert(ANN_CREATED_BY.to_string(), "yes".to_string());
    annotations.insert(ANN_OWNER_REF.to_string(), owner_ref.to_string());

    let mut labels = BTreeMap::new();
    labels.insert(APP_LABEL_KEY.to_string(), APP_LABEL_VALUE.to_string());
    labels.insert(
        COMPONENT_LABEL_KEY.to_string(),
        CLONE_SOURCE_POD_NAME.to_string(),
    );
    // this label is used when searching for a pvc's cloner source pod
    labels.insert(LABEL_CLONE_UNIQUE_ID.to_string(), pod_name.clone());
    labels.insert(PROMETHEUS_LABEL_KEY.to_string(), String::new());

    let mut env = vec![
        env_var("CLIENT_KEY", String::from_utf8_lossy(client_key)),
        env_var("CLIENT_CERT", String::from_utf8_lossy(client_cert)),
        env_var("SERVER_CA_CERT", String::from_utf8_lossy(server_ca_cert)),
        env_var("UPLOAD_URL", url),
        env_var("OWNER_UID", owner_uid),
    ];

    let block_mode = target_pvc.spec.as_ref().and_then(|s| s.volume_mode.as_deref())
        == Some("Block");

    let (volume_devices, volume_mounts) = if block_mode {
        env.push(env_var("VOLUME_MODE", "block"));
        env.push(env_var("MOUNT_POINT", WRITE_BLOCK_PATH));
        (
            Some(vec![VolumeDevice {
                name: DATA_VOLUME_NAME.to_string(),
                device_path: WRITE_BLOCK_PATH.to_string(),
            }]),
            None,
        )
    } else {
        env.push(env_var("VOLUME_MODE", "filesystem"));
        env.push(env_var("MOUNT_POINT", CLONER_MOUNT_PATH));
        (
            None,
            Some(vec![VolumeMount {
                name: DATA_VOLUME_NAME.to_string(),
                mount_path: CLONER_MOUNT_PATH.to_string(),
                ..Default::default()
            }]),
        )
    };

    Pod {
        metadata: ObjectMeta {
            name: Some(pod_name),
            namespace: Some(source_pvc_namespace.to_string()),
            annotations: Some(annotations),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(PodSpec {
            // Privileged access so block devices can be read directly
            security_context: Some(PodSecurityContext {
                run_as_user: Some(0),
                ..Default::default()
            }),
            containers: vec![Container {
                name: CLONE_SOURCE_POD_NAME.to_string(),
                image: Some(image.to_string()),
                image_pull_policy: Some(pull_policy.to_string()),
                env: Some(env),
                ports: Some(vec![ContainerPort {
                    name: Some("metrics".to_string()),
                    container_port: 8443,
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                resources: resource_requirements.cloned(),
                volume_devices,
                volume_mounts,
                ..Default::default()
            }],
            restart_policy: Some("OnFailure".to_string()),
            volumes: Some(vec![Volume {
                name: DATA_VOLUME_NAME.to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: source_pvc_name.to_string(),
                    read_only: Some(true),
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn env_var(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PersistentVolumeClaimSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    fn target_pvc(volume_mode: Option<&str>) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some("pvc-dst".to_string()),
                namespace: Some("prod".to_string()),
                uid: Some("uid-42".to_string()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                volume_mode: volume_mode.map(String::from),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn make_pod(target: &PersistentVolumeClaim) -> Pod {
        make_clone_source_pod_spec(
            "cdi-cloner:latest",
            "IfNotPresent",
            "pvc-src",
            "stage",
            "prod/pvc-dst",
            b"KEY",
            b"CERT",
            b"CA",
            target,
            None,
        )
    }

    fn env_of(pod: &Pod) -> BTreeMap<String, String> {
        pod.spec.as_ref().unwrap().containers[0]
            .env
            .as_ref()
            .unwrap()
            .iter()
            .map(|e| (e.name.clone(), e.value.clone().unwrap_or_default()))
            .collect()
    }

    #[test]
    fn pod_lives_in_source_namespace_with_unique_id_label() {
        let pod = make_pod(&target_pvc(None));

        assert_eq!(pod.metadata.name.as_deref(), Some("uid-42-source-pod"));
        assert_eq!(pod.metadata.namespace.as_deref(), Some("stage"));

        let labels = pod.metadata.labels.as_ref().unwrap();
        assert_eq!(labels[LABEL_CLONE_UNIQUE_ID], "uid-42-source-pod");
        assert_eq!(labels[APP_LABEL_KEY], APP_LABEL_VALUE);
        assert!(labels.contains_key(PROMETHEUS_LABEL_KEY));
    }

    #[test]
    fn pod_carries_created_by_and_owner_annotations() {
        let pod = make_pod(&target_pvc(None));

        let annotations = pod.metadata.annotations.as_ref().unwrap();
        assert_eq!(annotations[ANN_CREATED_BY], "yes");
        assert_eq!(annotations[ANN_OWNER_REF], "prod/pvc-dst");
    }

    #[test]
    fn source_volume_is_mounted_read_only() {
        let pod = make_pod(&target_pvc(None));

        let volumes = pod.spec.as_ref().unwrap().volumes.as_ref().unwrap();
        assert_eq!(volumes.len(), 1);
        let claim = volumes[0].persistent_volume_claim.as_ref().unwrap();
        assert_eq!(claim.claim_name, "pvc-src");
        assert_eq!(claim.read_only, Some(true));
    }

    #[test]
    fn filesystem_mode_mounts_at_fixed_path() {
        let pod = make_pod(&target_pvc(None));
        let container = &pod.spec.as_ref().unwrap().containers[0];

        let mounts = container.volume_mounts.as_ref().unwrap();
        assert_eq!(mounts[0].mount_path, CLONER_MOUNT_PATH);
        assert!(container.volume_devices.is_none());

        let env = env_of(&pod);
        assert_eq!(env["VOLUME_MODE"], "filesystem");
        assert_eq!(env["MOUNT_POINT"], CLONER_MOUNT_PATH);
    }

    #[test]
    fn block_mode_attaches_raw_device() {
        let pod = make_pod(&target_pvc(Some("Block")));
        let container = &pod.spec.as_ref().unwrap().containers[0];

        let devices = container.volume_devices.as_ref().unwrap();
        assert_eq!(devices[0].device_path, WRITE_BLOCK_PATH);
        assert!(container.volume_mounts.is_none());

        let env = env_of(&pod);
        assert_eq!(env["VOLUME_MODE"], "block");
        assert_eq!(env["MOUNT_POINT"], WRITE_BLOCK_PATH);
    }

    #[test]
    fn worker_env_carries_certs_and_upload_url() {
        let pod = make_pod(&target_pvc(None));
        let env = env_of(&pod);

        assert_eq!(env["CLIENT_KEY"], "KEY");
        assert_eq!(env["CLIENT_CERT"], "CERT");
        assert_eq!(env["SERVER_CA_CERT"], "CA");
        assert_eq!(
            env["UPLOAD_URL"],
            "https://cdi-upload-pvc-dst.prod.svc/upload/sync"
        );
        assert_eq!(env["OWNER_UID"], "");
    }

    #[test]
    fn owner_uid_comes_from_controlling_data_volume() {
        let mut target = target_pvc(None);
        target.metadata.owner_references = Some(vec![
            OwnerReference {
                kind: "Deployment".to_string(),
                uid: "other".to_string(),
                controller: Some(false),
                ..Default::default()
            },
            OwnerReference {
                kind: "DataVolume".to_string(),
                uid: "dv-uid-7".to_string(),
                controller: Some(true),
                ..Default::default()
            },
        ]);

        let env = env_of(&make_pod(&target));
        assert_eq!(env["OWNER_UID"], "dv-uid-7");
    }

    #[test]
    fn pod_restarts_on_failure_and_runs_as_root() {
        let pod = make_pod(&target_pvc(None));
        let spec = pod.spec.as_ref().unwrap();

        assert_eq!(spec.restart_policy.as_deref(), Some("OnFailure"));
        assert_eq!(
            spec.security_context.as_ref().unwrap().run_as_user,
            Some(0)
        );

        let ports = spec.containers[0].ports.as_ref().unwrap();
        assert_eq!(ports[0].container_port, 8443);
        assert_eq!(ports[0].name.as_deref(), Some("metrics"));
        assert_eq!(ports[0].protocol.as_deref(), Some("TCP"));
    }
}
