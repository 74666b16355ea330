//! Typed views of the KubeVirt VirtualMachine and VirtualMachineInstance kinds
//!
//! Only the fields the snapshot controller reads are typed. Every level
//! keeps the remaining fields in a flattened map so a VM read from the
//! cache round-trips without loss into the content's frozen copy.

use kube::CustomResource;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::Error;

/// How the VM's instance should be kept running
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum RunStrategy {
    /// Always keep an instance running
    Always,
    /// Never run an instance
    Halted,
    /// Instance lifecycle is driven by explicit start/stop requests
    Manual,
    /// Restart the instance only on failure
    RerunOnFailure,
    /// Run once to completion
    Once,
}

/// VirtualMachine spec (partial)
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "kubevirt.io",
    version = "v1",
    kind = "VirtualMachine",
    plural = "virtualmachines",
    namespaced,
    status = "VirtualMachineStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSpec {
    /// Legacy on/off switch, mutually exclusive with `runStrategy`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running: Option<bool>,

    /// Desired run strategy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_strategy: Option<RunStrategy>,

    /// Instance template
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<VirtualMachineInstanceTemplateSpec>,

    /// Fields the controller does not interpret
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Template the VM stamps instances from (partial)
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct VirtualMachineInstanceTemplateSpec {
    /// Instance spec
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<VirtualMachineInstanceSpec>,

    /// Fields the controller does not interpret
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// VirtualMachine status (partial)
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineStatus {
    /// Name of the snapshot currently holding the lock
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_in_progress: Option<String>,

    /// Fields the controller does not interpret
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// VirtualMachineInstance spec (partial)
///
/// Also used for the VM template's spec.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "kubevirt.io",
    version = "v1",
    kind = "VirtualMachineInstance",
    plural = "virtualmachineinstances",
    namespaced,
    schema = "disabled"
)]
pub struct VirtualMachineInstanceSpec {
    /// Volumes attached to the instance
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,

    /// Fields the controller does not interpret
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A volume of an instance (partial)
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    /// Volume name, unique within the instance
    pub name: String,

    /// Backing claim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim: Option<ClaimVolumeSource>,

    /// Backing DataVolume; its claim has the same name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_volume: Option<DataVolumeSource>,

    /// Fields the controller does not interpret
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Volume {
    /// Name of the claim backing this volume, for claim-backed volumes
    pub fn claim_name(&self) -> Option<&str> {
        if let Some(pvc) = &self.persistent_volume_claim {
            return Some(pvc.claim_name.as_str());
        }
        self.data_volume.as_ref().map(|dv| dv.name.as_str())
    }
}

/// Claim reference of a volume
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClaimVolumeSource {
    /// Claim name
    pub claim_name: String,

    /// Fields the controller does not interpret
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// DataVolume reference of a volume
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct DataVolumeSource {
    /// DataVolume name
    pub name: String,

    /// Fields the controller does not interpret
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl VirtualMachine {
    /// Effective run strategy
    ///
    /// Derived from `runStrategy` or the legacy `running` flag; a VM
    /// setting neither is halted, one setting both is invalid.
    pub fn run_strategy(&self) -> Result<RunStrategy, Error> {
        match (self.spec.running, self.spec.run_strategy) {
            (Some(_), Some(_)) => Err(Error::validation_for(
                kube::ResourceExt::name_any(self),
                "running and runStrategy are mutually exclusive",
            )),
            (Some(true), None) => Ok(RunStrategy::Always),
            (Some(false), None) | (None, None) => Ok(RunStrategy::Halted),
            (None, Some(strategy)) => Ok(strategy),
        }
    }

    /// Template volumes, in declaration order
    pub fn volumes(&self) -> &[Volume] {
        self.spec
            .template
            .as_ref()
            .and_then(|t| t.spec.as_ref())
            .map(|s| s.volumes.as_slice())
            .unwrap_or_default()
    }

    /// Name of the snapshot holding this VM's lock marker
    pub fn snapshot_in_progress(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.snapshot_in_progress.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> VirtualMachine {
        serde_yaml::from_str(yaml).unwrap()
    }

    const VM: &str = r##"
apiVersion: kubevirt.io/v1
kind: VirtualMachine
metadata:
  name: vm1
  namespace: default
spec:
  runStrategy: Halted
  template:
    metadata:
      labels:
        kubevirt.io/vm: vm1
    spec:
      domain:
        devices:
          disks:
            - name: rootdisk
      volumes:
        - name: rootdisk
          dataVolume:
            name: vm1-root
        - name: data
          persistentVolumeClaim:
            claimName: vm1-data
            readOnly: false
        - name: cloudinit
          cloudInitNoCloud:
            userData: "#cloud-config"
status:
  printableStatus: Stopped
"##;

    #[test]
    fn claim_names_cover_pvc_and_datavolume() {
        let vm = parse(VM);
        let claims: Vec<_> = vm.volumes().iter().filter_map(Volume::claim_name).collect();
        assert_eq!(claims, vec!["vm1-root", "vm1-data"]);
    }

    #[test]
    fn uninterpreted_fields_survive_round_trip() {
        let vm = parse(VM);
        let json = serde_json::to_value(&vm).unwrap();
        assert_eq!(
            json.pointer("/spec/template/spec/domain/devices/disks/0/name"),
            Some(&Value::String("rootdisk".to_string()))
        );
        assert_eq!(
            json.pointer("/spec/template/spec/volumes/1/persistentVolumeClaim/readOnly"),
            Some(&Value::Bool(false))
        );
        assert_eq!(
            json.pointer("/spec/template/metadata/labels/kubevirt.io~1vm"),
            Some(&Value::String("vm1".to_string()))
        );
        assert_eq!(json.pointer("/status/printableStatus"), Some(&Value::String("Stopped".to_string())));
    }

    mod run_strategy {
        use super::*;

        fn vm(running: Option<bool>, strategy: Option<RunStrategy>) -> VirtualMachine {
            let mut vm = VirtualMachine::new("vm1", VirtualMachineSpec::default());
            vm.spec.running = running;
            vm.spec.run_strategy = strategy;
            vm
        }

        #[test]
        fn legacy_running_flag_maps_to_strategy() {
            assert_eq!(vm(Some(true), None).run_strategy().unwrap(), RunStrategy::Always);
            assert_eq!(vm(Some(false), None).run_strategy().unwrap(), RunStrategy::Halted);
        }

        #[test]
        fn neither_field_means_halted() {
            assert_eq!(vm(None, None).run_strategy().unwrap(), RunStrategy::Halted);
        }

        #[test]
        fn explicit_strategy_is_used() {
            assert_eq!(
                vm(None, Some(RunStrategy::Manual)).run_strategy().unwrap(),
                RunStrategy::Manual
            );
        }

        #[test]
        fn both_fields_are_rejected() {
            let err = vm(Some(false), Some(RunStrategy::Halted))
                .run_strategy()
                .unwrap_err();
            assert!(err.is_configuration());
        }
    }

    #[test]
    fn lock_marker_reads_from_status() {
        let mut vm = parse(VM);
        assert_eq!(vm.snapshot_in_progress(), None);
        vm.status
            .get_or_insert_with(Default::default)
            .snapshot_in_progress = Some("snap1".to_string());
        assert_eq!(vm.snapshot_in_progress(), Some("snap1"));
    }
}
