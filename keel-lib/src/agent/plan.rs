// SPDX-License-Identifier: GPL-2.0-only
//! Desired versus actual VMs on one node.

use crate::id::Id;
use crate::model::{Deployment, Image, Instance, InstanceStatus, Vm, VmStatus};
use crate::runtime::VmHandle;
use crate::store::traits::{StateStore, StoreError};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

/// An instance that should have a running VM here, with what it takes to boot it.
#[derive(Debug, Clone)]
pub struct DesiredInstance {
    pub instance: Instance,
    pub deployment: Deployment,
    pub image: Image,
}

/// What the store says this node should be running. Always rebuilt from
/// the store, never carried over between passes.
#[derive(Debug, Clone, Default)]
pub struct DesiredState {
    pub instances: BTreeMap<Id, DesiredInstance>,
    /// Instances bound here that are winding down.
    pub stopping: BTreeSet<Id>,
    /// Live VM rows on this node, by VM id.
    pub vms: BTreeMap<Id, Vm>,
}

impl DesiredState {
    pub fn load<S: StateStore + ?Sized>(store: &S, server_id: Id) -> Result<Self, StoreError> {
        let mut state = DesiredState::default();

        for instance in store.list_instances_for_server(server_id)? {
            if instance.status == InstanceStatus::Stopping {
                state.stopping.insert(instance.id);
                continue;
            }
            if !instance.status.wants_vm() {
                continue;
            }
            let Some(deployment) = store.get_deployment(instance.deployment_id)? else {
                warn!(instance_id = %instance.id, "instance without deployment");
                continue;
            };
            let Some(image) = store.get_image(instance.image_id)? else {
                warn!(instance_id = %instance.id, "instance without image");
                continue;
            };
            state.instances.insert(
                instance.id,
                DesiredInstance {
                    instance,
                    deployment,
                    image,
                },
            );
        }

        for vm in store.list_vms_for_server(server_id)? {
            state.vms.insert(vm.id, vm);
        }
        Ok(state)
    }

    fn vm_for_instance(&self, instance_id: Id) -> Option<&Vm> {
        self.vms.values().find(|vm| vm.instance_id == instance_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Boot a VM for a desired instance that has none.
    Create { instance_id: Id },
    /// The VM is up but the store has not caught up, e.g. after a restart.
    Adopt { instance_id: Id, vm_id: Id },
    /// Tear down a running VM nobody wants.
    Stop { handle: VmHandle },
    /// Clean up after a VM whose process is gone. `lost` when it was
    /// serving a desired instance.
    Release { handle: VmHandle, lost: bool },
    /// A stopping instance with nothing left to stop.
    Finish { instance_id: Id },
}

impl Action {
    /// The instance whose VM the action touches. Actions on the same
    /// instance are serialized.
    pub fn instance_id(&self) -> Id {
        match self {
            Action::Create { instance_id }
            | Action::Adopt { instance_id, .. }
            | Action::Finish { instance_id } => *instance_id,
            Action::Stop { handle } | Action::Release { handle, .. } => handle.instance_id,
        }
    }
}

/// Compute the actions that move `actual` towards `desired`. Pure: an
/// empty plan means the node has converged.
pub fn plan(desired: &DesiredState, actual: &[VmHandle]) -> Vec<Action> {
    let mut actions = Vec::new();
    let alive: BTreeSet<Id> = actual.iter().map(|h| h.vm_id).collect();
    let alive_instances: BTreeSet<Id> = actual.iter().map(|h| h.instance_id).collect();

    for handle in actual {
        let wanted = desired.vms.get(&handle.vm_id).and_then(|vm| {
            desired
                .instances
                .get(&vm.instance_id)
                .filter(|_| vm.instance_id == handle.instance_id)
                .map(|d| (vm, d))
        });
        match wanted {
            Some((vm, d)) => {
                if vm.status != VmStatus::Running
                    || d.instance.status != InstanceStatus::Running
                {
                    actions.push(Action::Adopt {
                        instance_id: d.instance.id,
                        vm_id: vm.id,
                    });
                }
            }
            None => actions.push(Action::Stop {
                handle: handle.clone(),
            }),
        }
    }

    for vm in desired.vms.values() {
        if alive.contains(&vm.id) {
            continue;
        }
        let still_wanted = desired.instances.contains_key(&vm.instance_id);
        actions.push(Action::Release {
            handle: VmHandle {
                vm_id: vm.id,
                instance_id: vm.instance_id,
                pid: None,
                tap_device: vm.tap_device.clone(),
            },
            lost: still_wanted && vm.status == VmStatus::Running,
        });
    }

    for id in desired.instances.keys() {
        if desired.vm_for_instance(*id).is_none() && !alive_instances.contains(id) {
            actions.push(Action::Create { instance_id: *id });
        }
    }

    for id in &desired.stopping {
        if desired.vm_for_instance(*id).is_none() && !alive_instances.contains(id) {
            actions.push(Action::Finish { instance_id: *id });
        }
    }

    actions
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(id: i64, status: InstanceStatus) -> Instance {
        Instance {
            id: Id::from_i64(id),
            deployment_id: Id::from_i64(100),
            image_id: Id::from_i64(200),
            server_id: Some(Id::from_i64(300)),
            status,
            error: None,
            attempts: 0,
            failed_at: None,
            created_at: 0,
            updated_at: 0,
            deleted_at: None,
        }
    }

    fn desired(instance: Instance) -> DesiredInstance {
        DesiredInstance {
            instance,
            deployment: Deployment {
                id: Id::from_i64(100),
                app_id: Id::from_i64(400),
                build_id: Id::from_i64(500),
                replicas: 1,
                vcpus: 1,
                memory_mib: 128,
                port: 8080,
                env: vec![],
                status: crate::model::DeploymentStatus::Active,
                error: None,
                created_at: 0,
                updated_at: 0,
                deleted_at: None,
            },
            image: Image {
                id: Id::from_i64(200),
                registry: "r".into(),
                repository: "web".into(),
                tag: "v1".into(),
                digest: "sha256:1".into(),
                created_at: 0,
                deleted_at: None,
            },
        }
    }

    fn vm(id: i64, instance_id: i64, status: VmStatus) -> Vm {
        Vm {
            id: Id::from_i64(id),
            instance_id: Id::from_i64(instance_id),
            server_id: Id::from_i64(300),
            image_id: Id::from_i64(200),
            vcpus: 1,
            memory_mib: 128,
            port: 8080,
            status,
            subnet: "10.80.0.0/30".into(),
            guest_ip: "10.80.0.2".into(),
            gateway_ip: "10.80.0.1".into(),
            tap_device: None,
            pid: None,
            created_at: 0,
            updated_at: 0,
            deleted_at: None,
        }
    }

    fn handle(vm_id: i64, instance_id: i64) -> VmHandle {
        VmHandle {
            vm_id: Id::from_i64(vm_id),
            instance_id: Id::from_i64(instance_id),
            pid: Some(1),
            tap_device: None,
        }
    }

    fn state(instances: Vec<Instance>, vms: Vec<Vm>) -> DesiredState {
        let mut s = DesiredState::default();
        for i in instances {
            if i.status == InstanceStatus::Stopping {
                s.stopping.insert(i.id);
            } else {
                s.instances.insert(i.id, desired(i));
            }
        }
        for v in vms {
            s.vms.insert(v.id, v);
        }
        s
    }

    #[test]
    fn converged_node_plans_nothing() {
        let s = state(
            vec![instance(1, InstanceStatus::Running)],
            vec![vm(10, 1, VmStatus::Running)],
        );
        assert!(plan(&s, &[handle(10, 1)]).is_empty());
    }

    #[test]
    fn missing_vm_is_created() {
        let s = state(vec![instance(1, InstanceStatus::Scheduled)], vec![]);
        assert_eq!(
            plan(&s, &[]),
            vec![Action::Create { instance_id: Id::from_i64(1) }]
        );
    }

    #[test]
    fn unwanted_vm_is_stopped() {
        let s = state(vec![], vec![]);
        assert_eq!(plan(&s, &[handle(10, 1)]), vec![Action::Stop { handle: handle(10, 1) }]);
    }

    #[test]
    fn stopping_instance_stops_then_finishes() {
        let s = state(
            vec![instance(1, InstanceStatus::Stopping)],
            vec![vm(10, 1, VmStatus::Running)],
        );
        assert_eq!(plan(&s, &[handle(10, 1)]), vec![Action::Stop { handle: handle(10, 1) }]);

        let gone = state(vec![instance(1, InstanceStatus::Stopping)], vec![]);
        assert_eq!(
            plan(&gone, &[]),
            vec![Action::Finish { instance_id: Id::from_i64(1) }]
        );
    }

    #[test]
    fn vanished_running_vm_is_lost() {
        let s = state(
            vec![instance(1, InstanceStatus::Running)],
            vec![vm(10, 1, VmStatus::Running)],
        );
        let actions = plan(&s, &[]);
        assert_eq!(actions.len(), 1);
        assert!(matches!(&actions[0], Action::Release { lost: true, handle } if handle.vm_id == Id::from_i64(10)));
    }

    #[test]
    fn half_created_vm_is_released_not_failed() {
        let s = state(
            vec![instance(1, InstanceStatus::Starting)],
            vec![vm(10, 1, VmStatus::Starting)],
        );
        let actions = plan(&s, &[]);
        assert!(matches!(&actions[..], [Action::Release { lost: false, .. }]));
    }

    #[test]
    fn running_vm_with_lagging_store_is_adopted() {
        let s = state(
            vec![instance(1, InstanceStatus::Starting)],
            vec![vm(10, 1, VmStatus::Starting)],
        );
        assert_eq!(
            plan(&s, &[handle(10, 1)]),
            vec![Action::Adopt {
                instance_id: Id::from_i64(1),
                vm_id: Id::from_i64(10)
            }]
        );
    }

    #[test]
    fn replaced_revision_swaps_one_vm() {
        // Old instance stopping, new one scheduled
        let s = state(
            vec![
                instance(1, InstanceStatus::Stopping),
                instance(2, InstanceStatus::Scheduled),
            ],
            vec![vm(10, 1, VmStatus::Running)],
        );
        let actions = plan(&s, &[handle(10, 1)]);
        assert_eq!(actions.len(), 2);
        assert!(actions.contains(&Action::Stop { handle: handle(10, 1) }));
        assert!(actions.contains(&Action::Create { instance_id: Id::from_i64(2) }));
    }
}
