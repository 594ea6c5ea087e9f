// SPDX-License-Identifier: GPL-2.0-only
use crate::id::Id;
use crate::model::{NewVm, Vm};
use crate::store::traits::{StoreError, VmStore};
use ipnetwork::Ipv4Network;
use std::net::Ipv4Addr;
use tracing::debug;

/// Give up after this many candidates lost to concurrent reservations.
pub const MAX_CONTENDED_ATTEMPTS: usize = 64;

/// Everything about a VM row except its subnet.
#[derive(Debug, Clone)]
pub struct VmRequest {
    pub instance_id: Id,
    pub server_id: Id,
    pub image_id: Id,
    pub vcpus: u32,
    pub memory_mib: u32,
    pub port: u16,
}

impl VmRequest {
    pub fn with_subnet(&self, subnet: Ipv4Network) -> NewVm {
        NewVm {
            instance_id: self.instance_id,
            server_id: self.server_id,
            image_id: self.image_id,
            vcpus: self.vcpus,
            memory_mib: self.memory_mib,
            port: self.port,
            subnet,
        }
    }
}

#[derive(Debug)]
pub enum AllocError {
    /// Every candidate subnet is taken.
    Exhausted,
    Store(StoreError),
}

impl std::fmt::Display for AllocError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AllocError::Exhausted => write!(f, "no free subnet"),
            AllocError::Store(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for AllocError {}

impl From<StoreError> for AllocError {
    fn from(e: StoreError) -> Self {
        AllocError::Store(e)
    }
}

/// Carves fixed-size VM subnets out of the node range.
///
/// There is no local bookkeeping: the store's overlap constraint is the
/// only lock. Known subnets are skipped up front and a candidate lost to
/// a concurrent insert just moves the walk on.
#[derive(Debug, Clone)]
pub struct SubnetAllocator {
    range: Ipv4Network,
    prefix: u8,
}

impl SubnetAllocator {
    pub fn new(range: Ipv4Network, prefix: u8) -> Result<Self, String> {
        if prefix < range.prefix() || prefix > 30 {
            return Err(format!(
                "vm prefix /{prefix} must be between /{} and /30",
                range.prefix()
            ));
        }
        Ok(SubnetAllocator { range, prefix })
    }

    pub fn range(&self) -> Ipv4Network {
        self.range
    }

    /// All `/prefix` blocks of the range, lowest first.
    pub fn candidates(&self) -> impl Iterator<Item = Ipv4Network> + '_ {
        let start = u32::from(self.range.network()) as u64;
        let end = u32::from(self.range.broadcast()) as u64;
        let step = 1u64 << (32 - self.prefix as u32);
        let prefix = self.prefix;
        (start..=end)
            .step_by(step as usize)
            .filter_map(move |addr| Ipv4Network::new(Ipv4Addr::from(addr as u32), prefix).ok())
    }

    /// Insert a VM row on the first free candidate.
    pub fn reserve<S: VmStore + ?Sized>(
        &self,
        store: &S,
        request: &VmRequest,
    ) -> Result<Vm, AllocError> {
        let taken: Vec<Ipv4Network> = store
            .list_vms_for_server(request.server_id)?
            .iter()
            .filter_map(|vm| vm.subnet.parse().ok())
            .collect();

        let mut contended = 0;
        for candidate in self.candidates() {
            if taken.iter().any(|t| t.overlaps(candidate)) {
                continue;
            }
            match store.insert_vm(&request.with_subnet(candidate)) {
                Ok(vm) => return Ok(vm),
                Err(StoreError::Exclusion(_)) => {
                    debug!(subnet = %candidate, instance_id = %request.instance_id, "subnet taken concurrently");
                    contended += 1;
                    if contended >= MAX_CONTENDED_ATTEMPTS {
                        break;
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(AllocError::Exhausted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::traits::InstanceStore;
    use crate::store::SqliteStore;
    use crate::test_support::{seed_deployment, Seed};
    use std::sync::Arc;

    fn request(seed: &Seed, instance_id: Id) -> VmRequest {
        VmRequest {
            instance_id,
            server_id: seed.server.id,
            image_id: seed.image.id,
            vcpus: 1,
            memory_mib: 128,
            port: 8080,
        }
    }

    #[test]
    fn candidates_tile_the_range() {
        let alloc = SubnetAllocator::new("10.80.0.0/28".parse().unwrap(), 30).unwrap();
        let all: Vec<String> = alloc.candidates().map(|c| c.to_string()).collect();
        assert_eq!(all, ["10.80.0.0/30", "10.80.0.4/30", "10.80.0.8/30", "10.80.0.12/30"]);
    }

    #[test]
    fn prefix_must_fit_the_range() {
        assert!(SubnetAllocator::new("10.80.0.0/16".parse().unwrap(), 8).is_err());
        assert!(SubnetAllocator::new("10.80.0.0/16".parse().unwrap(), 31).is_err());
        assert!(SubnetAllocator::new("10.80.0.0/16".parse().unwrap(), 29).is_ok());
    }

    #[test]
    fn reserve_skips_taken_subnets_and_exhausts() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open_and_init(&dir.path().join("alloc.db")).unwrap();
        let seed = seed_deployment(&store, "web", 3);
        let alloc = SubnetAllocator::new("10.80.0.0/29".parse().unwrap(), 30).unwrap();

        let a = store.create_instance(seed.deployment.id, seed.image.id).unwrap();
        let b = store.create_instance(seed.deployment.id, seed.image.id).unwrap();
        let c = store.create_instance(seed.deployment.id, seed.image.id).unwrap();

        let vm_a = alloc.reserve(&store, &request(&seed, a.id)).unwrap();
        let vm_b = alloc.reserve(&store, &request(&seed, b.id)).unwrap();
        assert_eq!(vm_a.subnet, "10.80.0.0/30");
        assert_eq!(vm_b.subnet, "10.80.0.4/30");
        assert!(matches!(
            alloc.reserve(&store, &request(&seed, c.id)),
            Err(AllocError::Exhausted)
        ));

        // A released subnet is handed out again
        store.release_vm(vm_a.id).unwrap();
        let vm_c = alloc.reserve(&store, &request(&seed, c.id)).unwrap();
        assert_eq!(vm_c.subnet, "10.80.0.0/30");
    }

    #[test]
    fn concurrent_agents_never_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("alloc.db");
        let store = SqliteStore::open_and_init(&db).unwrap();
        let seed = Arc::new(seed_deployment(&store, "web", 16));
        let instances: Vec<Id> = (0..16)
            .map(|_| store.create_instance(seed.deployment.id, seed.image.id).unwrap().id)
            .collect();

        let threads: Vec<_> = instances
            .into_iter()
            .map(|instance_id| {
                let db = db.clone();
                let seed = seed.clone();
                std::thread::spawn(move || {
                    // Each thread is its own process-like writer
                    let store = SqliteStore::open(&db).unwrap();
                    let alloc = SubnetAllocator::new("10.80.0.0/26".parse().unwrap(), 30).unwrap();
                    alloc.reserve(&store, &request(&seed, instance_id)).unwrap()
                })
            })
            .collect();
        let vms: Vec<Vm> = threads.into_iter().map(|t| t.join().unwrap()).collect();

        let nets: Vec<Ipv4Network> = vms.iter().map(|v| v.subnet.parse().unwrap()).collect();
        for (i, a) in nets.iter().enumerate() {
            for b in &nets[i + 1..] {
                assert!(!a.overlaps(*b), "{a} overlaps {b}");
            }
        }
        assert_eq!(store.list_vms_for_server(seed.server.id).unwrap().len(), 16);
    }
}
