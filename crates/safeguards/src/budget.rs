//! Storage budget accounting. A reservation is taken against a candidate's
//! size estimate while its build is in flight and released on completion or
//! failure; at no observable instant does used + reserved exceed the
//! configured ceilings.
use std::{
    collections::HashMap,
    sync::Arc,
};

use common::{
    knobs::{
        GLOBAL_STORAGE_BUDGET_BYTES,
        TENANT_STORAGE_BUDGET_BYTES,
    },
    types::TenantId,
};
use parking_lot::Mutex;

#[derive(Default)]
#[derive(Debug)]
struct Accounts {
    used_global: u64,
    reserved_global: u64,
    used_by_tenant: HashMap<TenantId, u64>,
    reserved_by_tenant: HashMap<TenantId, u64>,
}

pub struct StorageBudget {
    global_limit: u64,
    tenant_limit: u64,
    accounts: Arc<Mutex<Accounts>>,
}

/// Holds reserved bytes until dropped (release) or committed (moved to used).
#[derive(Debug)]
pub struct Reservation {
    tenant: TenantId,
    bytes: u64,
    accounts: Arc<Mutex<Accounts>>,
    committed: bool,
}

impl StorageBudget {
    pub fn new() -> Self {
        Self::with_limits(*GLOBAL_STORAGE_BUDGET_BYTES, *TENANT_STORAGE_BUDGET_BYTES)
    }

    pub fn with_limits(global_limit: u64, tenant_limit: u64) -> Self {
        Self {
            global_limit,
            tenant_limit,
            accounts: Arc::new(Mutex::new(Accounts::default())),
        }
    }

    /// Reset the used counters from observed live index sizes.
    pub fn set_used(&self, by_tenant: HashMap<TenantId, u64>) {
        let mut accounts = self.accounts.lock();
        accounts.used_global = by_tenant.values().sum();
        accounts.used_by_tenant = by_tenant;
    }

    pub fn try_reserve(&self, tenant: &TenantId, bytes: u64) -> Option<Reservation> {
        let mut accounts = self.accounts.lock();
        let tenant_used = accounts.used_by_tenant.get(tenant).copied().unwrap_or(0);
        let tenant_reserved = accounts.reserved_by_tenant.get(tenant).copied().unwrap_or(0);
        if tenant_used + tenant_reserved + bytes > self.tenant_limit {
            return None;
        }
        if accounts.used_global + accounts.reserved_global + bytes > self.global_limit {
            return None;
        }
        accounts.reserved_global += bytes;
        *accounts.reserved_by_tenant.entry(tenant.clone()).or_default() += bytes;
        Some(Reservation {
            tenant: tenant.clone(),
            bytes,
            accounts: self.accounts.clone(),
            committed: false,
        })
    }

    pub fn used_global(&self) -> u64 {
        self.accounts.lock().used_global
    }

    pub fn reserved_global(&self) -> u64 {
        self.accounts.lock().reserved_global
    }
}

impl Reservation {
    /// The build landed: the reservation becomes used space.
    pub fn commit(mut self) {
        let mut accounts = self.accounts.lock();
        accounts.reserved_global = accounts.reserved_global.saturating_sub(self.bytes);
        if let Some(reserved) = accounts.reserved_by_tenant.get_mut(&self.tenant) {
            *reserved = reserved.saturating_sub(self.bytes);
        }
        accounts.used_global += self.bytes;
        *accounts.used_by_tenant.entry(self.tenant.clone()).or_default() += self.bytes;
        self.committed = true;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let mut accounts = self.accounts.lock();
        accounts.reserved_global = accounts.reserved_global.saturating_sub(self.bytes);
        if let Some(reserved) = accounts.reserved_by_tenant.get_mut(&self.tenant) {
            *reserved = reserved.saturating_sub(self.bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use common::types::TenantId;

    use super::StorageBudget;

    const MB: u64 = 1024 * 1024;

    #[test]
    fn test_reserve_commit_and_release() {
        let budget = StorageBudget::with_limits(100 * MB, 100 * MB);
        let tenant = TenantId::new("acme");

        let r1 = budget.try_reserve(&tenant, 30 * MB).unwrap();
        let r2 = budget.try_reserve(&tenant, 30 * MB).unwrap();
        let r3 = budget.try_reserve(&tenant, 30 * MB).unwrap();
        // 90 MB held: a fourth 30 MB reservation exceeds the ceiling.
        assert!(budget.try_reserve(&tenant, 30 * MB).is_none());

        r1.commit();
        drop(r2);
        // 30 used + 30 reserved: another 30 fits again.
        let r4 = budget.try_reserve(&tenant, 30 * MB).unwrap();
        assert_eq!(budget.used_global(), 30 * MB);
        assert_eq!(budget.reserved_global(), 60 * MB);
        drop(r3);
        drop(r4);
        assert_eq!(budget.reserved_global(), 0);
    }

    #[test]
    fn test_per_tenant_ceiling_is_independent() {
        let budget = StorageBudget::with_limits(1000 * MB, 50 * MB);
        let acme = TenantId::new("acme");
        let globex = TenantId::new("globex");

        let _a = budget.try_reserve(&acme, 40 * MB).unwrap();
        assert!(budget.try_reserve(&acme, 20 * MB).is_none());
        // Another tenant still has its own headroom.
        assert!(budget.try_reserve(&globex, 40 * MB).is_some());
    }

    #[test]
    fn test_invariant_used_plus_reserved_never_exceeds_budget() {
        let budget = StorageBudget::with_limits(100 * MB, 100 * MB);
        let tenant = TenantId::new("acme");
        let mut held = Vec::new();
        for _ in 0..10 {
            if let Some(r) = budget.try_reserve(&tenant, 30 * MB) {
                held.push(r);
            }
            assert!(budget.used_global() + budget.reserved_global() <= 100 * MB);
        }
        assert_eq!(held.len(), 3);
    }
}
