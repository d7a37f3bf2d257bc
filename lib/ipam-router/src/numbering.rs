//! Interface index assignment

use ipam_api::InterfaceRecord;
use std::collections::BTreeSet;

/// How device indices are chosen when interfaces are added to a router
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Numbering {
    /// Existing interfaces keep their index; new ones take the lowest free
    /// index. Used for every attach and detach.
    Incremental,
    /// Every interface is renumbered from eth0 in role order (control, source
    /// NAT, public subnets, private gateway, guest tiers). Only used on rebuild.
    Canonical,
}

impl Numbering {
    /// Combine `existing` and `added` into one table ordered by index
    pub fn assign(
        self,
        existing: Vec<InterfaceRecord>,
        added: Vec<InterfaceRecord>,
    ) -> Vec<InterfaceRecord> {
        match self {
            Numbering::Incremental => assign_incremental(existing, added),
            Numbering::Canonical => assign_canonical(existing, added),
        }
    }
}

fn assign_incremental(
    existing: Vec<InterfaceRecord>,
    added: Vec<InterfaceRecord>,
) -> Vec<InterfaceRecord> {
    let mut used: BTreeSet<u32> = existing.iter().map(|i| i.index).collect();
    let mut table = existing;
    for mut iface in added {
        iface.index = lowest_free(&used);
        used.insert(iface.index);
        table.push(iface);
    }
    table.sort_by_key(|i| i.index);
    table
}

fn assign_canonical(
    mut existing: Vec<InterfaceRecord>,
    added: Vec<InterfaceRecord>,
) -> Vec<InterfaceRecord> {
    // Within a role, previous order is preserved and additions go last
    existing.sort_by_key(|i| i.index);
    let mut table = existing;
    table.extend(added);
    table.sort_by_key(|i| i.role.rank());
    for (index, iface) in table.iter_mut().enumerate() {
        iface.index = index as u32;
    }
    table
}

pub(crate) fn lowest_free(used: &BTreeSet<u32>) -> u32 {
    let mut candidate = 0;
    for index in used {
        if *index != candidate {
            break;
        }
        candidate += 1;
    }
    candidate
}
