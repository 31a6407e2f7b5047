/* This file is part of Ferroshare
 *
 * Copyright (C) 2024-2026 Ferroshare Contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as
 * published by the Free Software Foundation, either version 3 of the
 * License, or (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use std::{net::IpAddr, sync::Arc};

use ipnet::IpNet;
use log::debug;
use smol::lock::{RwLock, RwLockReadGuard};

use super::endpoint::Endpoint;
use crate::system::{Subscriber, SubscriberPtr, Subscription};

/// Atomic pointer to the security manager.
pub type SecurityPtr = Arc<SecurityManager>;

/// The deny rules currently in force.
///
/// Rules added since the last completed sanity check are staged separately
/// so that components holding live data structures can sweep exactly the
/// entries the newest rules invalidate, without rescanning against the
/// whole rule set.
#[derive(Default)]
pub struct RuleSet {
    denied: Vec<IpNet>,
    newly_denied: Vec<IpNet>,
}

impl RuleSet {
    /// Whether any rule, settled or staged, denies this endpoint.
    pub fn is_denied(&self, endpoint: &Endpoint) -> bool {
        let ip = endpoint.ip();
        self.denied.iter().any(|net| net.contains(&ip)) ||
            self.newly_denied.iter().any(|net| net.contains(&ip))
    }

    /// Whether a rule staged since the last sanity check denies this
    /// endpoint.
    pub fn is_newly_denied(&self, endpoint: &Endpoint) -> bool {
        let ip = endpoint.ip();
        self.newly_denied.iter().any(|net| net.contains(&ip))
    }
}

/// Manages the deny rules applied to remote endpoints.
///
/// Adding a rule stages it and broadcasts a sanity-check request. Each
/// component holding host state is expected to sweep its entries against
/// `is_newly_denied()` and report back via `sanity_check_performed()`,
/// after which the staged rules are settled.
///
/// Lock order: components take the rule lock *before* any internal lock of
/// their own, and never query this manager while holding such a lock.
pub struct SecurityManager {
    rules: RwLock<RuleSet>,
    sanity_check: SubscriberPtr<()>,
    sanity_performed: SubscriberPtr<usize>,
}

impl SecurityManager {
    pub fn new() -> SecurityPtr {
        Arc::new(Self {
            rules: RwLock::new(RuleSet::default()),
            sanity_check: Subscriber::new(),
            sanity_performed: Subscriber::new(),
        })
    }

    /// Deny a whole network block. The rule takes effect immediately for
    /// new inputs; live entries are swept by the sanity-check cycle this
    /// call kicks off.
    pub async fn deny(&self, net: IpNet) {
        debug!(target: "net::security::deny()", "Denying {}", net);
        self.rules.write().await.newly_denied.push(net);
        self.sanity_check.notify(()).await;
    }

    /// Deny a single address.
    pub async fn deny_addr(&self, ip: IpAddr) {
        self.deny(IpNet::from(ip)).await
    }

    pub async fn is_denied(&self, endpoint: &Endpoint) -> bool {
        self.rules.read().await.is_denied(endpoint)
    }

    /// Take the rule read lock for a bulk sweep. Held for the whole sweep
    /// so no rule settles midway through.
    pub async fn read_rules(&self) -> RwLockReadGuard<'_, RuleSet> {
        self.rules.read().await
    }

    pub async fn subscribe_sanity_check(&self) -> Subscription<()> {
        self.sanity_check.clone().subscribe().await
    }

    pub async fn subscribe_sanity_performed(&self) -> Subscription<usize> {
        self.sanity_performed.clone().subscribe().await
    }

    /// Called by a component once its sweep is done. Settles the staged
    /// rules and broadcasts the number of entries the sweep removed.
    pub async fn sanity_check_performed(&self, removed: usize) {
        {
            let mut rules = self.rules.write().await;
            let mut newly = std::mem::take(&mut rules.newly_denied);
            rules.denied.append(&mut newly);
        }
        debug!(
            target: "net::security::sanity_check_performed()",
            "Sanity check removed {} entries", removed
        );
        self.sanity_performed.notify(removed).await;
    }
}
