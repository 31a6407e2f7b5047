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

use std::{collections::HashMap, sync::Arc};

use log::warn;
use rand::{rngs::OsRng, Rng};
use smol::{channel, lock::Mutex};

pub type SubscriberPtr<T> = Arc<Subscriber<T>>;

pub type SubscriptionId = u64;

/// Receiving end handed out by [`Subscriber::subscribe`].
pub struct Subscription<T> {
    id: SubscriptionId,
    recv_queue: channel::Receiver<T>,
    parent: Arc<Subscriber<T>>,
}

impl<T: Clone + Send + 'static> Subscription<T> {
    /// Receive the next notification.
    pub async fn receive(&self) -> T {
        match self.recv_queue.recv().await {
            Ok(message) => message,
            Err(err) => {
                panic!("Subscription::receive() recv_queue failed! {}", err);
            }
        }
    }

    /// Must be called manually since async Drop is not possible in Rust.
    pub async fn unsubscribe(&self) {
        self.parent.clone().unsubscribe(self.id).await
    }
}

/// Simple broadcast (publish-subscribe) class.
pub struct Subscriber<T> {
    subs: Mutex<HashMap<SubscriptionId, channel::Sender<T>>>,
}

impl<T: Clone + Send + 'static> Subscriber<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { subs: Mutex::new(HashMap::new()) })
    }

    pub async fn subscribe(self: Arc<Self>) -> Subscription<T> {
        let (sender, recvr) = channel::unbounded();

        let sub_id = OsRng.gen();

        self.subs.lock().await.insert(sub_id, sender);

        Subscription { id: sub_id, recv_queue: recvr, parent: self.clone() }
    }

    async fn unsubscribe(self: Arc<Self>, sub_id: SubscriptionId) {
        self.subs.lock().await.remove(&sub_id);
    }

    /// Broadcast a message to all active subscriptions. Subscriptions whose
    /// receiver has been dropped without unsubscribing are skipped.
    pub async fn notify(&self, message: T) {
        for sub in (*self.subs.lock().await).values() {
            if let Err(err) = sub.send(message.clone()).await {
                warn!(
                    target: "system::subscriber::notify()",
                    "Failed sending to dropped subscription: {}", err
                );
            }
        }
    }
}
