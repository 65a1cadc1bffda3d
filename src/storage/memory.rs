//! In-memory repository.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::info;

use super::*;

#[derive(Default)]
struct Tables {
    users: HashMap<String, User>,
    last: HashMap<String, Last>,
    capabilities: HashMap<(String, String), Capabilities>,
    offline: HashMap<String, Vec<Element>>,
    block_list: HashMap<String, Vec<BlockListItem>>,
    private: HashMap<(String, String), Element>,
    roster_items: HashMap<String, BTreeMap<String, RosterItem>>,
    roster_versions: HashMap<String, i32>,
    roster_notifications: HashMap<String, BTreeMap<String, RosterNotification>>,
    vcards: HashMap<String, Element>,
    archive: HashMap<String, Vec<ArchiveMessage>>,
    pubsub_nodes: BTreeMap<(String, String), PubSubNode>,
    pubsub_affiliations: HashMap<(String, String), Vec<PubSubAffiliation>>,
    pubsub_subscriptions: HashMap<(String, String), Vec<PubSubSubscription>>,
    pubsub_items: HashMap<(String, String), Vec<PubSubItem>>,
}

impl Tables {
    fn bump_roster_version(&mut self, username: &str) -> i32 {
        let ver = self.roster_versions.entry(username.to_string()).or_insert(0);
        *ver += 1;
        *ver
    }
}

/// Thread-safe repository keeping every table in process memory.
///
/// Each operation is atomic on its own; transactions are serialized against
/// each other.
#[derive(Default)]
pub struct MemoryRepository {
    tables: Mutex<Tables>,
    tx_lock: tokio::sync::Mutex<()>,
    locks: Mutex<HashSet<String>>,
    lock_released: Notify,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

fn key(a: &str, b: &str) -> (String, String) {
    (a.to_string(), b.to_string())
}

#[async_trait]
impl UserRepository for MemoryRepository {
    async fn upsert_user(&self, user: &User) -> Result<(), StorageError> {
        self.tables
            .lock()
            .users
            .insert(user.username.clone(), user.clone());
        Ok(())
    }

    async fn delete_user(&self, username: &str) -> Result<(), StorageError> {
        self.tables.lock().users.remove(username);
        Ok(())
    }

    async fn fetch_user(&self, username: &str) -> Result<Option<User>, StorageError> {
        Ok(self.tables.lock().users.get(username).cloned())
    }

    async fn user_exists(&self, username: &str) -> Result<bool, StorageError> {
        Ok(self.tables.lock().users.contains_key(username))
    }
}

#[async_trait]
impl LastRepository for MemoryRepository {
    async fn upsert_last(&self, last: &Last) -> Result<(), StorageError> {
        self.tables
            .lock()
            .last
            .insert(last.username.clone(), last.clone());
        Ok(())
    }

    async fn fetch_last(&self, username: &str) -> Result<Option<Last>, StorageError> {
        Ok(self.tables.lock().last.get(username).cloned())
    }

    async fn delete_last(&self, username: &str) -> Result<(), StorageError> {
        self.tables.lock().last.remove(username);
        Ok(())
    }
}

#[async_trait]
impl CapabilitiesRepository for MemoryRepository {
    async fn upsert_capabilities(&self, caps: &Capabilities) -> Result<(), StorageError> {
        self.tables
            .lock()
            .capabilities
            .insert(key(&caps.node, &caps.ver), caps.clone());
        Ok(())
    }

    async fn capabilities_exist(&self, node: &str, ver: &str) -> Result<bool, StorageError> {
        Ok(self.tables.lock().capabilities.contains_key(&key(node, ver)))
    }

    async fn fetch_capabilities(
        &self,
        node: &str,
        ver: &str,
    ) -> Result<Option<Capabilities>, StorageError> {
        Ok(self.tables.lock().capabilities.get(&key(node, ver)).cloned())
    }
}

#[async_trait]
impl OfflineRepository for MemoryRepository {
    async fn insert_offline_message(
        &self,
        message: &Element,
        username: &str,
    ) -> Result<(), StorageError> {
        self.tables
            .lock()
            .offline
            .entry(username.to_string())
            .or_default()
            .push(message.clone());
        Ok(())
    }

    async fn count_offline_messages(&self, username: &str) -> Result<usize, StorageError> {
        Ok(self
            .tables
            .lock()
            .offline
            .get(username)
            .map_or(0, |q| q.len()))
    }

    async fn fetch_offline_messages(&self, username: &str) -> Result<Vec<Element>, StorageError> {
        Ok(self
            .tables
            .lock()
            .offline
            .get(username)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_offline_messages(&self, username: &str) -> Result<(), StorageError> {
        self.tables.lock().offline.remove(username);
        Ok(())
    }
}

#[async_trait]
impl BlockListRepository for MemoryRepository {
    async fn upsert_block_list_item(&self, item: &BlockListItem) -> Result<(), StorageError> {
        let mut tables = self.tables.lock();
        let list = tables.block_list.entry(item.username.clone()).or_default();
        if !list.contains(item) {
            list.push(item.clone());
        }
        Ok(())
    }

    async fn delete_block_list_item(&self, item: &BlockListItem) -> Result<(), StorageError> {
        if let Some(list) = self.tables.lock().block_list.get_mut(&item.username) {
            list.retain(|i| i != item);
        }
        Ok(())
    }

    async fn fetch_block_list_items(
        &self,
        username: &str,
    ) -> Result<Vec<BlockListItem>, StorageError> {
        Ok(self
            .tables
            .lock()
            .block_list
            .get(username)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_block_list_items(&self, username: &str) -> Result<(), StorageError> {
        self.tables.lock().block_list.remove(username);
        Ok(())
    }
}

#[async_trait]
impl PrivateRepository for MemoryRepository {
    async fn upsert_private(
        &self,
        private: &Element,
        namespace: &str,
        username: &str,
    ) -> Result<(), StorageError> {
        self.tables
            .lock()
            .private
            .insert(key(username, namespace), private.clone());
        Ok(())
    }

    async fn fetch_private(
        &self,
        namespace: &str,
        username: &str,
    ) -> Result<Option<Element>, StorageError> {
        Ok(self
            .tables
            .lock()
            .private
            .get(&key(username, namespace))
            .cloned())
    }

    async fn delete_private(&self, username: &str) -> Result<(), StorageError> {
        self.tables.lock().private.retain(|(u, _), _| u != username);
        Ok(())
    }
}

#[async_trait]
impl RosterRepository for MemoryRepository {
    async fn upsert_roster_item(&self, item: &RosterItem) -> Result<i32, StorageError> {
        let mut tables = self.tables.lock();
        tables
            .roster_items
            .entry(item.username.clone())
            .or_default()
            .insert(item.jid.clone(), item.clone());
        Ok(tables.bump_roster_version(&item.username))
    }

    async fn delete_roster_item(&self, username: &str, jid: &str) -> Result<i32, StorageError> {
        let mut tables = self.tables.lock();
        if let Some(items) = tables.roster_items.get_mut(username) {
            items.remove(jid);
        }
        Ok(tables.bump_roster_version(username))
    }

    async fn fetch_roster_items(&self, username: &str) -> Result<Vec<RosterItem>, StorageError> {
        Ok(self
            .tables
            .lock()
            .roster_items
            .get(username)
            .map(|items| items.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn fetch_roster_items_in_groups(
        &self,
        username: &str,
        groups: &[String],
    ) -> Result<Vec<RosterItem>, StorageError> {
        Ok(self
            .tables
            .lock()
            .roster_items
            .get(username)
            .map(|items| {
                items
                    .values()
                    .filter(|i| i.groups.iter().any(|g| groups.contains(g)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn fetch_roster_item(
        &self,
        username: &str,
        jid: &str,
    ) -> Result<Option<RosterItem>, StorageError> {
        Ok(self
            .tables
            .lock()
            .roster_items
            .get(username)
            .and_then(|items| items.get(jid).cloned()))
    }

    async fn fetch_roster_groups(&self, username: &str) -> Result<Vec<String>, StorageError> {
        let tables = self.tables.lock();
        let mut groups: Vec<String> = tables
            .roster_items
            .get(username)
            .map(|items| items.values().flat_map(|i| i.groups.iter().cloned()).collect())
            .unwrap_or_default();
        groups.sort();
        groups.dedup();
        Ok(groups)
    }

    async fn fetch_roster_version(&self, username: &str) -> Result<i32, StorageError> {
        Ok(self
            .tables
            .lock()
            .roster_versions
            .get(username)
            .copied()
            .unwrap_or(0))
    }

    async fn upsert_roster_notification(
        &self,
        notification: &RosterNotification,
    ) -> Result<(), StorageError> {
        self.tables
            .lock()
            .roster_notifications
            .entry(notification.contact.clone())
            .or_default()
            .insert(notification.jid.clone(), notification.clone());
        Ok(())
    }

    async fn delete_roster_notification(
        &self,
        contact: &str,
        jid: &str,
    ) -> Result<(), StorageError> {
        if let Some(notifications) = self.tables.lock().roster_notifications.get_mut(contact) {
            notifications.remove(jid);
        }
        Ok(())
    }

    async fn fetch_roster_notification(
        &self,
        contact: &str,
        jid: &str,
    ) -> Result<Option<RosterNotification>, StorageError> {
        Ok(self
            .tables
            .lock()
            .roster_notifications
            .get(contact)
            .and_then(|n| n.get(jid).cloned()))
    }

    async fn fetch_roster_notifications(
        &self,
        contact: &str,
    ) -> Result<Vec<RosterNotification>, StorageError> {
        Ok(self
            .tables
            .lock()
            .roster_notifications
            .get(contact)
            .map(|n| n.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete_roster(&self, username: &str) -> Result<(), StorageError> {
        let mut tables = self.tables.lock();
        tables.roster_items.remove(username);
        tables.roster_notifications.remove(username);
        tables.bump_roster_version(username);
        Ok(())
    }
}

#[async_trait]
impl VCardRepository for MemoryRepository {
    async fn upsert_vcard(&self, vcard: &Element, username: &str) -> Result<(), StorageError> {
        self.tables
            .lock()
            .vcards
            .insert(username.to_string(), vcard.clone());
        Ok(())
    }

    async fn fetch_vcard(&self, username: &str) -> Result<Option<Element>, StorageError> {
        Ok(self.tables.lock().vcards.get(username).cloned())
    }

    async fn delete_vcard(&self, username: &str) -> Result<(), StorageError> {
        self.tables.lock().vcards.remove(username);
        Ok(())
    }
}

#[async_trait]
impl ArchiveRepository for MemoryRepository {
    async fn insert_archive_message(&self, message: &ArchiveMessage) -> Result<(), StorageError> {
        self.tables
            .lock()
            .archive
            .entry(message.archive_id.clone())
            .or_default()
            .push(message.clone());
        Ok(())
    }

    async fn fetch_archive_messages(
        &self,
        archive_id: &str,
    ) -> Result<Vec<ArchiveMessage>, StorageError> {
        Ok(self
            .tables
            .lock()
            .archive
            .get(archive_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_archive(&self, archive_id: &str) -> Result<(), StorageError> {
        self.tables.lock().archive.remove(archive_id);
        Ok(())
    }
}

#[async_trait]
impl PubSubRepository for MemoryRepository {
    async fn upsert_node(&self, node: &PubSubNode) -> Result<(), StorageError> {
        self.tables
            .lock()
            .pubsub_nodes
            .insert(key(&node.host, &node.name), node.clone());
        Ok(())
    }

    async fn fetch_node(&self, host: &str, name: &str) -> Result<Option<PubSubNode>, StorageError> {
        Ok(self.tables.lock().pubsub_nodes.get(&key(host, name)).cloned())
    }

    async fn fetch_nodes(&self, host: &str) -> Result<Vec<PubSubNode>, StorageError> {
        Ok(self
            .tables
            .lock()
            .pubsub_nodes
            .values()
            .filter(|n| n.host == host)
            .cloned()
            .collect())
    }

    async fn delete_node(&self, host: &str, name: &str) -> Result<(), StorageError> {
        let k = key(host, name);
        let mut tables = self.tables.lock();
        tables.pubsub_nodes.remove(&k);
        tables.pubsub_affiliations.remove(&k);
        tables.pubsub_subscriptions.remove(&k);
        tables.pubsub_items.remove(&k);
        Ok(())
    }

    async fn upsert_node_affiliation(
        &self,
        affiliation: &PubSubAffiliation,
        host: &str,
        name: &str,
    ) -> Result<(), StorageError> {
        let mut tables = self.tables.lock();
        let list = tables.pubsub_affiliations.entry(key(host, name)).or_default();
        match list.iter_mut().find(|a| a.jid == affiliation.jid) {
            Some(existing) => *existing = affiliation.clone(),
            None => list.push(affiliation.clone()),
        }
        Ok(())
    }

    async fn fetch_node_affiliations(
        &self,
        host: &str,
        name: &str,
    ) -> Result<Vec<PubSubAffiliation>, StorageError> {
        Ok(self
            .tables
            .lock()
            .pubsub_affiliations
            .get(&key(host, name))
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_node_affiliation(
        &self,
        jid: &str,
        host: &str,
        name: &str,
    ) -> Result<(), StorageError> {
        if let Some(list) = self.tables.lock().pubsub_affiliations.get_mut(&key(host, name)) {
            list.retain(|a| a.jid != jid);
        }
        Ok(())
    }

    async fn upsert_node_subscription(
        &self,
        subscription: &PubSubSubscription,
        host: &str,
        name: &str,
    ) -> Result<(), StorageError> {
        let mut tables = self.tables.lock();
        let list = tables.pubsub_subscriptions.entry(key(host, name)).or_default();
        match list.iter_mut().find(|s| s.jid == subscription.jid) {
            Some(existing) => *existing = subscription.clone(),
            None => list.push(subscription.clone()),
        }
        Ok(())
    }

    async fn fetch_node_subscriptions(
        &self,
        host: &str,
        name: &str,
    ) -> Result<Vec<PubSubSubscription>, StorageError> {
        Ok(self
            .tables
            .lock()
            .pubsub_subscriptions
            .get(&key(host, name))
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_node_subscription(
        &self,
        jid: &str,
        host: &str,
        name: &str,
    ) -> Result<(), StorageError> {
        if let Some(list) = self.tables.lock().pubsub_subscriptions.get_mut(&key(host, name)) {
            list.retain(|s| s.jid != jid);
        }
        Ok(())
    }

    async fn upsert_node_item(
        &self,
        item: &PubSubItem,
        host: &str,
        name: &str,
        max_items: usize,
    ) -> Result<(), StorageError> {
        let mut tables = self.tables.lock();
        let list = tables.pubsub_items.entry(key(host, name)).or_default();
        list.retain(|i| i.id != item.id);
        list.push(item.clone());
        if max_items > 0 && list.len() > max_items {
            let excess = list.len() - max_items;
            list.drain(..excess);
        }
        Ok(())
    }

    async fn fetch_node_items(&self, host: &str, name: &str) -> Result<Vec<PubSubItem>, StorageError> {
        Ok(self
            .tables
            .lock()
            .pubsub_items
            .get(&key(host, name))
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl LockerRepository for MemoryRepository {
    async fn lock(&self, name: &str) -> Result<(), StorageError> {
        loop {
            // Register interest before checking so an unlock in between is not missed.
            let released = self.lock_released.notified();
            if self.locks.lock().insert(name.to_string()) {
                return Ok(());
            }
            released.await;
        }
    }

    async fn unlock(&self, name: &str) -> Result<(), StorageError> {
        self.locks.lock().remove(name);
        self.lock_released.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn in_transaction(&self, f: TxFn) -> Result<(), StorageError> {
        let _guard = self.tx_lock.lock().await;
        f(self as &dyn Repository).await
    }

    async fn start(&self) -> Result<(), StorageError> {
        info!("started in-memory repository");
        Ok(())
    }

    async fn stop(&self) -> Result<(), StorageError> {
        info!("stopped in-memory repository");
        Ok(())
    }
}
