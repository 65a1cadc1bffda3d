//! Repository contract, in-memory backend and cache decorator.
//!
//! The repository is split into one sub-trait per entity family. A backend
//! implements all of them plus [`Repository`]; the cached decorator wraps any
//! backend behind the same trait object so callers never know whether a
//! cache sits in between.

pub mod cache;
pub mod cached;
pub mod memory;
pub mod model;

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;

use crate::error::StorageError;
use crate::xml::Element;

pub use cache::{Cache, MemoryCache};
pub use cached::CachedRepository;
pub use memory::MemoryRepository;
pub use model::*;

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn upsert_user(&self, user: &User) -> Result<(), StorageError>;
    async fn delete_user(&self, username: &str) -> Result<(), StorageError>;
    async fn fetch_user(&self, username: &str) -> Result<Option<User>, StorageError>;
    async fn user_exists(&self, username: &str) -> Result<bool, StorageError>;
}

#[async_trait]
pub trait LastRepository: Send + Sync {
    async fn upsert_last(&self, last: &Last) -> Result<(), StorageError>;
    async fn fetch_last(&self, username: &str) -> Result<Option<Last>, StorageError>;
    async fn delete_last(&self, username: &str) -> Result<(), StorageError>;
}

#[async_trait]
pub trait CapabilitiesRepository: Send + Sync {
    async fn upsert_capabilities(&self, caps: &Capabilities) -> Result<(), StorageError>;
    async fn capabilities_exist(&self, node: &str, ver: &str) -> Result<bool, StorageError>;
    async fn fetch_capabilities(
        &self,
        node: &str,
        ver: &str,
    ) -> Result<Option<Capabilities>, StorageError>;
}

#[async_trait]
pub trait OfflineRepository: Send + Sync {
    async fn insert_offline_message(
        &self,
        message: &Element,
        username: &str,
    ) -> Result<(), StorageError>;
    async fn count_offline_messages(&self, username: &str) -> Result<usize, StorageError>;
    /// Oldest first.
    async fn fetch_offline_messages(&self, username: &str) -> Result<Vec<Element>, StorageError>;
    async fn delete_offline_messages(&self, username: &str) -> Result<(), StorageError>;
}

#[async_trait]
pub trait BlockListRepository: Send + Sync {
    async fn upsert_block_list_item(&self, item: &BlockListItem) -> Result<(), StorageError>;
    async fn delete_block_list_item(&self, item: &BlockListItem) -> Result<(), StorageError>;
    async fn fetch_block_list_items(
        &self,
        username: &str,
    ) -> Result<Vec<BlockListItem>, StorageError>;
    async fn delete_block_list_items(&self, username: &str) -> Result<(), StorageError>;
}

#[async_trait]
pub trait PrivateRepository: Send + Sync {
    async fn upsert_private(
        &self,
        private: &Element,
        namespace: &str,
        username: &str,
    ) -> Result<(), StorageError>;
    async fn fetch_private(
        &self,
        namespace: &str,
        username: &str,
    ) -> Result<Option<Element>, StorageError>;
    async fn delete_private(&self, username: &str) -> Result<(), StorageError>;
}

#[async_trait]
pub trait RosterRepository: Send + Sync {
    /// Inserts or replaces an item, returning the new roster version.
    async fn upsert_roster_item(&self, item: &RosterItem) -> Result<i32, StorageError>;
    /// Deletes an item, returning the new roster version.
    async fn delete_roster_item(&self, username: &str, jid: &str) -> Result<i32, StorageError>;
    async fn fetch_roster_items(&self, username: &str) -> Result<Vec<RosterItem>, StorageError>;
    async fn fetch_roster_items_in_groups(
        &self,
        username: &str,
        groups: &[String],
    ) -> Result<Vec<RosterItem>, StorageError>;
    async fn fetch_roster_item(
        &self,
        username: &str,
        jid: &str,
    ) -> Result<Option<RosterItem>, StorageError>;
    async fn fetch_roster_groups(&self, username: &str) -> Result<Vec<String>, StorageError>;
    async fn fetch_roster_version(&self, username: &str) -> Result<i32, StorageError>;
    async fn upsert_roster_notification(
        &self,
        notification: &RosterNotification,
    ) -> Result<(), StorageError>;
    async fn delete_roster_notification(
        &self,
        contact: &str,
        jid: &str,
    ) -> Result<(), StorageError>;
    async fn fetch_roster_notification(
        &self,
        contact: &str,
        jid: &str,
    ) -> Result<Option<RosterNotification>, StorageError>;
    async fn fetch_roster_notifications(
        &self,
        contact: &str,
    ) -> Result<Vec<RosterNotification>, StorageError>;
    /// Removes every item and notification owned by `username`.
    async fn delete_roster(&self, username: &str) -> Result<(), StorageError>;
}

#[async_trait]
pub trait VCardRepository: Send + Sync {
    async fn upsert_vcard(&self, vcard: &Element, username: &str) -> Result<(), StorageError>;
    async fn fetch_vcard(&self, username: &str) -> Result<Option<Element>, StorageError>;
    async fn delete_vcard(&self, username: &str) -> Result<(), StorageError>;
}

#[async_trait]
pub trait ArchiveRepository: Send + Sync {
    async fn insert_archive_message(&self, message: &ArchiveMessage) -> Result<(), StorageError>;
    async fn fetch_archive_messages(
        &self,
        archive_id: &str,
    ) -> Result<Vec<ArchiveMessage>, StorageError>;
    async fn delete_archive(&self, archive_id: &str) -> Result<(), StorageError>;
}

#[async_trait]
pub trait PubSubRepository: Send + Sync {
    async fn upsert_node(&self, node: &PubSubNode) -> Result<(), StorageError>;
    async fn fetch_node(&self, host: &str, name: &str) -> Result<Option<PubSubNode>, StorageError>;
    async fn fetch_nodes(&self, host: &str) -> Result<Vec<PubSubNode>, StorageError>;
    /// Deletes a node together with its affiliations, subscriptions and items.
    async fn delete_node(&self, host: &str, name: &str) -> Result<(), StorageError>;
    async fn upsert_node_affiliation(
        &self,
        affiliation: &PubSubAffiliation,
        host: &str,
        name: &str,
    ) -> Result<(), StorageError>;
    async fn fetch_node_affiliations(
        &self,
        host: &str,
        name: &str,
    ) -> Result<Vec<PubSubAffiliation>, StorageError>;
    async fn delete_node_affiliation(
        &self,
        jid: &str,
        host: &str,
        name: &str,
    ) -> Result<(), StorageError>;
    async fn upsert_node_subscription(
        &self,
        subscription: &PubSubSubscription,
        host: &str,
        name: &str,
    ) -> Result<(), StorageError>;
    async fn fetch_node_subscriptions(
        &self,
        host: &str,
        name: &str,
    ) -> Result<Vec<PubSubSubscription>, StorageError>;
    async fn delete_node_subscription(
        &self,
        jid: &str,
        host: &str,
        name: &str,
    ) -> Result<(), StorageError>;
    /// Stores an item, evicting the oldest ones beyond `max_items`.
    async fn upsert_node_item(
        &self,
        item: &PubSubItem,
        host: &str,
        name: &str,
        max_items: usize,
    ) -> Result<(), StorageError>;
    async fn fetch_node_items(&self, host: &str, name: &str) -> Result<Vec<PubSubItem>, StorageError>;
}

/// Named advisory locks.
#[async_trait]
pub trait LockerRepository: Send + Sync {
    /// Waits until the lock is free and takes it.
    async fn lock(&self, name: &str) -> Result<(), StorageError>;
    async fn unlock(&self, name: &str) -> Result<(), StorageError>;
}

/// Unit of work executed by [`Repository::in_transaction`].
pub type TxFn = Box<
    dyn for<'r> FnOnce(&'r dyn Repository) -> BoxFuture<'r, Result<(), StorageError>> + Send,
>;

/// Boxes a transaction body.
pub fn transaction<F>(f: F) -> TxFn
where
    F: for<'r> FnOnce(&'r dyn Repository) -> BoxFuture<'r, Result<(), StorageError>>
        + Send
        + 'static,
{
    Box::new(f)
}

#[async_trait]
pub trait Repository:
    UserRepository
    + LastRepository
    + CapabilitiesRepository
    + OfflineRepository
    + BlockListRepository
    + PrivateRepository
    + RosterRepository
    + VCardRepository
    + ArchiveRepository
    + PubSubRepository
    + LockerRepository
    + Send
    + Sync
{
    /// Runs `f` against a transactional view of the repository.
    async fn in_transaction(&self, f: TxFn) -> Result<(), StorageError>;
    async fn start(&self) -> Result<(), StorageError>;
    async fn stop(&self) -> Result<(), StorageError>;
}

/// Shared repository handle.
pub type SharedRepository = Arc<dyn Repository>;
