//! Read-aside cache decorator over any repository.
//!
//! Reads go through [`Cached::fetch`] / [`Cached::exists`]: a cache hit is
//! decoded and returned, a miss is served by the wrapped repository and
//! stored. Writes go through [`Cached::update`], which always invalidates
//! before it mutates.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::trace;

use super::*;

/// Something that hands out the wrapped repository: either the shared
/// backend or the view of a running transaction.
pub trait RepoRef: Send + Sync {
    fn repo(&self) -> &dyn Repository;
    fn is_transaction(&self) -> bool;
}

impl RepoRef for Arc<dyn Repository> {
    fn repo(&self) -> &dyn Repository {
        self.as_ref()
    }

    fn is_transaction(&self) -> bool {
        false
    }
}

impl<'r> RepoRef for &'r dyn Repository {
    fn repo(&self) -> &dyn Repository {
        *self
    }

    fn is_transaction(&self) -> bool {
        true
    }
}

/// Cache decorator. See [`CachedRepository`] for the shared form.
pub struct Cached<R> {
    inner: R,
    cache: Arc<dyn Cache>,
}

pub type CachedRepository = Cached<Arc<dyn Repository>>;

impl CachedRepository {
    pub fn new(inner: Arc<dyn Repository>, cache: Arc<dyn Cache>) -> Self {
        Self { inner, cache }
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    Ok(bincode::serialize(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    Ok(bincode::deserialize(bytes)?)
}

fn user_ns(username: &str) -> String {
    format!("usr:{username}")
}

fn last_ns(username: &str) -> String {
    format!("lst:{username}")
}

fn caps_ns(node: &str, ver: &str) -> String {
    format!("caps:{node}:{ver}")
}

fn offline_ns(username: &str) -> String {
    format!("off:{username}")
}

fn block_list_ns(username: &str) -> String {
    format!("bl:{username}")
}

fn private_ns(username: &str) -> String {
    format!("prv:{username}")
}

fn roster_items_ns(username: &str) -> String {
    format!("ros:items:{username}")
}

fn roster_notifications_ns(contact: &str) -> String {
    format!("ros:notif:{contact}")
}

fn vcard_ns(username: &str) -> String {
    format!("vc:{username}")
}

fn pubsub_nodes_ns(host: &str) -> String {
    format!("pubsub:nodes:{host}")
}

fn pubsub_affiliations_ns(host: &str, name: &str) -> String {
    format!("pubsub:affiliations:{host}:{name}")
}

fn pubsub_subscriptions_ns(host: &str, name: &str) -> String {
    format!("pubsub:subscriptions:{host}:{name}")
}

fn pubsub_items_ns(host: &str, name: &str) -> String {
    format!("pubsub:items:{host}:{name}")
}

/// Cache key for a group query. Groups are sorted first so the same set
/// always maps to the same key.
pub(crate) fn groups_key(groups: &[String]) -> String {
    let mut sorted = groups.to_vec();
    sorted.sort();
    sorted.dedup();
    format!("groups:{}", sorted.join("|"))
}

enum Invalidate<'a> {
    Keys(&'a [&'a str]),
    Namespace,
}

impl<R: RepoRef> Cached<R> {
    fn repo(&self) -> &dyn Repository {
        self.inner.repo()
    }

    /// Optional value: absence is never cached.
    async fn fetch<T, F>(&self, ns: &str, key: &str, miss: F) -> Result<Option<T>, StorageError>
    where
        T: Serialize + DeserializeOwned,
        F: Future<Output = Result<Option<T>, StorageError>>,
    {
        if let Some(bytes) = self.cache.get(ns, key).await? {
            trace!(ns, key, "cache hit");
            return Ok(Some(decode(&bytes)?));
        }
        let value = miss.await?;
        if let Some(value) = &value {
            self.cache.put(ns, key, encode(value)?).await?;
        }
        Ok(value)
    }

    /// Always-present value such as a list or a counter.
    async fn fetch_value<T, F>(&self, ns: &str, key: &str, miss: F) -> Result<T, StorageError>
    where
        T: Serialize + DeserializeOwned,
        F: Future<Output = Result<T, StorageError>>,
    {
        if let Some(bytes) = self.cache.get(ns, key).await? {
            trace!(ns, key, "cache hit");
            return decode(&bytes);
        }
        let value = miss.await?;
        self.cache.put(ns, key, encode(&value)?).await?;
        Ok(value)
    }

    async fn exists<F>(&self, ns: &str, key: &str, miss: F) -> Result<bool, StorageError>
    where
        F: Future<Output = Result<bool, StorageError>>,
    {
        if self.cache.has_key(ns, key).await? {
            return Ok(true);
        }
        miss.await
    }

    async fn update<T, F>(&self, ns: &str, invalidate: Invalidate<'_>, write: F) -> Result<T, StorageError>
    where
        F: Future<Output = Result<T, StorageError>>,
    {
        match invalidate {
            Invalidate::Keys(keys) => self.cache.del(ns, keys).await?,
            Invalidate::Namespace => self.cache.del_ns(ns).await?,
        }
        write.await
    }
}

#[async_trait]
impl<R: RepoRef> UserRepository for Cached<R> {
    async fn upsert_user(&self, user: &User) -> Result<(), StorageError> {
        let ns = user_ns(&user.username);
        self.update(&ns, Invalidate::Keys(&["usr"]), self.repo().upsert_user(user))
            .await
    }

    async fn delete_user(&self, username: &str) -> Result<(), StorageError> {
        self.update(&user_ns(username), Invalidate::Namespace, self.repo().delete_user(username))
            .await
    }

    async fn fetch_user(&self, username: &str) -> Result<Option<User>, StorageError> {
        self.fetch(&user_ns(username), "usr", self.repo().fetch_user(username))
            .await
    }

    async fn user_exists(&self, username: &str) -> Result<bool, StorageError> {
        self.exists(&user_ns(username), "usr", self.repo().user_exists(username))
            .await
    }
}

#[async_trait]
impl<R: RepoRef> LastRepository for Cached<R> {
    async fn upsert_last(&self, last: &Last) -> Result<(), StorageError> {
        let ns = last_ns(&last.username);
        self.update(&ns, Invalidate::Keys(&["lst"]), self.repo().upsert_last(last))
            .await
    }

    async fn fetch_last(&self, username: &str) -> Result<Option<Last>, StorageError> {
        self.fetch(&last_ns(username), "lst", self.repo().fetch_last(username))
            .await
    }

    async fn delete_last(&self, username: &str) -> Result<(), StorageError> {
        self.update(&last_ns(username), Invalidate::Namespace, self.repo().delete_last(username))
            .await
    }
}

#[async_trait]
impl<R: RepoRef> CapabilitiesRepository for Cached<R> {
    async fn upsert_capabilities(&self, caps: &Capabilities) -> Result<(), StorageError> {
        let ns = caps_ns(&caps.node, &caps.ver);
        self.update(&ns, Invalidate::Keys(&["caps"]), self.repo().upsert_capabilities(caps))
            .await
    }

    async fn capabilities_exist(&self, node: &str, ver: &str) -> Result<bool, StorageError> {
        self.exists(
            &caps_ns(node, ver),
            "caps",
            self.repo().capabilities_exist(node, ver),
        )
        .await
    }

    async fn fetch_capabilities(
        &self,
        node: &str,
        ver: &str,
    ) -> Result<Option<Capabilities>, StorageError> {
        self.fetch(
            &caps_ns(node, ver),
            "caps",
            self.repo().fetch_capabilities(node, ver),
        )
        .await
    }
}

#[async_trait]
impl<R: RepoRef> OfflineRepository for Cached<R> {
    async fn insert_offline_message(
        &self,
        message: &Element,
        username: &str,
    ) -> Result<(), StorageError> {
        self.update(
            &offline_ns(username),
            Invalidate::Namespace,
            self.repo().insert_offline_message(message, username),
        )
        .await
    }

    async fn count_offline_messages(&self, username: &str) -> Result<usize, StorageError> {
        self.fetch_value(
            &offline_ns(username),
            "count",
            self.repo().count_offline_messages(username),
        )
        .await
    }

    async fn fetch_offline_messages(&self, username: &str) -> Result<Vec<Element>, StorageError> {
        self.fetch_value(
            &offline_ns(username),
            "msgs",
            self.repo().fetch_offline_messages(username),
        )
        .await
    }

    async fn delete_offline_messages(&self, username: &str) -> Result<(), StorageError> {
        self.update(
            &offline_ns(username),
            Invalidate::Namespace,
            self.repo().delete_offline_messages(username),
        )
        .await
    }
}

#[async_trait]
impl<R: RepoRef> BlockListRepository for Cached<R> {
    async fn upsert_block_list_item(&self, item: &BlockListItem) -> Result<(), StorageError> {
        self.update(
            &block_list_ns(&item.username),
            Invalidate::Namespace,
            self.repo().upsert_block_list_item(item),
        )
        .await
    }

    async fn delete_block_list_item(&self, item: &BlockListItem) -> Result<(), StorageError> {
        self.update(
            &block_list_ns(&item.username),
            Invalidate::Namespace,
            self.repo().delete_block_list_item(item),
        )
        .await
    }

    async fn fetch_block_list_items(
        &self,
        username: &str,
    ) -> Result<Vec<BlockListItem>, StorageError> {
        self.fetch_value(
            &block_list_ns(username),
            "items",
            self.repo().fetch_block_list_items(username),
        )
        .await
    }

    async fn delete_block_list_items(&self, username: &str) -> Result<(), StorageError> {
        self.update(
            &block_list_ns(username),
            Invalidate::Namespace,
            self.repo().delete_block_list_items(username),
        )
        .await
    }
}

#[async_trait]
impl<R: RepoRef> PrivateRepository for Cached<R> {
    async fn upsert_private(
        &self,
        private: &Element,
        namespace: &str,
        username: &str,
    ) -> Result<(), StorageError> {
        self.update(
            &private_ns(username),
            Invalidate::Keys(&[namespace]),
            self.repo().upsert_private(private, namespace, username),
        )
        .await
    }

    async fn fetch_private(
        &self,
        namespace: &str,
        username: &str,
    ) -> Result<Option<Element>, StorageError> {
        self.fetch(
            &private_ns(username),
            namespace,
            self.repo().fetch_private(namespace, username),
        )
        .await
    }

    async fn delete_private(&self, username: &str) -> Result<(), StorageError> {
        self.update(
            &private_ns(username),
            Invalidate::Namespace,
            self.repo().delete_private(username),
        )
        .await
    }
}

#[async_trait]
impl<R: RepoRef> RosterRepository for Cached<R> {
    async fn upsert_roster_item(&self, item: &RosterItem) -> Result<i32, StorageError> {
        self.update(
            &roster_items_ns(&item.username),
            Invalidate::Namespace,
            self.repo().upsert_roster_item(item),
        )
        .await
    }

    async fn delete_roster_item(&self, username: &str, jid: &str) -> Result<i32, StorageError> {
        self.update(
            &roster_items_ns(username),
            Invalidate::Namespace,
            self.repo().delete_roster_item(username, jid),
        )
        .await
    }

    async fn fetch_roster_items(&self, username: &str) -> Result<Vec<RosterItem>, StorageError> {
        self.fetch_value(
            &roster_items_ns(username),
            "items",
            self.repo().fetch_roster_items(username),
        )
        .await
    }

    async fn fetch_roster_items_in_groups(
        &self,
        username: &str,
        groups: &[String],
    ) -> Result<Vec<RosterItem>, StorageError> {
        self.fetch_value(
            &roster_items_ns(username),
            &groups_key(groups),
            self.repo().fetch_roster_items_in_groups(username, groups),
        )
        .await
    }

    async fn fetch_roster_item(
        &self,
        username: &str,
        jid: &str,
    ) -> Result<Option<RosterItem>, StorageError> {
        self.fetch(
            &roster_items_ns(username),
            &format!("item:{jid}"),
            self.repo().fetch_roster_item(username, jid),
        )
        .await
    }

    async fn fetch_roster_groups(&self, username: &str) -> Result<Vec<String>, StorageError> {
        self.fetch_value(
            &roster_items_ns(username),
            "grp",
            self.repo().fetch_roster_groups(username),
        )
        .await
    }

    async fn fetch_roster_version(&self, username: &str) -> Result<i32, StorageError> {
        self.fetch_value(
            &roster_items_ns(username),
            "ver",
            self.repo().fetch_roster_version(username),
        )
        .await
    }

    async fn upsert_roster_notification(
        &self,
        notification: &RosterNotification,
    ) -> Result<(), StorageError> {
        self.update(
            &roster_notifications_ns(&notification.contact),
            Invalidate::Namespace,
            self.repo().upsert_roster_notification(notification),
        )
        .await
    }

    async fn delete_roster_notification(
        &self,
        contact: &str,
        jid: &str,
    ) -> Result<(), StorageError> {
        self.update(
            &roster_notifications_ns(contact),
            Invalidate::Namespace,
            self.repo().delete_roster_notification(contact, jid),
        )
        .await
    }

    async fn fetch_roster_notification(
        &self,
        contact: &str,
        jid: &str,
    ) -> Result<Option<RosterNotification>, StorageError> {
        self.fetch(
            &roster_notifications_ns(contact),
            &format!("notif:{jid}"),
            self.repo().fetch_roster_notification(contact, jid),
        )
        .await
    }

    async fn fetch_roster_notifications(
        &self,
        contact: &str,
    ) -> Result<Vec<RosterNotification>, StorageError> {
        self.fetch_value(
            &roster_notifications_ns(contact),
            "notifs",
            self.repo().fetch_roster_notifications(contact),
        )
        .await
    }

    async fn delete_roster(&self, username: &str) -> Result<(), StorageError> {
        self.cache.del_ns(&roster_notifications_ns(username)).await?;
        self.update(
            &roster_items_ns(username),
            Invalidate::Namespace,
            self.repo().delete_roster(username),
        )
        .await
    }
}

#[async_trait]
impl<R: RepoRef> VCardRepository for Cached<R> {
    async fn upsert_vcard(&self, vcard: &Element, username: &str) -> Result<(), StorageError> {
        self.update(
            &vcard_ns(username),
            Invalidate::Keys(&["vc"]),
            self.repo().upsert_vcard(vcard, username),
        )
        .await
    }

    async fn fetch_vcard(&self, username: &str) -> Result<Option<Element>, StorageError> {
        self.fetch(&vcard_ns(username), "vc", self.repo().fetch_vcard(username))
            .await
    }

    async fn delete_vcard(&self, username: &str) -> Result<(), StorageError> {
        self.update(&vcard_ns(username), Invalidate::Namespace, self.repo().delete_vcard(username))
            .await
    }
}

#[async_trait]
impl<R: RepoRef> ArchiveRepository for Cached<R> {
    async fn insert_archive_message(&self, message: &ArchiveMessage) -> Result<(), StorageError> {
        self.repo().insert_archive_message(message).await
    }

    async fn fetch_archive_messages(
        &self,
        archive_id: &str,
    ) -> Result<Vec<ArchiveMessage>, StorageError> {
        self.repo().fetch_archive_messages(archive_id).await
    }

    async fn delete_archive(&self, archive_id: &str) -> Result<(), StorageError> {
        self.repo().delete_archive(archive_id).await
    }
}

#[async_trait]
impl<R: RepoRef> PubSubRepository for Cached<R> {
    async fn upsert_node(&self, node: &PubSubNode) -> Result<(), StorageError> {
        self.update(
            &pubsub_nodes_ns(&node.host),
            Invalidate::Namespace,
            self.repo().upsert_node(node),
        )
        .await
    }

    async fn fetch_node(&self, host: &str, name: &str) -> Result<Option<PubSubNode>, StorageError> {
        self.fetch(
            &pubsub_nodes_ns(host),
            &format!("node:{name}"),
            self.repo().fetch_node(host, name),
        )
        .await
    }

    async fn fetch_nodes(&self, host: &str) -> Result<Vec<PubSubNode>, StorageError> {
        self.fetch_value(&pubsub_nodes_ns(host), "nodes", self.repo().fetch_nodes(host))
            .await
    }

    async fn delete_node(&self, host: &str, name: &str) -> Result<(), StorageError> {
        self.cache.del_ns(&pubsub_affiliations_ns(host, name)).await?;
        self.cache.del_ns(&pubsub_subscriptions_ns(host, name)).await?;
        self.cache.del_ns(&pubsub_items_ns(host, name)).await?;
        self.update(
            &pubsub_nodes_ns(host),
            Invalidate::Namespace,
            self.repo().delete_node(host, name),
        )
        .await
    }

    async fn upsert_node_affiliation(
        &self,
        affiliation: &PubSubAffiliation,
        host: &str,
        name: &str,
    ) -> Result<(), StorageError> {
        self.update(
            &pubsub_affiliations_ns(host, name),
            Invalidate::Namespace,
            self.repo().upsert_node_affiliation(affiliation, host, name),
        )
        .await
    }

    async fn fetch_node_affiliations(
        &self,
        host: &str,
        name: &str,
    ) -> Result<Vec<PubSubAffiliation>, StorageError> {
        self.fetch_value(
            &pubsub_affiliations_ns(host, name),
            "affiliations",
            self.repo().fetch_node_affiliations(host, name),
        )
        .await
    }

    async fn delete_node_affiliation(
        &self,
        jid: &str,
        host: &str,
        name: &str,
    ) -> Result<(), StorageError> {
        self.update(
            &pubsub_affiliations_ns(host, name),
            Invalidate::Namespace,
            self.repo().delete_node_affiliation(jid, host, name),
        )
        .await
    }

    async fn upsert_node_subscription(
        &self,
        subscription: &PubSubSubscription,
        host: &str,
        name: &str,
    ) -> Result<(), StorageError> {
        self.update(
            &pubsub_subscriptions_ns(host, name),
            Invalidate::Namespace,
            self.repo().upsert_node_subscription(subscription, host, name),
        )
        .await
    }

    async fn fetch_node_subscriptions(
        &self,
        host: &str,
        name: &str,
    ) -> Result<Vec<PubSubSubscription>, StorageError> {
        self.fetch_value(
            &pubsub_subscriptions_ns(host, name),
            "subscriptions",
            self.repo().fetch_node_subscriptions(host, name),
        )
        .await
    }

    async fn delete_node_subscription(
        &self,
        jid: &str,
        host: &str,
        name: &str,
    ) -> Result<(), StorageError> {
        self.update(
            &pubsub_subscriptions_ns(host, name),
            Invalidate::Namespace,
            self.repo().delete_node_subscription(jid, host, name),
        )
        .await
    }

    async fn upsert_node_item(
        &self,
        item: &PubSubItem,
        host: &str,
        name: &str,
        max_items: usize,
    ) -> Result<(), StorageError> {
        self.update(
            &pubsub_items_ns(host, name),
            Invalidate::Namespace,
            self.repo().upsert_node_item(item, host, name, max_items),
        )
        .await
    }

    async fn fetch_node_items(&self, host: &str, name: &str) -> Result<Vec<PubSubItem>, StorageError> {
        self.fetch_value(
            &pubsub_items_ns(host, name),
            "items",
            self.repo().fetch_node_items(host, name),
        )
        .await
    }
}

#[async_trait]
impl<R: RepoRef> LockerRepository for Cached<R> {
    async fn lock(&self, name: &str) -> Result<(), StorageError> {
        self.repo().lock(name).await
    }

    async fn unlock(&self, name: &str) -> Result<(), StorageError> {
        self.repo().unlock(name).await
    }
}

#[async_trait]
impl<R: RepoRef> Repository for Cached<R> {
    async fn in_transaction(&self, f: TxFn) -> Result<(), StorageError> {
        if self.inner.is_transaction() {
            return f(self as &dyn Repository).await;
        }
        let cache = self.cache.clone();
        self.repo()
            .in_transaction(transaction(move |tx| {
                Box::pin(async move {
                    let view = Cached { inner: tx, cache };
                    f(&view as &dyn Repository).await
                })
            }))
            .await
    }

    async fn start(&self) -> Result<(), StorageError> {
        self.repo().start().await
    }

    async fn stop(&self) -> Result<(), StorageError> {
        self.repo().stop().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn setup() -> (Arc<MemoryRepository>, Arc<MemoryCache>, CachedRepository) {
        let repo = Arc::new(MemoryRepository::new());
        let cache = Arc::new(MemoryCache::new(Duration::ZERO));
        let cached = CachedRepository::new(repo.clone(), cache.clone());
        (repo, cache, cached)
    }

    fn roster_item(jid: &str, name: &str) -> RosterItem {
        RosterItem {
            username: "ortuman".to_string(),
            jid: jid.to_string(),
            name: name.to_string(),
            subscription: Subscription::None,
            ask: false,
            groups: vec![],
        }
    }

    #[tokio::test]
    async fn test_fetch_populates_cache() {
        let (repo, cache, cached) = setup();
        repo.upsert_user(&User::new("ortuman", "1234")).await.unwrap();

        assert!(!cache.has_key("usr:ortuman", "usr").await.unwrap());
        let user = cached.fetch_user("ortuman").await.unwrap().unwrap();
        assert_eq!(user.username, "ortuman");
        assert!(cache.has_key("usr:ortuman", "usr").await.unwrap());

        // Served from cache even if the backend changes underneath.
        repo.delete_user("ortuman").await.unwrap();
        assert!(cached.fetch_user("ortuman").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_absence_is_not_cached() {
        let (_, cache, cached) = setup();
        assert!(cached.fetch_vcard("noelia").await.unwrap().is_none());
        assert!(!cache.has_key("vc:noelia", "vc").await.unwrap());
    }

    #[tokio::test]
    async fn test_upsert_then_fetch_reflects_upsert() {
        let (_, _, cached) = setup();
        cached
            .upsert_roster_item(&roster_item("noelia@jackal.im", "Juliet"))
            .await
            .unwrap();
        assert_eq!(cached.fetch_roster_items("ortuman").await.unwrap().len(), 1);

        cached
            .upsert_roster_item(&roster_item("noelia@jackal.im", "My Juliet"))
            .await
            .unwrap();
        let items = cached.fetch_roster_items("ortuman").await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].name, "My Juliet");
        let item = cached
            .fetch_roster_item("ortuman", "noelia@jackal.im")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.name, "My Juliet");
    }

    #[tokio::test]
    async fn test_repeated_upsert_is_idempotent() {
        let (_, _, cached) = setup();
        let vcard = Element::with_ns("vCard", "vcard-temp").child(Element::new("FN").text("Ortuman"));
        cached.upsert_vcard(&vcard, "ortuman").await.unwrap();
        let first = cached.fetch_vcard("ortuman").await.unwrap();
        cached.upsert_vcard(&vcard, "ortuman").await.unwrap();
        let second = cached.fetch_vcard("ortuman").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(second, Some(vcard));
    }

    #[tokio::test]
    async fn test_exists_uses_cache_then_backend() {
        let (repo, cache, cached) = setup();
        assert!(!cached.user_exists("ortuman").await.unwrap());
        repo.upsert_user(&User::new("ortuman", "1234")).await.unwrap();
        assert!(cached.user_exists("ortuman").await.unwrap());
        assert!(!cache.has_key("usr:ortuman", "usr").await.unwrap());
    }

    #[tokio::test]
    async fn test_groups_key_is_canonical() {
        let a = groups_key(&["Work".to_string(), "Friends".to_string()]);
        let b = groups_key(&["Friends".to_string(), "Work".to_string()]);
        assert_eq!(a, b);
        assert_eq!(a, "groups:Friends|Work");
    }

    #[tokio::test]
    async fn test_transaction_goes_through_cache() {
        let (_, cache, cached) = setup();
        cached
            .upsert_block_list_item(&BlockListItem {
                username: "ortuman".to_string(),
                jid: "hamlet@jackal.im".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(cached.fetch_block_list_items("ortuman").await.unwrap().len(), 1);
        assert!(cache.has_key("bl:ortuman", "items").await.unwrap());

        cached
            .in_transaction(transaction(|tx| {
                Box::pin(async move { tx.delete_block_list_items("ortuman").await })
            }))
            .await
            .unwrap();

        assert!(!cache.has_key("bl:ortuman", "items").await.unwrap());
        assert!(cached.fetch_block_list_items("ortuman").await.unwrap().is_empty());
    }
}
