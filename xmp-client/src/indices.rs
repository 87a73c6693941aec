//! Client-side view of indexed sub-resources of a port.
//!
//! Streams, filters, terms and similar resources live on the tester under a
//! sub-index of their port. Other sessions may create and delete them at any
//! time, so the cache kept here is only a view: [`IndexManager::server_sync`]
//! brings it back in line with the tester.
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use tokio::sync::broadcast;
use xmp_protocol::{
    Address, Command, Get, Set,
    commands::IndexList,
    message::Empty,
};

use crate::{
    command::CommandHandle,
    connection::Connection,
    error::{Error, Result},
};

const EVENT_CAPACITY: usize = 64;

/// One kind of indexed resource and the commands that manage its indices.
pub trait IndexKind: Send + Sync + 'static {
    /// Human readable name used in errors and logs.
    const NAME: &'static str;
    /// Lists the indices currently defined on the tester.
    type Indices: Get<Reply = IndexList>;
    type Create: Set<Request = Empty>;
    type Delete: Set<Request = Empty>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexChange {
    Added,
    Removed,
}

/// A change to the cached set of indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEvent {
    pub kind: &'static str,
    pub index: u32,
    pub change: IndexChange,
}

struct Cache<K: IndexKind> {
    resources: BTreeMap<u32, Arc<IndexedResource<K>>>,
    /// Indices with a CREATE in flight.
    creating: BTreeSet<u32>,
    /// Bumped by every local create or delete.
    generation: u64,
    /// Number of syncs waiting for their index list.
    syncing: usize,
    /// Generation of the latest local change per index, kept while a sync runs.
    touched: BTreeMap<u32, u64>,
}

impl<K: IndexKind> Cache<K> {
    fn touch(&mut self, index: u32) {
        self.generation += 1;
        if self.syncing > 0 {
            self.touched.insert(index, self.generation);
        }
    }
}

struct Inner<K: IndexKind> {
    connection: Arc<Connection>,
    parent: Address,
    cache: Mutex<Cache<K>>,
    events: broadcast::Sender<IndexEvent>,
}

impl<K: IndexKind> Inner<K> {
    fn lock(&self) -> MutexGuard<'_, Cache<K>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resource(self: &Arc<Self>, index: u32) -> Arc<IndexedResource<K>> {
        Arc::new(IndexedResource {
            index,
            address: self.parent.with_index(index),
            connection: Arc::clone(&self.connection),
            manager: Arc::downgrade(self),
        })
    }

    fn emit(&self, index: u32, change: IndexChange) {
        log::debug!("{} {} on {}: {:?}", K::NAME, index, self.parent, change);
        // No receivers is fine.
        let _ = self.events.send(IndexEvent {
            kind: K::NAME,
            index,
            change,
        });
    }

    async fn remove(&self, index: u32) -> Result<()> {
        delete_remote::<K>(&self.connection, &self.parent, index).await?;
        let removed = {
            let mut cache = self.lock();
            cache.touch(index);
            cache.resources.remove(&index).is_some()
        };
        if removed {
            self.emit(index, IndexChange::Removed);
        }
        Ok(())
    }
}

/// Releases a reserved index if the CREATE is abandoned or done.
struct Creating<'a, K: IndexKind> {
    inner: &'a Inner<K>,
    index: u32,
}

impl<K: IndexKind> Drop for Creating<'_, K> {
    fn drop(&mut self) {
        self.inner.lock().creating.remove(&self.index);
    }
}

/// Marks a sync in flight.
struct Syncing<'a, K: IndexKind> {
    inner: &'a Inner<K>,
}

impl<K: IndexKind> Drop for Syncing<'_, K> {
    fn drop(&mut self) {
        let mut cache = self.inner.lock();
        cache.syncing -= 1;
        if cache.syncing == 0 {
            cache.touched.clear();
        }
    }
}

async fn delete_remote<K: IndexKind>(
    connection: &Arc<Connection>,
    parent: &Address,
    index: u32,
) -> Result<()> {
    let handle = CommandHandle::<K::Delete>::new(Arc::clone(connection), parent.with_index(index));
    handle.set(Empty {}).await.map_err(|e| match e {
        Error::Status { status, .. } => Error::ResourceLifecycle {
            kind: K::NAME,
            index,
            address: parent.clone(),
            status,
        },
        other => other,
    })
}

/// Cache of the indexed resources of kind `K` below one port.
pub struct IndexManager<K: IndexKind> {
    inner: Arc<Inner<K>>,
}

impl<K: IndexKind> IndexManager<K> {
    pub fn new(connection: Arc<Connection>, parent: Address) -> IndexManager<K> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        IndexManager {
            inner: Arc::new(Inner {
                connection,
                parent,
                cache: Mutex::new(Cache {
                    resources: BTreeMap::new(),
                    creating: BTreeSet::new(),
                    generation: 0,
                    syncing: 0,
                    touched: BTreeMap::new(),
                }),
                events,
            }),
        }
    }

    /// Address of the port the resources belong to.
    pub fn parent(&self) -> &Address {
        &self.inner.parent
    }

    /// Creates a resource at the smallest index that is neither cached nor
    /// being created.
    ///
    /// The cache may be stale; if another session already uses the index the
    /// tester rejects the CREATE and this returns [`Error::ResourceCreation`].
    pub async fn create(&self) -> Result<Arc<IndexedResource<K>>> {
        let index = {
            let mut cache = self.inner.lock();
            let mut index = 0;
            while cache.resources.contains_key(&index) || cache.creating.contains(&index) {
                index += 1;
            }
            cache.creating.insert(index);
            index
        };
        let _creating = Creating {
            inner: &self.inner,
            index,
        };

        let handle = CommandHandle::<K::Create>::new(
            Arc::clone(&self.inner.connection),
            self.inner.parent.with_index(index),
        );
        handle.set(Empty {}).await.map_err(|e| match e {
            Error::Status { status, .. } => Error::ResourceCreation {
                kind: K::NAME,
                index,
                address: self.inner.parent.clone(),
                status,
            },
            other => other,
        })?;

        let resource = self.inner.resource(index);
        {
            let mut cache = self.inner.lock();
            cache.touch(index);
            cache.resources.insert(index, Arc::clone(&resource));
        }
        self.inner.emit(index, IndexChange::Added);
        Ok(resource)
    }

    /// The cached resource at `index`, or a fresh handle if it is not cached.
    ///
    /// Does not contact the tester and does not add the handle to the cache.
    pub fn obtain(&self, index: u32) -> Arc<IndexedResource<K>> {
        match self.inner.lock().resources.get(&index) {
            Some(resource) => Arc::clone(resource),
            None => self.inner.resource(index),
        }
    }

    pub fn obtain_multiple(&self, indices: &[u32]) -> Vec<Arc<IndexedResource<K>>> {
        indices.iter().map(|index| self.obtain(*index)).collect()
    }

    /// The cached resource at `index`.
    pub fn get(&self, index: u32) -> Option<Arc<IndexedResource<K>>> {
        self.inner.lock().resources.get(&index).cloned()
    }

    /// Cached indices in ascending order.
    pub fn indices(&self) -> Vec<u32> {
        self.inner.lock().resources.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deletes the resource at `index` on the tester and drops it from the cache.
    pub async fn remove(&self, index: u32) -> Result<()> {
        self.inner.remove(index).await
    }

    /// Reconciles the cache with the indices the tester reports.
    ///
    /// Indices only known remotely are added and cached indices the tester no
    /// longer has are dropped. Indices with a CREATE in flight, and indices
    /// created or deleted locally while the list was requested, are left alone:
    /// the list may predate those changes.
    pub async fn server_sync(&self) -> Result<()> {
        let handle = CommandHandle::<K::Indices>::new(
            Arc::clone(&self.inner.connection),
            self.inner.parent.clone(),
        );
        let since = {
            let mut cache = self.inner.lock();
            cache.syncing += 1;
            cache.generation
        };
        let _syncing = Syncing { inner: &self.inner };
        let remote: BTreeSet<u32> = handle.get().await?.indices().collect();

        let mut changes = Vec::new();
        {
            let mut cache = self.inner.lock();
            let recent: BTreeSet<u32> = cache
                .touched
                .iter()
                .filter(|(_, generation)| **generation > since)
                .map(|(index, _)| *index)
                .collect();
            let Cache {
                resources,
                creating,
                ..
            } = &mut *cache;
            resources.retain(|index, _| {
                let keep =
                    remote.contains(index) || creating.contains(index) || recent.contains(index);
                if !keep {
                    changes.push((*index, IndexChange::Removed));
                }
                keep
            });
            for index in &remote {
                if !resources.contains_key(index)
                    && !creating.contains(index)
                    && !recent.contains(index)
                {
                    resources.insert(*index, self.inner.resource(*index));
                    changes.push((*index, IndexChange::Added));
                }
            }
        }
        for (index, change) in changes {
            self.inner.emit(index, change);
        }
        Ok(())
    }

    /// Receives every change to the cache from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<IndexEvent> {
        self.inner.events.subscribe()
    }
}

impl<K: IndexKind> fmt::Debug for IndexManager<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexManager")
            .field("kind", &K::NAME)
            .field("parent", &self.inner.parent)
            .field("indices", &self.indices())
            .finish()
    }
}

/// One indexed resource on the tester.
pub struct IndexedResource<K: IndexKind> {
    index: u32,
    address: Address,
    connection: Arc<Connection>,
    manager: Weak<Inner<K>>,
}

impl<K: IndexKind> IndexedResource<K> {
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Port address extended by this resource's index.
    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn kind(&self) -> &'static str {
        K::NAME
    }

    /// A handle for any command addressed to this resource.
    pub fn command<C: Command>(&self) -> CommandHandle<C> {
        CommandHandle::new(Arc::clone(&self.connection), self.address.clone())
    }

    /// Deletes this resource on the tester and drops it from its manager.
    pub async fn delete(&self) -> Result<()> {
        match self.manager.upgrade() {
            Some(inner) => inner.remove(self.index).await,
            None => {
                let mut parent = self.address.clone();
                parent.indices.pop();
                delete_remote::<K>(&self.connection, &parent, self.index).await
            }
        }
    }
}

impl<K: IndexKind> fmt::Debug for IndexedResource<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} on {}", K::NAME, self.index, self.address)
    }
}
