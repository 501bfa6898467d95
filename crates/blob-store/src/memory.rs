//! In-process blob store.
//!
//! Behaves like the remote backend (monotonic ids per container, size
//! ceiling, captions) and can be told to fail on demand, which is how the
//! engine's partial-failure paths are exercised.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tvault_protocol::BlobHandle;

use crate::{BlobEntry, BlobFuture, BlobStore, BlobStoreError, DEFAULT_MAX_BLOB_SIZE, check_size};

/// Failure injected into a [`MemoryStore`] operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    RateLimited,
    Backend(String),
}

impl Fault {
    fn to_error(&self) -> BlobStoreError {
        match self {
            Fault::RateLimited => BlobStoreError::RateLimited { retry_after: None },
            Fault::Backend(msg) => BlobStoreError::Backend(msg.clone()),
        }
    }
}

#[derive(Default)]
struct Container {
    next_id: u64,
    blobs: BTreeMap<u64, (Vec<u8>, String)>,
}

#[derive(Default)]
struct Inner {
    containers: HashMap<String, Container>,
    /// Puts that still succeed before `put_fault` kicks in.
    puts_before_fault: usize,
    put_fault: Option<Fault>,
    get_fault: Option<Fault>,
    put_log: Vec<(String, String)>,
}

/// Thread-safe in-memory [`BlobStore`].
pub struct MemoryStore {
    inner: Mutex<Inner>,
    max_blob_size: u64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_max_blob_size(DEFAULT_MAX_BLOB_SIZE)
    }

    /// Creates a store with a custom blob ceiling.
    pub fn with_max_blob_size(max_blob_size: u64) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            max_blob_size,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lets `successes` more puts through, then fails every put with `fault`.
    pub fn fail_puts_after(&self, successes: usize, fault: Fault) {
        let mut inner = self.lock();
        inner.puts_before_fault = successes;
        inner.put_fault = Some(fault);
    }

    /// Fails every get with `fault`.
    pub fn fail_gets(&self, fault: Fault) {
        self.lock().get_fault = Some(fault);
    }

    /// Removes all injected failures.
    pub fn clear_faults(&self) {
        let mut inner = self.lock();
        inner.put_fault = None;
        inner.get_fault = None;
        inner.puts_before_fault = 0;
    }

    /// `(container, caption)` of every successful put, in order.
    pub fn put_log(&self) -> Vec<(String, String)> {
        self.lock().put_log.clone()
    }

    /// Number of blobs currently stored in `container`.
    pub fn blob_count(&self, container: &str) -> usize {
        self.lock()
            .containers
            .get(container)
            .map(|c| c.blobs.len())
            .unwrap_or(0)
    }

    /// Stores a blob without going through fault injection or the log.
    /// Used to seed foreign content.
    pub fn insert_raw(&self, container: &str, data: Vec<u8>, caption: &str) -> BlobHandle {
        let mut inner = self.lock();
        store_blob(&mut inner, container, data, caption)
    }
}

fn store_blob(inner: &mut Inner, container: &str, data: Vec<u8>, caption: &str) -> BlobHandle {
    let c = inner.containers.entry(container.to_string()).or_default();
    c.next_id += 1;
    let id = c.next_id;
    c.blobs.insert(id, (data, caption.to_string()));
    BlobHandle::new(container, id)
}

impl BlobStore for MemoryStore {
    fn put<'a>(
        &'a self,
        container: &'a str,
        data: Vec<u8>,
        caption: &'a str,
    ) -> BlobFuture<'a, BlobHandle> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            check_size(data.len(), self.max_blob_size)?;

            let mut inner = self.lock();
            if let Some(fault) = inner.put_fault.clone() {
                if inner.puts_before_fault == 0 {
                    return Err(fault.to_error());
                }
                inner.puts_before_fault -= 1;
            }

            let handle = store_blob(&mut inner, container, data, caption);
            inner
                .put_log
                .push((container.to_string(), caption.to_string()));
            Ok(handle)
        })
    }

    fn get<'a>(&'a self, handle: &'a BlobHandle) -> BlobFuture<'a, Vec<u8>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            let inner = self.lock();
            if let Some(fault) = &inner.get_fault {
                return Err(fault.to_error());
            }
            inner
                .containers
                .get(&handle.container)
                .and_then(|c| c.blobs.get(&handle.id))
                .map(|(data, _)| data.clone())
                .ok_or_else(|| BlobStoreError::NotFound(handle.clone()))
        })
    }

    fn list<'a>(&'a self, container: &'a str) -> BlobFuture<'a, Vec<BlobEntry>> {
        Box::pin(async move {
            let inner = self.lock();
            let entries = inner
                .containers
                .get(container)
                .map(|c| {
                    c.blobs
                        .iter()
                        .map(|(id, (data, caption))| BlobEntry {
                            handle: BlobHandle::new(container, *id),
                            caption: caption.clone(),
                            size: data.len() as u64,
                        })
                        .collect()
                })
                .unwrap_or_default();
            Ok(entries)
        })
    }

    fn delete<'a>(&'a self, handle: &'a BlobHandle) -> BlobFuture<'a, ()> {
        Box::pin(async move {
            let mut inner = self.lock();
            let removed = inner
                .containers
                .get_mut(&handle.container)
                .and_then(|c| c.blobs.remove(&handle.id));
            match removed {
                Some(_) => Ok(()),
                None => Err(BlobStoreError::NotFound(handle.clone())),
            }
        })
    }

    fn containers(&self) -> BlobFuture<'_, Vec<String>> {
        Box::pin(async move {
            let inner = self.lock();
            let mut names: Vec<String> = inner
                .containers
                .iter()
                .filter(|(_, c)| !c.blobs.is_empty())
                .map(|(name, _)| name.clone())
                .collect();
            names.sort();
            Ok(names)
        })
    }

    fn max_blob_size(&self) -> u64 {
        self.max_blob_size
    }
}
