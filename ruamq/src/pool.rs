use std::{ops::Deref, sync::Arc};

use parking_lot::{Mutex, RwLock};

/// Number of handles allocated each time the pool runs dry.
pub const SLAB_SIZE: usize = 25;

type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;

/// A growable pool of reusable handles.
///
/// Handles are allocated in fixed-size slabs that are never freed. A released
/// handle only re-enters the free list if it belongs to one of this pool's
/// slabs. The free list is a short `parking_lot` critical section rather than
/// a lock-free stack; it is only held for a push or a pop.
pub struct ObjectPool<T> {
    factory: Factory<T>,
    slab_size: usize,
    free_list: Mutex<Vec<Arc<T>>>,
    slabs: RwLock<Vec<Box<[Arc<T>]>>>,
}

/// A handle checked out of an [`ObjectPool`], returned on drop.
pub struct Pooled<T> {
    pool: Arc<ObjectPool<T>>,
    item: Arc<T>,
}

impl<T> Pooled<T> {
    /// Returns a shared reference to the underlying handle.
    ///
    /// Clones must not outlive the checkout; the pool hands the same handle
    /// to the next caller once this guard is dropped.
    #[must_use]
    pub fn handle(&self) -> Arc<T> {
        self.item.clone()
    }
}

impl<T> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.item
    }
}

impl<T> Drop for Pooled<T> {
    fn drop(&mut self) {
        self.pool.release(self.item.clone());
    }
}

impl<T: Send + Sync + 'static> ObjectPool<T> {
    /// Creates an empty pool growing in slabs of [`SLAB_SIZE`] handles.
    pub fn new(factory: impl Fn() -> T + Send + Sync + 'static) -> Arc<Self> {
        Self::with_slab_size(SLAB_SIZE, factory)
    }

    /// Creates an empty pool growing in slabs of `slab_size` handles.
    pub fn with_slab_size(
        slab_size: usize,
        factory: impl Fn() -> T + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            factory: Box::new(factory),
            slab_size: slab_size.max(1),
            free_list: Mutex::default(),
            slabs: RwLock::default(),
        })
    }
}

impl<T> ObjectPool<T> {
    /// Checks out a free handle, growing the pool by one slab if none is free.
    pub fn acquire(self: &Arc<Self>) -> Pooled<T> {
        let item = self.free_list.lock().pop();
        Pooled {
            pool: self.clone(),
            item: item.unwrap_or_else(|| self.grow()),
        }
    }

    /// Total number of handles ever allocated.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slabs.read().iter().map(|slab| slab.len()).sum()
    }

    /// Number of handles currently on the free list.
    #[must_use]
    pub fn available(&self) -> usize {
        self.free_list.lock().len()
    }

    fn grow(&self) -> Arc<T> {
        let mut slabs = self.slabs.write();
        // another caller may have grown the pool while we waited for the lock.
        if let Some(item) = self.free_list.lock().pop() {
            return item;
        }

        let slab: Box<[Arc<T>]> = (0..self.slab_size)
            .map(|_| Arc::new((self.factory)()))
            .collect();
        let first = slab[0].clone();
        self.free_list.lock().extend(slab[1..].iter().cloned());
        slabs.push(slab);
        tracing::debug!("object pool grew to {} slabs", slabs.len());
        first
    }

    fn release(&self, item: Arc<T>) {
        let owned = self
            .slabs
            .read()
            .iter()
            .any(|slab| slab.iter().any(|known| Arc::ptr_eq(known, &item)));
        if owned {
            self.free_list.lock().push(item);
        } else {
            tracing::warn!("ignoring release of a handle this pool did not allocate");
        }
    }
}

impl<T> std::fmt::Debug for ObjectPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectPool")
            .field("slab_size", &self.slab_size)
            .field("capacity", &self.capacity())
            .field("available", &self.available())
            .finish()
    }
}
