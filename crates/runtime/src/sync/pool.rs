//! Pool: per-scheduler free lists of reusable objects
//!
//! Each scheduler gets its own list, so coroutines on different schedulers
//! never contend for the same one. `pop` and `push` must therefore run on a
//! scheduler thread; the list they touch is the caller's scheduler's.
//!
//! With a `create` callback, `pop` builds a fresh object when the list is
//! empty. With a `destroy` callback, `push` beyond the per-scheduler
//! capacity destroys the object instead of keeping it.

use super::lock;
use crate::config::config;
use crate::sched;
use coil_core::fatal;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

type Create<T> = Box<dyn Fn() -> T + Send + Sync>;
type Destroy<T> = Box<dyn Fn(T) + Send + Sync>;

struct Inner<T> {
    lists: Box<[Mutex<Vec<T>>]>,
    create: Option<Create<T>>,
    destroy: Option<Destroy<T>>,
    cap: usize,
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        if let Some(destroy) = &self.destroy {
            for list in self.lists.iter_mut() {
                let list = list.get_mut().unwrap_or_else(|e| e.into_inner());
                for item in list.drain(..) {
                    destroy(item);
                }
            }
        }
    }
}

/// Object pool shared by all schedulers, one free list each.
pub struct Pool<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> Default for Pool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Pool<T> {
    /// A pool without callbacks: `pop` returns `None` when the list is
    /// empty and `push` keeps everything.
    pub fn new() -> Self {
        Self::build(None, None, usize::MAX)
    }

    /// A pool that creates objects on demand and destroys those pushed once
    /// a scheduler's list holds `cap` objects.
    pub fn with<C, D>(create: C, destroy: D, cap: usize) -> Self
    where
        C: Fn() -> T + Send + Sync + 'static,
        D: Fn(T) + Send + Sync + 'static,
    {
        Self::build(Some(Box::new(create)), Some(Box::new(destroy)), cap)
    }

    fn build(create: Option<Create<T>>, destroy: Option<Destroy<T>>, cap: usize) -> Self {
        let lists = (0..config().sched_num)
            .map(|_| Mutex::new(Vec::new()))
            .collect();
        Self {
            inner: Arc::new(Inner {
                lists,
                create,
                destroy,
                cap,
            }),
        }
    }

    fn list(&self) -> &Mutex<Vec<T>> {
        match sched::current() {
            Some(s) => &self.inner.lists[s.id()],
            None => fatal!("Pool used outside a scheduler thread"),
        }
    }

    /// Take an object from this scheduler's list, creating one if the list
    /// is empty and the pool has a `create` callback.
    pub fn pop(&self) -> Option<T> {
        let item = lock(self.list()).pop();
        item.or_else(|| self.inner.create.as_ref().map(|create| create()))
    }

    /// Return an object to this scheduler's list.
    pub fn push(&self, item: T) {
        let mut list = lock(self.list());
        match &self.inner.destroy {
            Some(destroy) if list.len() >= self.inner.cap => {
                drop(list);
                destroy(item);
            }
            _ => list.push(item),
        }
    }

    /// Objects idle in this scheduler's list.
    pub fn size(&self) -> usize {
        lock(self.list()).len()
    }

    /// Drop (or destroy) every idle object on every scheduler.
    pub fn clear(&self) {
        for list in self.inner.lists.iter() {
            let items: Vec<T> = lock(list).drain(..).collect();
            if let Some(destroy) = &self.inner.destroy {
                items.into_iter().for_each(destroy);
            }
        }
    }
}

/// An object borrowed from a [`Pool`], returned to it on drop.
pub struct Pooled<T: Send + 'static> {
    pool: Pool<T>,
    item: Option<T>,
}

impl<T: Send + 'static> Pooled<T> {
    pub fn new(pool: &Pool<T>) -> Self {
        Self {
            pool: pool.clone(),
            item: pool.pop(),
        }
    }

    pub fn get(&self) -> Option<&T> {
        self.item.as_ref()
    }

    pub fn get_mut(&mut self) -> Option<&mut T> {
        self.item.as_mut()
    }

    /// Keep the object instead of returning it to the pool.
    pub fn take(mut self) -> Option<T> {
        self.item.take()
    }
}

impl<T: Send + 'static> Deref for Pooled<T> {
    type Target = Option<T>;

    fn deref(&self) -> &Option<T> {
        &self.item
    }
}

impl<T: Send + 'static> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut Option<T> {
        &mut self.item
    }
}

impl<T: Send + 'static> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.pool.push(item);
        }
    }
}
