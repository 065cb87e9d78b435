//! Framebuffer names are not shared between the contexts of a group, so a render target used
//! from several threads ends up with one native framebuffer per thread. This registry keeps
//! them apart and makes sure each one is deleted by the thread that created it.

use crate::core::gfx::GfxError;
use crate::core::gfx::state::RenderStateCache;
use log::debug;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};

/// Process-unique identity of a render target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetKey(u64);

impl TargetKey {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

#[derive(Default)]
struct ThreadFramebuffers {
    live: FxHashMap<TargetKey, u32>,
    // Handles another thread asked us to delete.
    pending: Vec<u32>,
}

impl ThreadFramebuffers {
    fn is_empty(&self) -> bool {
        self.live.is_empty() && self.pending.is_empty()
    }
}

/// All calls take the calling thread's render state; it must be the cache of the context
/// bound on this thread. Native deletions happen after the registry lock is released.
#[derive(Default)]
pub struct FramebufferRegistry {
    threads: Mutex<FxHashMap<ThreadId, ThreadFramebuffers>>,
}

impl FramebufferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, state: &mut RenderStateCache, key: TargetKey) -> Option<u32> {
        self.drain_pending(state);
        let threads = self.threads.lock();
        threads
            .get(&thread::current().id())
            .and_then(|fbs| fbs.live.get(&key).copied())
    }

    pub fn register(
        &self,
        state: &mut RenderStateCache,
        key: TargetKey,
        framebuffer: u32,
    ) -> Result<(), GfxError> {
        self.drain_pending(state);
        let mut threads = self.threads.lock();
        let fbs = threads.entry(thread::current().id()).or_default();
        match fbs.live.entry(key) {
            Entry::Occupied(_) => Err(GfxError::FramebufferAlreadyRegistered),
            Entry::Vacant(slot) => {
                slot.insert(framebuffer);
                debug!("Registered framebuffer {framebuffer} for target {}.", key.0);
                Ok(())
            }
        }
    }

    /// Forgets every thread's framebuffer for `key`. Handles owned by other threads are
    /// queued for their owners; the caller's own handle is deleted right away when it has a
    /// bound render state and queued otherwise.
    pub fn unregister(&self, state: Option<&mut RenderStateCache>, key: TargetKey) {
        let me = thread::current().id();
        let can_delete = state.is_some();
        let mut doomed = Vec::new();
        {
            let mut threads = self.threads.lock();
            for (&owner, fbs) in threads.iter_mut() {
                let Some(framebuffer) = fbs.live.remove(&key) else {
                    continue;
                };
                if owner == me && can_delete {
                    doomed.push(framebuffer);
                } else {
                    debug!(
                        "Deferring deletion of framebuffer {framebuffer} (target {}) to {owner:?}.",
                        key.0
                    );
                    fbs.pending.push(framebuffer);
                }
            }
            if can_delete && let Some(fbs) = threads.get_mut(&me) {
                doomed.append(&mut fbs.pending);
            }
            threads.retain(|_, fbs| !fbs.is_empty());
        }
        if let Some(state) = state {
            state.delete_framebuffers(&doomed);
        }
    }

    /// Deletes the calling thread's queued handles.
    pub fn drain_pending(&self, state: &mut RenderStateCache) {
        let me = thread::current().id();
        let pending = {
            let mut threads = self.threads.lock();
            let Some(fbs) = threads.get_mut(&me) else {
                return;
            };
            let pending = std::mem::take(&mut fbs.pending);
            if fbs.is_empty() {
                threads.remove(&me);
            }
            pending
        };
        if !pending.is_empty() {
            debug!("Deleting {} deferred framebuffer(s) on {me:?}.", pending.len());
            state.delete_framebuffers(&pending);
        }
    }

    /// Deletes everything the calling thread owns, live and pending.
    pub fn clear_thread(&self, state: &mut RenderStateCache) {
        let me = thread::current().id();
        let Some(fbs) = self.threads.lock().remove(&me) else {
            return;
        };
        let mut doomed = fbs.pending;
        doomed.extend(fbs.live.into_values());
        if !doomed.is_empty() {
            debug!("Deleting {} framebuffer(s) owned by {me:?}.", doomed.len());
            state.delete_framebuffers(&doomed);
        }
    }

    pub fn live_count(&self, thread: ThreadId) -> usize {
        self.threads.lock().get(&thread).map_or(0, |fbs| fbs.live.len())
    }

    pub fn pending_count(&self, thread: ThreadId) -> usize {
        self.threads
            .lock()
            .get(&thread)
            .map_or(0, |fbs| fbs.pending.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::gfx::backends::recording::{GlCall, RecordingDevice};
    use std::sync::{Arc, Barrier};

    fn cache(device: &Arc<RecordingDevice>) -> RenderStateCache {
        let mut state = RenderStateCache::new(device.clone());
        state.reset().expect("reset");
        state
    }

    #[test]
    fn register_then_find_returns_the_handle() {
        let device = Arc::new(RecordingDevice::new());
        let mut state = cache(&device);
        let registry = FramebufferRegistry::new();
        let key = TargetKey::next();

        assert_eq!(registry.find(&mut state, key), None);
        registry.register(&mut state, key, 42).expect("register");
        assert_eq!(registry.find(&mut state, key), Some(42));
        assert_eq!(registry.live_count(thread::current().id()), 1);
    }

    #[test]
    fn registering_twice_is_rejected() {
        let device = Arc::new(RecordingDevice::new());
        let mut state = cache(&device);
        let registry = FramebufferRegistry::new();
        let key = TargetKey::next();

        registry.register(&mut state, key, 1).expect("register");
        assert_eq!(
            registry.register(&mut state, key, 2),
            Err(GfxError::FramebufferAlreadyRegistered)
        );
        assert_eq!(registry.find(&mut state, key), Some(1));
    }

    #[test]
    fn unregister_on_owner_deletes_immediately() {
        let device = Arc::new(RecordingDevice::new());
        let mut state = cache(&device);
        let registry = FramebufferRegistry::new();
        let key = TargetKey::next();

        registry.register(&mut state, key, 9).expect("register");
        state.bind_framebuffer(9);
        device.clear_calls();
        registry.unregister(Some(&mut state), key);

        assert_eq!(device.calls(), vec![GlCall::DeleteFramebuffers(vec![9])]);
        assert_eq!(state.framebuffer(), 0);
        assert_eq!(registry.live_count(thread::current().id()), 0);
        assert_eq!(registry.find(&mut state, key), None);
    }

    #[test]
    fn unregister_without_bound_state_defers_own_handle() {
        let device = Arc::new(RecordingDevice::new());
        let mut state = cache(&device);
        let registry = FramebufferRegistry::new();
        let key = TargetKey::next();
        let me = thread::current().id();

        registry.register(&mut state, key, 5).expect("register");
        device.clear_calls();
        registry.unregister(None, key);
        assert!(device.calls().is_empty());
        assert_eq!(registry.pending_count(me), 1);

        registry.drain_pending(&mut state);
        assert_eq!(device.calls(), vec![GlCall::DeleteFramebuffers(vec![5])]);
        assert_eq!(registry.pending_count(me), 0);
    }

    #[test]
    fn cross_thread_unregister_defers_to_the_owner() {
        let device = Arc::new(RecordingDevice::new());
        let registry = FramebufferRegistry::new();
        let key = TargetKey::next();
        let registered = Barrier::new(2);
        let unregistered = Barrier::new(2);

        let worker_id = thread::scope(|s| {
            let worker = s.spawn(|| {
                let mut state = cache(&device);
                registry.register(&mut state, key, 100).expect("worker register");
                registered.wait();
                unregistered.wait();
                assert_eq!(registry.pending_count(thread::current().id()), 1);
                assert_eq!(registry.find(&mut state, key), None);
                assert_eq!(registry.pending_count(thread::current().id()), 0);
                thread::current().id()
            });

            let mut state = cache(&device);
            registry.register(&mut state, key, 200).expect("main register");
            registered.wait();
            registry.unregister(Some(&mut state), key);
            unregistered.wait();
            worker.join().expect("worker thread")
        });

        let me = thread::current().id();
        let deletions = device.deleted_framebuffers();
        assert!(deletions.contains(&(me, 200)));
        assert!(deletions.contains(&(worker_id, 100)));
        assert_eq!(deletions.len(), 2);
    }

    #[test]
    fn one_handle_per_thread_and_target() {
        let device = Arc::new(RecordingDevice::new());
        let registry = FramebufferRegistry::new();
        let key = TargetKey::next();

        thread::scope(|s| {
            for handle in [10, 20, 30] {
                let device = &device;
                let registry = &registry;
                s.spawn(move || {
                    let mut state = cache(device);
                    registry.register(&mut state, key, handle).expect("register");
                    assert_eq!(registry.find(&mut state, key), Some(handle));
                    registry.clear_thread(&mut state);
                });
            }
        });

        assert_eq!(device.deleted_framebuffers().len(), 3);
    }

    #[test]
    fn clear_thread_deletes_live_and_pending() {
        let device = Arc::new(RecordingDevice::new());
        let mut state = cache(&device);
        let registry = FramebufferRegistry::new();
        let (a, b) = (TargetKey::next(), TargetKey::next());

        registry.register(&mut state, a, 1).expect("register a");
        registry.register(&mut state, b, 2).expect("register b");
        registry.unregister(None, a);
        device.clear_calls();

        registry.clear_thread(&mut state);
        let mut deleted: Vec<u32> = device
            .deleted_framebuffers()
            .into_iter()
            .map(|(_, fb)| fb)
            .collect();
        deleted.sort_unstable();
        assert_eq!(deleted, vec![1, 2]);
        assert_eq!(registry.live_count(thread::current().id()), 0);
        assert_eq!(registry.pending_count(thread::current().id()), 0);
    }
}
