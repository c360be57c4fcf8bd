// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! A generic registry of reference-counted child actors, keyed by an
//! opaque object id.
//!
//! This is the composition-based stand-in for the "reference manager base
//! class" idea: rather than a base class that subclasses override, a
//! manager actor (e.g. the ipset manager, the profile rules manager, the
//! endpoint manager) embeds a [`ReferenceManager`] in its own state and
//! supplies the id-specific behavior (how to create a child, what to do
//! the first time it starts) as plain closures at the call site.
//!
//! # Lifecycle
//!
//! - [`ReferenceManager::get_and_incref`] creates the child on first
//!   reference and increments its count on every call after that.
//! - [`ReferenceManager::decref`] decrements the count; at zero the child
//!   moves from "live" to "stopping" and the caller is handed its
//!   [`ActorRef`] so it can ask the child to clean up.
//! - A child in "stopping" is still visible to [`ReferenceManager::is_starting_or_live`]... actually it is not — see the method
//!   doc. It remains visible to [`ReferenceManager::stopping_refs`], which
//!   garbage-collection sweeps (e.g. the ipset manager's `cleanup`) use to
//!   avoid reclaiming a resource a half-stopped child still owns.
//! - [`notify_on_unreferenced`] is the glue that turns "child finished
//!   cleanup" into a message the owning manager can act on, without the
//!   manager blocking its own mailbox waiting for it.

use std::hash::Hash;

use felix_actor::ActorRef;
use hashbrown::HashMap;
use tokio::sync::oneshot;

struct LiveChild<M> {
    actor_ref: ActorRef<M>,
    refcount: usize,
}

/// Registry of reference-counted children of type `M` (the child's
/// message type), keyed by `K`.
pub struct ReferenceManager<K, M> {
    live: HashMap<K, LiveChild<M>>,
    /// Children that have been told to clean up but have not yet
    /// acknowledged it. A restart of the same id while its predecessor is
    /// still stopping creates a second, independent entry here (and a new
    /// live entry) rather than waiting — see `spec.md` §4.2.
    stopping: Vec<(K, ActorRef<M>)>,
}

impl<K, M> Default for ReferenceManager<K, M> {
    fn default() -> Self {
        ReferenceManager {
            live: HashMap::new(),
            stopping: Vec::new(),
        }
    }
}

impl<K: Eq + Hash + Clone, M> ReferenceManager<K, M> {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` iff `id` currently has a live child (started, at least one
    /// ref held). Children in the "stopping" set do not count: callers
    /// must treat a stopping id as absent and, if re-referenced, will get
    /// a brand new child via `get_and_incref`.
    #[must_use]
    pub fn is_starting_or_live(&self, id: &K) -> bool {
        self.live.contains_key(id)
    }

    /// The live child for `id`, if any, without affecting its refcount.
    #[must_use]
    pub fn get(&self, id: &K) -> Option<&ActorRef<M>> {
        self.live.get(id).map(|c| &c.actor_ref)
    }

    /// Fetch the live child for `id`, creating it via `create` if this is
    /// the first reference, and increment its refcount.
    ///
    /// Returns the child's actor ref and whether this call just created
    /// it (so the caller can push initial state exactly once, matching
    /// `_on_object_started`).
    pub fn get_and_incref(
        &mut self,
        id: K,
        create: impl FnOnce(&K) -> ActorRef<M>,
    ) -> (ActorRef<M>, bool) {
        let just_created = !self.live.contains_key(&id);
        let entry = self
            .live
            .entry(id.clone())
            .or_insert_with(|| LiveChild {
                actor_ref: create(&id),
                refcount: 0,
            });
        entry.refcount += 1;
        (entry.actor_ref.clone(), just_created)
    }

    /// Decrement `id`'s refcount. Refcounts never go below zero: decref on
    /// an id with no live child, or an already-zero count, is a no-op.
    ///
    /// When the count reaches zero the child is moved to "stopping" and
    /// its actor ref is returned so the caller can post an
    /// unreferenced-style message to it.
    pub fn decref(&mut self, id: &K) -> Option<ActorRef<M>> {
        let hit_zero = match self.live.get_mut(id) {
            Some(child) if child.refcount > 0 => {
                child.refcount -= 1;
                child.refcount == 0
            }
            _ => return None,
        };
        if hit_zero {
            let child = self.live.remove(id)?;
            self.stopping.push((id.clone(), child.actor_ref.clone()));
            Some(child.actor_ref)
        } else {
            None
        }
    }

    /// Remove the stopping entry for `id` once its `cleanup_complete` has
    /// been observed. Safe to call even if no such entry exists (e.g. it
    /// already got removed by caller error); does nothing in that case.
    pub fn forget_stopped(&mut self, id: &K) {
        if let Some(pos) = self.stopping.iter().position(|(k, _)| k == id) {
            self.stopping.remove(pos);
        }
    }

    /// Actor refs for every live child plus every still-stopping child.
    /// Garbage-collection sweeps (cleanup of kernel objects left over at
    /// start-of-day) must whitelist everything this yields: a stopping
    /// child may still own the very kernel object being swept.
    pub fn live_and_stopping_refs(&self) -> impl Iterator<Item = &ActorRef<M>> {
        self.live
            .values()
            .map(|c| &c.actor_ref)
            .chain(self.stopping.iter().map(|(_, r)| r))
    }

    /// Ids of every live child.
    pub fn live_ids(&self) -> impl Iterator<Item = &K> {
        self.live.keys()
    }

    /// Ids of every live child plus every still-stopping child. Paired
    /// with [`ReferenceManager::live_and_stopping_refs`] for sweeps that
    /// need to know *which* id a surviving kernel object belongs to, not
    /// just that some child still owns it.
    pub fn live_and_stopping_ids(&self) -> impl Iterator<Item = &K> {
        self.live
            .keys()
            .chain(self.stopping.iter().map(|(k, _)| k))
    }
}

/// Send `message` (built from a fresh completion channel) to `actor_ref`,
/// then invoke `on_cleanup_complete` once the channel fires — without
/// blocking the caller.
///
/// This is the bridge between [`ReferenceManager::decref`] (which only
/// updates bookkeeping) and a manager actor's own mailbox: the manager
/// constructs an "unreferenced" message carrying a [`oneshot::Sender`],
/// posts it via this helper, and is notified (typically by posting a
/// message to itself) once the child acknowledges.
pub fn notify_on_unreferenced<M: Send + 'static>(
    actor_ref: &ActorRef<M>,
    make_message: impl FnOnce(oneshot::Sender<()>) -> M,
    on_cleanup_complete: impl FnOnce() + Send + 'static,
) {
    let (done_tx, done_rx) = oneshot::channel();
    actor_ref.post(make_message(done_tx));
    tokio::spawn(async move {
        let _ = done_rx.await;
        on_cleanup_complete();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use felix_actor::Actor;

    struct Echo;
    enum Msg {
        Ping,
    }
    impl Actor for Echo {
        type Message = Msg;
        type Error = std::convert::Infallible;
        fn handle(&mut self, _message: Self::Message) {}
    }

    fn spawn_echo() -> ActorRef<Msg> {
        felix_actor::spawn(Echo)
    }

    #[tokio::test]
    async fn incref_then_decref_to_zero_moves_to_stopping() {
        let mut mgr: ReferenceManager<String, Msg> = ReferenceManager::new();
        let id = "tag-a".to_string();
        let (_r1, created1) = mgr.get_and_incref(id.clone(), |_| spawn_echo());
        assert!(created1);
        let (_r2, created2) = mgr.get_and_incref(id.clone(), |_| spawn_echo());
        assert!(!created2, "second incref must not recreate the child");
        assert!(mgr.is_starting_or_live(&id));

        assert!(mgr.decref(&id).is_none(), "refcount 2 -> 1, still live");
        assert!(mgr.is_starting_or_live(&id));

        let stopped = mgr.decref(&id);
        assert!(stopped.is_some(), "refcount 1 -> 0, moves to stopping");
        assert!(!mgr.is_starting_or_live(&id));

        mgr.forget_stopped(&id);
        assert_eq!(mgr.live_and_stopping_refs().count(), 0);
    }

    #[test]
    fn decref_never_goes_negative() {
        let mut mgr: ReferenceManager<String, Msg> = ReferenceManager::new();
        assert!(mgr.decref(&"nope".to_string()).is_none());
    }

    #[tokio::test]
    async fn restart_while_stopping_creates_independent_child() {
        let mut mgr: ReferenceManager<String, Msg> = ReferenceManager::new();
        let id = "tag-a".to_string();
        mgr.get_and_incref(id.clone(), |_| spawn_echo());
        mgr.decref(&id); // now stopping
        let (_r, created) = mgr.get_and_incref(id.clone(), |_| spawn_echo());
        assert!(created, "restarting a stopping id must create a new child");
        // Both the new live child and the old stopping one are tracked.
        assert_eq!(mgr.live_and_stopping_refs().count(), 2);
    }
}
