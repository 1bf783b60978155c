//! Lock-free singly linked list with tail-end push and pop.
//!
//! The representation is a singly-linked chain starting at a permanent
//! sentinel node, plus a tail pointer that names what the list currently
//! believes is the last node. `push` is the Michael-Scott enqueue (PODC
//! 1996): link at the observed tail's `next`, then swing the tail, helping
//! a lagging tail forward when one is observed. Because the nodes carry no
//! backward links, `pop` scans the whole chain from the sentinel to locate
//! the last node and its predecessor; that linear scan is the intentional
//! cost of keeping the list singly linked while operating on the tail.
//!
//! A `pop` reserves the last node by CAS-ing its `next` field from null to
//! tagged null. The tag is the removal mark: every append targets an
//! untagged null `next`, so a reserved node can no longer grow a successor,
//! and the reservation CAS is the linearization point of the removal. The
//! tail pointer is then swung to the predecessor and the node is unlinked
//! and handed to the epoch collector. Threads that observe the tail naming
//! a reserved node repair it from a head-chain rescan, so the tail never
//! stays on a node that is about to be reclaimed.

use core::fmt;
use core::mem;
use core::sync::atomic::Ordering;

use crossbeam_epoch::{unprotected, Atomic, Guard, Owned, Shared};
use crossbeam_utils::CachePadded;

/// Tag bit on a node's `next` marking the node as reserved for removal.
const MARK: usize = 1;

#[derive(Debug)]
struct Node<T> {
    /// `None` only for the sentinel; every node created by `push` or
    /// `insert_after` holds a value. The value is never mutated after
    /// construction, so concurrent scans may read it without atomics; it is
    /// dropped together with the node, at a safe epoch, so that an in-flight
    /// scan never observes a freed value.
    data: Option<T>,

    /// Mark: tag(). A tagged null means this node has been reserved by a
    /// `pop` and will never have a successor again.
    next: Atomic<Node<T>>,
}

impl<T> Node<T> {
    fn new(data: T) -> Self {
        Self {
            data: Some(data),
            next: Atomic::null(),
        }
    }

    fn sentinel() -> Self {
        Self {
            data: None,
            next: Atomic::null(),
        }
    }
}

/// Lock-free singly linked list with `push` and `pop` at the tail end and
/// insertion after the first node holding a given value.
///
/// All operations take a pinned epoch [`Guard`]. The elements themselves are
/// only handed out by value: `pop` returns a clone of the removed element,
/// and the stored element is dropped with its node once no thread can still
/// be scanning it.
#[derive(Debug)]
pub struct TailList<T> {
    /// Names the sentinel node; written once at construction.
    head: CachePadded<Atomic<Node<T>>>,
    /// Names the believed last node; may transiently lag the true last node
    /// by an in-flight append, or name a node reserved by an in-flight pop.
    tail: CachePadded<Atomic<Node<T>>>,
}

// Values are read concurrently by the scans in `insert_after` and `iter`,
// so `T` must be `Sync` as well.
unsafe impl<T: Send + Sync> Sync for TailList<T> {}
unsafe impl<T: Send> Send for TailList<T> {}

impl<T> Default for TailList<T> {
    fn default() -> Self {
        let list = Self {
            head: CachePadded::new(Atomic::null()),
            tail: CachePadded::new(Atomic::null()),
        };
        let sentinel = Owned::new(Node::sentinel());
        // SAFETY: we are creating a new list, hence have sole ownership of it.
        let sentinel = sentinel.into_shared(unsafe { unprotected() });
        list.head.store(sentinel, Ordering::Relaxed);
        list.tail.store(sentinel, Ordering::Relaxed);
        list
    }
}

impl<T> TailList<T> {
    /// Creates a new, empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the list holds no elements.
    pub fn is_empty(&self, guard: &Guard) -> bool {
        let head = self.head.load(Ordering::Acquire, guard);
        // SAFETY: the sentinel is allocated at construction and never freed
        // before the list itself is dropped.
        unsafe { head.deref() }
            .next
            .load(Ordering::Acquire, guard)
            .is_null()
    }

    /// Appends `value` as the new last node.
    ///
    /// Never fails: CAS losses are retried internally until the node is
    /// durably linked. The linearization point is the successful CAS of the
    /// observed tail's `next` from null to the new node.
    pub fn push(&self, value: T, guard: &Guard) {
        let node = Owned::new(Node::new(value)).into_shared(guard);

        loop {
            let tail = self.tail.load(Ordering::Acquire, guard);
            // SAFETY: the tail never names a freed node; see `repair_tail`.
            let tail_ref = unsafe { tail.deref() };
            let next = tail_ref.next.load(Ordering::Acquire, guard);

            if next.tag() == MARK {
                // The tail names a node reserved by a concurrent pop.
                self.repair_tail(guard);
                continue;
            }

            if !next.is_null() {
                // The tail lags behind an in-flight append; help it forward.
                self.advance_tail(tail, next, guard);
                continue;
            }

            // The observed tail looks like the true last node; attempt to
            // link at its `next`.
            if tail_ref
                .next
                .compare_exchange(
                    Shared::null(),
                    node,
                    Ordering::Release,
                    Ordering::Relaxed,
                    guard,
                )
                .is_ok()
            {
                self.advance_tail(tail, node, guard);
                return;
            }
        }
    }

    /// Removes the current last node and returns its value.
    ///
    /// Returns `None` when the list holds no elements; empty is a normal
    /// outcome, not a failure. Every call scans forward from the sentinel to
    /// locate the last node and its predecessor, so the cost is linear in
    /// the current length.
    pub fn pop(&self, guard: &Guard) -> Option<T>
    where
        T: Clone,
    {
        let head = self.head.load(Ordering::Acquire, guard);
        // SAFETY: the sentinel outlives every operation.
        let head_ref = unsafe { head.deref() };

        loop {
            let first = head_ref.next.load(Ordering::Acquire, guard);
            if first.is_null() {
                return None;
            }

            let tail = self.tail.load(Ordering::Acquire, guard);
            // SAFETY: the tail never names a freed node; see `repair_tail`.
            let tail_next = unsafe { tail.deref() }.next.load(Ordering::Acquire, guard);
            if tail_next.tag() == MARK {
                self.repair_tail(guard);
                continue;
            }
            if !tail_next.is_null() {
                // Lagging tail; help it forward before scanning.
                self.advance_tail(tail, tail_next, guard);
                continue;
            }

            // Walk a trailing/leading cursor pair from the sentinel until
            // the leading cursor reaches the observed tail.
            let mut left = head;
            let mut right = first;
            let raced = loop {
                if right == tail {
                    break false;
                }
                // SAFETY: `right` was reachable under this guard.
                let next = unsafe { right.deref() }.next.load(Ordering::Acquire, guard);
                if next.with_tag(0).is_null() {
                    // The chain changed under the scan and no longer reaches
                    // the observed tail; start over.
                    break true;
                }
                left = right;
                right = next;
            };
            if raced {
                continue;
            }

            // SAFETY: `right` was reachable under this guard.
            let right_ref = unsafe { right.deref() };

            // Reserve the last node: marking its `next` makes every append
            // targeting it fail, and is the linearization point of the pop.
            if right_ref
                .next
                .compare_exchange(
                    Shared::null(),
                    Shared::null().with_tag(MARK),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                    guard,
                )
                .is_err()
            {
                continue;
            }

            // Point the tail at the predecessor, then detach the reserved
            // node from the chain.
            self.advance_tail(right, left, guard);
            self.unlink(right, guard);
            // A helper acting on a stale snapshot may have parked the tail
            // back on the dead node; it must be off before reclamation.
            self.repair_tail(guard);

            let value = right_ref.data.clone();
            // A helper acting on a stale snapshot can still re-publish the
            // retired node into the tail before its install check repairs
            // it, and a thread pinning one epoch after this defer can load
            // that transient tail without blocking the node's garbage bag.
            // Destruction therefore takes two epochs: such a reader is
            // pinned no later than one epoch after the first hop is queued,
            // so it blocks the second.
            let retired = right.as_raw() as *mut Node<T>;
            // SAFETY: `right` is unlinked and marked, so no thread can
            // reach it through the chain anymore; any thread that can still
            // observe it through the tail is pinned before the first hop
            // runs and is outlived by the second.
            unsafe {
                guard.defer_unchecked(move || {
                    let guard = crossbeam_epoch::pin();
                    // SAFETY: by the time this second hop runs, every
                    // thread that could have observed the transient tail
                    // has unpinned, and the tail has been repaired off the
                    // node, so we hold the last reference to it.
                    unsafe {
                        guard.defer_unchecked(move || drop(Owned::from_raw(retired)));
                    }
                });
            }
            return value;
        }
    }

    /// Links a new node holding `value` immediately after the first node
    /// whose element equals `after`.
    ///
    /// Returns `false` without mutation when the list is empty or no node
    /// currently holds `after`; that is a normal outcome, not an error. When
    /// `after` matches the current last node this degenerates into the same
    /// append protocol as [`push`](Self::push), targeting that node.
    ///
    /// With duplicate values the first occurrence is matched, and a
    /// concurrent mutation of an earlier occurrence may change which node
    /// that is between retries; no stronger stability is guaranteed.
    pub fn insert_after(&self, value: T, after: &T, guard: &Guard) -> bool
    where
        T: PartialEq,
    {
        let mut node = Owned::new(Node::new(value));
        let head = self.head.load(Ordering::Acquire, guard);

        loop {
            // Scan forward for the first occurrence of `after`.
            // SAFETY: the sentinel outlives every operation.
            let mut curr = unsafe { head.deref() }.next.load(Ordering::Acquire, guard);
            let target = loop {
                if curr.with_tag(0).is_null() {
                    // Empty list, or `after` is not present.
                    return false;
                }
                // SAFETY: `curr` was reachable under this guard.
                let curr_ref = unsafe { curr.deref() };
                if curr_ref.data.as_ref() == Some(after) {
                    break curr;
                }
                curr = curr_ref.next.load(Ordering::Acquire, guard);
            };

            // SAFETY: `target` was reachable under this guard.
            let target_ref = unsafe { target.deref() };
            let succ = target_ref.next.load(Ordering::Acquire, guard);

            if succ.tag() == MARK {
                // The match is being removed by a concurrent pop; re-scan.
                // It may legitimately be gone on the next attempt.
                continue;
            }

            if succ.is_null() {
                // The match is the current last node: compare-and-append,
                // aimed at this specific node rather than the tail pointer.
                node.next = Atomic::null();
                match target_ref.next.compare_exchange(
                    Shared::null(),
                    node,
                    Ordering::Release,
                    Ordering::Relaxed,
                    guard,
                ) {
                    Ok(new) => {
                        self.advance_tail(target, new, guard);
                        return true;
                    }
                    Err(e) => {
                        node = e.new;
                        continue;
                    }
                }
            }

            // General case: fix the new node's own `next` to the observed
            // successor while it is still unreachable, then publish it with
            // a single CAS on the matched node's `next`.
            node.next = succ.into();
            match target_ref.next.compare_exchange(
                succ,
                node,
                Ordering::Release,
                Ordering::Relaxed,
                guard,
            ) {
                Ok(_) => return true,
                Err(e) => {
                    // A concurrent insert or removal touched the same spot;
                    // re-scan from scratch, the match may have moved.
                    node = e.new;
                }
            }
        }
    }

    /// Returns a forward iterator over the current elements.
    ///
    /// The walk is a non-atomic, non-linearized snapshot: it is a diagnostic
    /// convenience and must not be relied on for correctness by concurrent
    /// callers.
    pub fn iter<'g>(&'g self, guard: &'g Guard) -> Iter<'g, T> {
        let head = self.head.load(Ordering::Acquire, guard);
        Iter {
            // SAFETY: the sentinel outlives every operation.
            curr: unsafe { head.deref() }.next.load(Ordering::Acquire, guard),
            guard,
        }
    }

    /// Swings the tail from `from` to `to`, then makes sure it does not stay
    /// on a node that was reserved for removal in the meantime.
    ///
    /// Every CAS that installs a pointer into the tail goes through here:
    /// together with the repair in `pop`, this keeps the invariant that the
    /// tail is moved off a reserved node before the node is reclaimed, so
    /// dereferencing a freshly loaded tail is always sound.
    fn advance_tail(
        &self,
        from: Shared<'_, Node<T>>,
        to: Shared<'_, Node<T>>,
        guard: &Guard,
    ) {
        if self
            .tail
            .compare_exchange(from, to, Ordering::Release, Ordering::Relaxed, guard)
            .is_ok()
        {
            // SAFETY: `to` was reachable under this guard.
            if unsafe { to.deref() }.next.load(Ordering::Acquire, guard).tag() == MARK {
                self.repair_tail(guard);
            }
        }
    }

    /// Moves the tail off a reserved node, onto the last live node reachable
    /// from the sentinel, helping to detach the reserved node if it is still
    /// linked. Returns once the tail names an unreserved node.
    fn repair_tail(&self, guard: &Guard) {
        let head = self.head.load(Ordering::Acquire, guard);

        loop {
            let tail = self.tail.load(Ordering::Acquire, guard);
            // SAFETY: the tail never names a freed node; reserved nodes are
            // kept alive until the tail has been observed off them.
            if unsafe { tail.deref() }.next.load(Ordering::Acquire, guard).tag() != MARK {
                return;
            }

            // Rescan from the sentinel for the physically last live node.
            let mut prev = head;
            // SAFETY: the sentinel outlives every operation.
            let mut curr = unsafe { prev.deref() }.next.load(Ordering::Acquire, guard);
            let last = loop {
                if curr.with_tag(0).is_null() {
                    break prev;
                }
                // SAFETY: `curr` was reachable under this guard.
                let next = unsafe { curr.deref() }.next.load(Ordering::Acquire, guard);
                if next.tag() == MARK {
                    // `curr` is a reserved last node mid-removal; help
                    // detach it so its predecessor becomes the live tail.
                    // SAFETY: `prev` was reachable under this guard.
                    let _ = unsafe { prev.deref() }.next.compare_exchange(
                        curr,
                        Shared::null(),
                        Ordering::Release,
                        Ordering::Relaxed,
                        guard,
                    );
                    break prev;
                }
                prev = curr;
                curr = next;
            };

            let _ = self
                .tail
                .compare_exchange(tail, last, Ordering::Release, Ordering::Relaxed, guard);
        }
    }

    /// Physically detaches a reserved node from the chain by CAS-ing its
    /// current predecessor's `next` past it. Rescans on interference from
    /// concurrent inserts; returns once the node is no longer reachable.
    fn unlink(&self, node: Shared<'_, Node<T>>, guard: &Guard) {
        let head = self.head.load(Ordering::Acquire, guard);

        loop {
            let mut prev = head;
            // SAFETY: the sentinel outlives every operation.
            let mut curr = unsafe { prev.deref() }.next.load(Ordering::Acquire, guard);
            loop {
                if curr.with_tag(0).is_null() {
                    // Already detached by a helping thread.
                    return;
                }
                if curr == node {
                    break;
                }
                prev = curr;
                // SAFETY: `curr` was reachable under this guard.
                curr = unsafe { curr.deref() }.next.load(Ordering::Acquire, guard);
            }

            // SAFETY: `prev` was reachable under this guard.
            if unsafe { prev.deref() }
                .next
                .compare_exchange(
                    node,
                    Shared::null(),
                    Ordering::Release,
                    Ordering::Relaxed,
                    guard,
                )
                .is_ok()
            {
                return;
            }
        }
    }
}

impl<T> Drop for TailList<T> {
    fn drop(&mut self) {
        // With `&mut self` no operation is in flight, so every node
        // reachable from the sentinel is exclusively ours and no reachable
        // node is still marked.
        let sentinel = mem::take(&mut *self.head);
        // SAFETY: `pop` never unlinks the sentinel, so it is still valid.
        let mut curr = unsafe { sentinel.into_owned() }.into_box().next;
        // SAFETY: all non-null nodes in the chain are valid, and we have
        // unique ownership of them via `&mut self`.
        while let Some(node) = unsafe { curr.try_into_owned() }.map(Owned::into_box) {
            curr = node.next;
        }
    }
}

/// Forward iterator over the elements of a [`TailList`].
///
/// Produced by [`TailList::iter`]; yields references valid for the guard's
/// lifetime.
#[derive(Debug)]
pub struct Iter<'g, T> {
    curr: Shared<'g, Node<T>>,
    guard: &'g Guard,
}

impl<'g, T> Iterator for Iter<'g, T> {
    type Item = &'g T;

    fn next(&mut self) -> Option<&'g T> {
        // A marked `next` is a tagged null and terminates the walk.
        if self.curr.with_tag(0).is_null() {
            return None;
        }
        // SAFETY: the node was reachable under `self.guard`, which is still
        // pinned, so it has not been reclaimed.
        let node = unsafe { self.curr.deref() };
        self.curr = node.next.load(Ordering::Acquire, self.guard);
        node.data.as_ref()
    }
}

impl<T: fmt::Display> fmt::Display for TailList<T> {
    /// Renders the current contents as ordered text, e.g. `[0, 1, 2]`.
    ///
    /// The rendering is itself a non-linearized scan and carries no
    /// concurrency guarantee.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = crossbeam_epoch::pin();
        write!(f, "[")?;
        for (i, value) in self.iter(&guard).enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{value}")?;
        }
        write!(f, "]")
    }
}
