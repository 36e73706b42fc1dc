// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Generic intrusive doubly-linked list kit.
//!
//! [`List`] is a single-owner circular DLL: every operation on it assumes
//! the caller already holds whatever lock protects the list (a core's own
//! running list needs none; the shared lists are always manipulated from
//! inside `shared.ostask.lock`). [`MpList`] wraps a `List` behind an atomic
//! head so several cores can touch it directly.
//!
//! Nodes are linked by address (`NonNull`), never moved once linked: the
//! backing storage is always a pool entry (see `task::OSTask`), not a value
//! that could be relocated while on a list.

use core::cell::Cell;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, Ordering};

use unwrap_lite::UnwrapLite;

/// Embedded previous/next pointers. A node that hasn't been linked yet
/// holds `None` in both fields.
pub struct Link<T> {
    prev: Cell<Option<NonNull<T>>>,
    next: Cell<Option<NonNull<T>>>,
}

impl<T> Link<T> {
    pub const fn new() -> Self {
        Link {
            prev: Cell::new(None),
            next: Cell::new(None),
        }
    }
}

impl<T> Default for Link<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Link<T> {
    pub fn next(&self) -> Option<NonNull<T>> {
        self.next.get()
    }

    pub fn prev(&self) -> Option<NonNull<T>> {
        self.prev.get()
    }
}

/// Implemented by node types to expose their intrusive links.
///
/// # Safety
///
/// `link` must always return a reference to the same embedded `Link<Self>`
/// for the node's entire lifetime. The node must not move in memory while
/// linked into any [`List`].
pub unsafe trait Node: Sized {
    fn link(&self) -> &Link<Self>;
}

fn link_between<T: Node>(before: NonNull<T>, item: NonNull<T>, after: NonNull<T>) {
    unsafe {
        item.as_ref().link().prev.set(Some(before));
        item.as_ref().link().next.set(Some(after));
        before.as_ref().link().next.set(Some(item));
        after.as_ref().link().prev.set(Some(item));
    }
}

/// A circular intrusive doubly-linked list. `head` names the element
/// considered "first" -- for a core's running list, the currently
/// executing task.
pub struct List<T: Node> {
    head: Cell<Option<NonNull<T>>>,
}

impl<T: Node> List<T> {
    pub const fn new() -> Self {
        List {
            head: Cell::new(None),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.get().is_none()
    }

    pub fn head(&self) -> Option<NonNull<T>> {
        self.head.get()
    }

    /// Inserts `item` at the tail of the list (i.e. immediately before the
    /// head), a FIFO append. If the list is empty, `item` becomes the sole
    /// element and the new head.
    ///
    /// # Safety
    /// `item` must not already be linked into any list.
    pub unsafe fn push_back(&self, item: NonNull<T>) {
        match self.head.get() {
            None => {
                let link = item.as_ref().link();
                link.prev.set(Some(item));
                link.next.set(Some(item));
                self.head.set(Some(item));
            }
            Some(head) => {
                let tail = head.as_ref().link().prev.get().unwrap_lite();
                link_between(tail, item, head);
            }
        }
    }

    /// Inserts `item` as the new head of the list.
    ///
    /// # Safety
    /// `item` must not already be linked into any list.
    pub unsafe fn push_front(&self, item: NonNull<T>) {
        self.push_back(item);
        self.head.set(Some(item));
    }

    /// Detaches `item`, which must currently be linked into this list, from
    /// the list. Does not search: the caller is responsible for knowing
    /// `item` belongs here.
    ///
    /// # Safety
    /// `item` must be currently linked into this list.
    pub unsafe fn detach(&self, item: NonNull<T>) {
        let link = item.as_ref().link();
        let prev = link.prev.get().unwrap_lite();
        let next = link.next.get().unwrap_lite();
        if prev == item {
            debug_assert_eq!(next, item);
            self.head.set(None);
        } else {
            prev.as_ref().link().next.set(Some(next));
            next.as_ref().link().prev.set(Some(prev));
            if self.head.get() == Some(item) {
                self.head.set(Some(next));
            }
        }
        link.prev.set(None);
        link.next.set(None);
    }

    /// Inserts `item` immediately before `before` in the list, which must
    /// already be linked here. If `before` is the current head, `item`
    /// becomes the new head.
    ///
    /// # Safety
    /// `before` must currently be linked into this list; `item` must not
    /// already be linked into any list.
    pub unsafe fn insert_before(&self, before: NonNull<T>, item: NonNull<T>) {
        let prev = before.as_ref().link().prev().unwrap_lite();
        link_between(prev, item, before);
        if self.head.get() == Some(before) {
            self.head.set(Some(item));
        }
    }

    /// Inserts `item` immediately after `after` in the list, which must
    /// already be linked here. Never changes the head.
    ///
    /// # Safety
    /// `after` must currently be linked into this list; `item` must not
    /// already be linked into any list.
    pub unsafe fn insert_after(&self, after: NonNull<T>, item: NonNull<T>) {
        let next = after.as_ref().link().next().unwrap_lite();
        link_between(after, item, next);
    }

    /// Detaches and returns the current head, if any.
    pub fn pop_front(&self) -> Option<NonNull<T>> {
        let head = self.head.get()?;
        unsafe {
            self.detach(head);
        }
        Some(head)
    }

    /// Advances the head pointer to the current head's successor, without
    /// otherwise changing the list. Implements the `Yield` rotation onto
    /// `running->next`.
    pub fn rotate(&self) {
        if let Some(head) = self.head.get() {
            let next = unsafe { head.as_ref().link().next.get().unwrap_lite() };
            self.head.set(Some(next));
        }
    }

    /// Detaches the run of elements from the current head up to and
    /// including `last`, and returns it as an independent list. `last` must
    /// be reachable from the head by following `next` pointers.
    ///
    /// # Safety
    /// `last` must currently be linked into this list.
    pub unsafe fn detach_until(&self, last: NonNull<T>) -> List<T> {
        let head = self.head.get().expect("detach_until on empty list");
        let after_last = last.as_ref().link().next.get().unwrap_lite();
        let old_tail = head.as_ref().link().prev.get().unwrap_lite();

        if after_last == head {
            // The whole list was taken.
            self.head.set(None);
            return List {
                head: Cell::new(Some(head)),
            };
        }

        after_last.as_ref().link().prev.set(Some(old_tail));
        old_tail.as_ref().link().next.set(Some(after_last));

        head.as_ref().link().prev.set(Some(last));
        last.as_ref().link().next.set(Some(head));

        self.head.set(Some(after_last));
        List {
            head: Cell::new(Some(head)),
        }
    }

    /// Splices `other`'s elements onto the front of `self`, so that
    /// `other`'s head becomes `self`'s new head. Inverse of
    /// `detach_until` when applied to the list it was cut from.
    ///
    /// # Safety
    /// `other`'s elements must not already be linked into `self` or any
    /// other list.
    pub unsafe fn insert_list_at_head(&self, other: List<T>) {
        let other_head = match other.head.get() {
            None => return,
            Some(h) => h,
        };
        match self.head.get() {
            None => {
                self.head.set(Some(other_head));
            }
            Some(self_head) => {
                let self_tail = self_head.as_ref().link().prev.get().unwrap_lite();
                let other_tail = other_head.as_ref().link().prev.get().unwrap_lite();
                self_tail.as_ref().link().next.set(Some(other_head));
                other_head.as_ref().link().prev.set(Some(self_tail));
                other_tail.as_ref().link().next.set(Some(self_head));
                self_head.as_ref().link().prev.set(Some(other_tail));
                self.head.set(Some(other_head));
            }
        }
    }

    /// Walks the list starting at the head, calling `f` on each node, until
    /// `f` returns `Some`. Stops without revisiting the head twice.
    pub fn find_map<R>(&self, mut f: impl FnMut(NonNull<T>) -> Option<R>) -> Option<R> {
        let head = self.head.get()?;
        let mut cur = head;
        loop {
            if let Some(r) = f(cur) {
                return Some(r);
            }
            let next = unsafe { cur.as_ref().link().next.get().unwrap_lite() };
            if next == head {
                return None;
            }
            cur = next;
        }
    }
}

impl<T: Node> Default for List<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Sentinel head value meaning "another core currently owns this list."
fn owned_sentinel<T>() -> *mut T {
    1usize as *mut T
}

/// A [`List`] reachable from multiple cores at once. Every manipulation
/// swaps the head pointer out for the `owned_sentinel`, operates on a local
/// [`List`] built from the swapped-out value, and swaps the (possibly new)
/// head back in -- the "swap head to sentinel, operate, restore" pattern.
pub struct MpList<T: Node> {
    head: AtomicPtr<T>,
}

impl<T: Node> MpList<T> {
    pub const fn new() -> Self {
        MpList {
            head: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    fn acquire(&self) -> *mut T {
        loop {
            let h = self.head.swap(owned_sentinel(), Ordering::Acquire);
            if h != owned_sentinel() {
                return h;
            }
            core::hint::spin_loop();
        }
    }

    fn release(&self, new_head: *mut T) {
        self.head.store(new_head, Ordering::Release);
        crate::arch::signal_event();
    }

    /// Runs `f` against a [`List`] view of the current contents, with
    /// exclusive access to the list for the duration of the call.
    pub fn manipulate<R>(&self, f: impl FnOnce(&List<T>) -> R) -> R {
        let raw = self.acquire();
        let local = List {
            head: Cell::new(NonNull::new(raw)),
        };
        let r = f(&local);
        let new_head = local.head.get().map_or(core::ptr::null_mut(), |p| p.as_ptr());
        self.release(new_head);
        r
    }

    /// # Safety
    /// `item` must not already be linked into any list.
    pub fn insert_at_head(&self, item: NonNull<T>) {
        self.manipulate(|l| unsafe { l.push_front(item) })
    }

    /// # Safety
    /// `item` must not already be linked into any list.
    pub fn insert_at_tail(&self, item: NonNull<T>) {
        self.manipulate(|l| unsafe { l.push_back(item) })
    }

    pub fn detach_at_head(&self) -> Option<NonNull<T>> {
        self.manipulate(|l| l.pop_front())
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }
}

impl<T: Node> Default for MpList<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::boxed::Box;

    struct TestNode {
        value: u32,
        link: Link<TestNode>,
    }

    unsafe impl Node for TestNode {
        fn link(&self) -> &Link<Self> {
            &self.link
        }
    }

    fn leak(value: u32) -> NonNull<TestNode> {
        let b = Box::new(TestNode {
            value,
            link: Link::new(),
        });
        NonNull::new(Box::leak(b) as *mut TestNode).unwrap()
    }

    fn values(list: &List<TestNode>) -> std::vec::Vec<u32> {
        let mut out = std::vec::Vec::new();
        if let Some(head) = list.head() {
            let mut cur = head;
            loop {
                out.push(unsafe { cur.as_ref().value });
                let next = unsafe { cur.as_ref().link().next.get().unwrap() };
                if next == head {
                    break;
                }
                cur = next;
            }
        }
        out
    }

    #[test]
    fn push_back_is_fifo() {
        let list = List::new();
        let a = leak(1);
        let b = leak(2);
        let c = leak(3);
        unsafe {
            list.push_back(a);
            list.push_back(b);
            list.push_back(c);
        }
        assert_eq!(values(&list), vec![1, 2, 3]);
    }

    #[test]
    fn push_front_becomes_head() {
        let list = List::new();
        let a = leak(1);
        let b = leak(2);
        unsafe {
            list.push_back(a);
            list.push_front(b);
        }
        assert_eq!(values(&list), vec![2, 1]);
    }

    #[test]
    fn detach_sole_element_empties_list() {
        let list = List::new();
        let a = leak(1);
        unsafe {
            list.push_back(a);
            list.detach(a);
        }
        assert!(list.is_empty());
    }

    #[test]
    fn detach_middle_element() {
        let list = List::new();
        let a = leak(1);
        let b = leak(2);
        let c = leak(3);
        unsafe {
            list.push_back(a);
            list.push_back(b);
            list.push_back(c);
            list.detach(b);
        }
        assert_eq!(values(&list), vec![1, 3]);
    }

    #[test]
    fn rotate_advances_head() {
        let list = List::new();
        let a = leak(1);
        let b = leak(2);
        unsafe {
            list.push_back(a);
            list.push_back(b);
        }
        list.rotate();
        assert_eq!(values(&list), vec![2, 1]);
    }

    #[test]
    fn detach_until_then_reinsert_round_trips() {
        let list = List::new();
        let a = leak(1);
        let b = leak(2);
        let c = leak(3);
        let d = leak(4);
        unsafe {
            list.push_back(a);
            list.push_back(b);
            list.push_back(c);
            list.push_back(d);

            let prefix = list.detach_until(b);
            assert_eq!(values(&list), vec![3, 4]);

            list.insert_list_at_head(prefix);
        }
        assert_eq!(values(&list), vec![1, 2, 3, 4]);
    }

    #[test]
    fn detach_until_whole_list() {
        let list = List::new();
        let a = leak(1);
        let b = leak(2);
        unsafe {
            list.push_back(a);
            list.push_back(b);
            let all = list.detach_until(b);
            assert!(list.is_empty());
            assert_eq!(values(&all), vec![1, 2]);
        }
    }

    #[test]
    fn mp_list_insert_and_detach() {
        let list: MpList<TestNode> = MpList::new();
        let a = leak(1);
        let b = leak(2);
        list.insert_at_tail(a);
        list.insert_at_tail(b);
        assert_eq!(
            unsafe { list.detach_at_head().unwrap().as_ref().value },
            1
        );
        assert_eq!(
            unsafe { list.detach_at_head().unwrap().as_ref().value },
            2
        );
        assert!(list.is_empty());
    }
}
