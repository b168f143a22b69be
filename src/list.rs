use core::fmt;
use core::mem;
use core::ptr::{self, NonNull};

/// A node of the recency list.
///
/// The payload uses `MaybeUninit` so the head and tail sentinel nodes can
/// exist without carrying a value.
pub(crate) struct Node<T> {
    val: mem::MaybeUninit<T>,
    prev: *mut Node<T>,
    next: *mut Node<T>,
}

impl<T> Node<T> {
    fn new(val: T) -> Self {
        Node {
            val: mem::MaybeUninit::new(val),
            prev: ptr::null_mut(),
            next: ptr::null_mut(),
        }
    }

    fn new_sigil() -> Self {
        Node {
            val: mem::MaybeUninit::uninit(),
            prev: ptr::null_mut(),
            next: ptr::null_mut(),
        }
    }

    /// Borrows the payload.
    ///
    /// # Safety
    ///
    /// Must only be called on non-sentinel nodes, whose payload is
    /// initialized.
    pub(crate) unsafe fn value(&self) -> &T {
        self.val.assume_init_ref()
    }
}

/// Intrusive doubly linked list maintaining recency order.
///
/// Front = most recently used, back = least recently used. All operations
/// are O(1) except [`LruList::pop_back_where`], which walks from the back
/// until its predicate accepts a victim. Node pointers handed out by
/// [`LruList::push_front`] stay valid until the node is unlinked, so the
/// index can keep them for O(1) touch and removal.
///
/// The list is internal infrastructure: every operation that takes a raw
/// node pointer is unsafe and relies on the caller (the cache controller,
/// under the cache mutex) to pass pointers it obtained from this list.
pub(crate) struct LruList<T> {
    len: usize,
    /// Head sentinel; its `next` is the most recently used node.
    head: *mut Node<T>,
    /// Tail sentinel; its `prev` is the least recently used node.
    tail: *mut Node<T>,
}

impl<T> LruList<T> {
    pub(crate) fn new() -> Self {
        let head = Box::into_raw(Box::new(Node::new_sigil()));
        let tail = Box::into_raw(Box::new(Node::new_sigil()));

        let list = LruList { len: 0, head, tail };

        // SAFETY: both sentinels were just allocated and are valid.
        unsafe {
            (*list.head).next = list.tail;
            (*list.tail).prev = list.head;
        }

        list
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[allow(dead_code)]
    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Links a fresh node holding `val` right behind the head sentinel and
    /// returns it.
    pub(crate) fn push_front(&mut self, val: T) -> NonNull<Node<T>> {
        // SAFETY: Box::into_raw never returns null.
        let node = unsafe { NonNull::new_unchecked(Box::into_raw(Box::new(Node::new(val)))) };
        // SAFETY: the node is freshly allocated and not linked anywhere.
        unsafe { self.attach(node.as_ptr()) };
        self.len += 1;
        node
    }

    /// Moves `node` to the front (most recently used position).
    ///
    /// # Safety
    ///
    /// `node` must point to a live non-sentinel node of this list.
    pub(crate) unsafe fn move_to_front(&mut self, node: *mut Node<T>) {
        if (*self.head).next == node {
            return;
        }
        self.detach(node);
        self.attach(node);
    }

    /// Unlinks `node` and returns its payload.
    ///
    /// # Safety
    ///
    /// `node` must point to a live non-sentinel node of this list. The
    /// pointer is dead after this call.
    pub(crate) unsafe fn unlink(&mut self, node: *mut Node<T>) -> T {
        self.detach(node);
        self.len -= 1;
        // SAFETY: the node came from push_front and is now unlinked, so
        // reclaiming the box and reading the payload out is sound.
        let node = Box::from_raw(node);
        node.val.assume_init()
    }

    /// Removes and returns the least recently used payload.
    pub(crate) fn pop_back(&mut self) -> Option<T> {
        // SAFETY: the sentinels are always valid.
        let lru = unsafe { (*self.tail).prev };
        if lru == self.head {
            return None;
        }
        // SAFETY: lru sits between the sentinels, so it is a live payload node.
        Some(unsafe { self.unlink(lru) })
    }

    /// Walks from the least recently used end towards the front and removes
    /// the first payload accepted by `pred`. Returns `None` when no node
    /// qualifies.
    pub(crate) fn pop_back_where<F>(&mut self, mut pred: F) -> Option<T>
    where
        F: FnMut(&T) -> bool,
    {
        // SAFETY: the sentinels are always valid.
        let mut cur = unsafe { (*self.tail).prev };
        while cur != self.head {
            // SAFETY: cur is a live payload node between the sentinels.
            let accepted = pred(unsafe { (*cur).value() });
            if accepted {
                // SAFETY: same as above; cur is removed and consumed here.
                return Some(unsafe { self.unlink(cur) });
            }
            // SAFETY: cur is linked, so its prev pointer is valid.
            cur = unsafe { (*cur).prev };
        }
        None
    }

    /// Least recently used payload, if any.
    pub(crate) fn back(&self) -> Option<&T> {
        // SAFETY: the sentinels are always valid.
        let lru = unsafe { (*self.tail).prev };
        if lru == self.head {
            None
        } else {
            // SAFETY: lru is a live payload node.
            Some(unsafe { (*lru).value() })
        }
    }

    /// Most recently used payload, if any.
    pub(crate) fn front(&self) -> Option<&T> {
        // SAFETY: the sentinels are always valid.
        let mru = unsafe { (*self.head).next };
        if mru == self.tail {
            None
        } else {
            // SAFETY: mru is a live payload node.
            Some(unsafe { (*mru).value() })
        }
    }

    pub(crate) fn clear(&mut self) {
        while self.pop_back().is_some() {}
    }

    /// Unlinks `node` from its neighbors without touching `len` or freeing it.
    ///
    /// # Safety
    ///
    /// `node` must be a live payload node of this list.
    unsafe fn detach(&mut self, node: *mut Node<T>) {
        (*(*node).prev).next = (*node).next;
        (*(*node).next).prev = (*node).prev;
    }

    /// Links `node` right behind the head sentinel.
    ///
    /// # Safety
    ///
    /// `node` must be valid and not currently linked into any list.
    unsafe fn attach(&mut self, node: *mut Node<T>) {
        (*node).next = (*self.head).next;
        (*node).prev = self.head;
        (*self.head).next = node;
        (*(*node).next).prev = node;
    }
}

impl<T> Drop for LruList<T> {
    fn drop(&mut self) {
        self.clear();
        // SAFETY: the sentinels were allocated in `new` and are freed exactly
        // once, here.
        unsafe {
            let _ = Box::from_raw(self.head);
            let _ = Box::from_raw(self.tail);
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for LruList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LruList").field("len", &self.len).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_list_is_empty() {
        let list = LruList::<u32>::new();
        assert_eq!(list.len(), 0);
        assert!(list.is_empty());
        assert!(list.back().is_none());
        assert!(list.front().is_none());
    }

    #[test]
    fn test_push_front_orders_mru_first() {
        let mut list = LruList::new();
        list.push_front(10);
        list.push_front(20);
        list.push_front(30);

        assert_eq!(list.len(), 3);
        assert_eq!(list.front(), Some(&30));
        assert_eq!(list.back(), Some(&10));
    }

    #[test]
    fn test_pop_back_returns_lru_order() {
        let mut list = LruList::new();
        list.push_front(10);
        list.push_front(20);
        list.push_front(30);

        assert_eq!(list.pop_back(), Some(10));
        assert_eq!(list.pop_back(), Some(20));
        assert_eq!(list.pop_back(), Some(30));
        assert_eq!(list.pop_back(), None);
        assert!(list.is_empty());
    }

    #[test]
    fn test_move_to_front() {
        let mut list = LruList::new();
        let node1 = list.push_front(10);
        let _node2 = list.push_front(20);
        let _node3 = list.push_front(30);

        // 10 was the LRU victim; promote it.
        unsafe { list.move_to_front(node1.as_ptr()) };
        assert_eq!(list.len(), 3);
        assert_eq!(list.front(), Some(&10));
        assert_eq!(list.back(), Some(&20));

        // Promoting the node already at the front is a no-op.
        unsafe { list.move_to_front(node1.as_ptr()) };
        assert_eq!(list.front(), Some(&10));
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn test_unlink_middle_node() {
        let mut list = LruList::new();
        let _node1 = list.push_front(10);
        let node2 = list.push_front(20);
        let _node3 = list.push_front(30);

        let val = unsafe { list.unlink(node2.as_ptr()) };
        assert_eq!(val, 20);
        assert_eq!(list.len(), 2);
        assert_eq!(list.pop_back(), Some(10));
        assert_eq!(list.pop_back(), Some(30));
    }

    #[test]
    fn test_pop_back_where_skips_rejected() {
        let mut list = LruList::new();
        list.push_front(1);
        list.push_front(2);
        list.push_front(3);
        list.push_front(4);

        // Reject odd payloads: 1 (the LRU) is skipped, 2 is taken.
        assert_eq!(list.pop_back_where(|v| v % 2 == 0), Some(2));
        assert_eq!(list.len(), 3);
        assert_eq!(list.back(), Some(&1));

        // Nothing qualifies.
        assert_eq!(list.pop_back_where(|v| *v > 100), None);
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn test_clear_then_reuse() {
        let mut list = LruList::new();
        list.push_front(String::from("a"));
        list.push_front(String::from("b"));
        list.clear();
        assert!(list.is_empty());

        list.push_front(String::from("c"));
        assert_eq!(list.len(), 1);
        assert_eq!(list.back().map(String::as_str), Some("c"));
    }

    #[test]
    fn test_drop_releases_payloads() {
        use std::sync::Arc;

        let marker = Arc::new(());
        {
            let mut list = LruList::new();
            list.push_front(Arc::clone(&marker));
            list.push_front(Arc::clone(&marker));
        }
        assert_eq!(Arc::strong_count(&marker), 1);
    }
}
