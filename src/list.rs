//! Doubly linked circular intrusive list with a head node.
//!
//! Threads carry several `ListEntry` fields and appear on the ready queue,
//! a waiter list, and the sleep queue through different entries. The list
//! stores no data of its own; `container_of!` recovers the owning object.
//!
//! All operations assume the caller has interrupts off (or otherwise owns
//! the list exclusively).

use core::ptr;

/// Membership link embedded in a listed object.
pub struct ListEntry {
    next: *mut ListEntry,
    prev: *mut ListEntry,
}

impl ListEntry {
    pub const fn new() -> Self {
        Self {
            next: ptr::null_mut(),
            prev: ptr::null_mut(),
        }
    }

    /// Is this entry currently on some list?
    ///
    /// Entries are unlinked into the self-referential state, so a null or
    /// self-pointing `next` means "not listed".
    pub fn is_linked(&self) -> bool {
        !self.next.is_null() && self.next as *const _ != self as *const _
    }
}

/// Recover the object that embeds a `ListEntry`.
#[macro_export]
macro_rules! container_of {
    ($ptr:expr, $ty:path, $field:ident) => {
        ($ptr as *const _ as usize - core::mem::offset_of!($ty, $field)) as *mut $ty
    };
}

/// The list head. Statics start unlinked and self-link lazily on first use,
/// so `List::new()` can be `const`.
///
/// The head links to itself, so a list must not move once used; lists live
/// in statics or in place inside page-resident structures.
pub struct List {
    head: ListEntry,
}

impl List {
    pub const fn new() -> Self {
        Self {
            head: ListEntry::new(),
        }
    }

    fn ensure_init(&mut self) {
        if self.head.next.is_null() {
            let head = &mut self.head as *mut ListEntry;
            self.head.next = head;
            self.head.prev = head;
        }
    }

    pub fn is_empty(&mut self) -> bool {
        self.ensure_init();
        self.head.next as *const _ == &self.head as *const _
    }

    /// Number of entries. O(n); used by assertions and tests.
    pub fn len(&mut self) -> usize {
        let mut n = 0;
        let mut e = self.front();
        while let Some(cur) = e {
            n += 1;
            e = self.next_of(cur);
        }
        n
    }

    /// # Safety
    ///
    /// `e` must not already be on a list, and must stay valid while listed.
    pub unsafe fn push_back(&mut self, e: *mut ListEntry) {
        self.ensure_init();
        let head = &mut self.head as *mut ListEntry;
        unsafe { Self::insert_before(head, e) };
    }

    /// # Safety
    ///
    /// Same as `push_back`.
    pub unsafe fn push_front(&mut self, e: *mut ListEntry) {
        self.ensure_init();
        let first = self.head.next;
        unsafe { Self::insert_before(first, e) };
    }

    /// Insert `e` before the first entry for which `less(e, entry)` holds,
    /// keeping the list sorted and the insertion stable for equal keys.
    ///
    /// # Safety
    ///
    /// Same as `push_back`; `less` must be a total order over listed entries.
    pub unsafe fn insert_ordered(
        &mut self,
        e: *mut ListEntry,
        less: unsafe fn(*const ListEntry, *const ListEntry) -> bool,
    ) {
        self.ensure_init();
        let head = &mut self.head as *mut ListEntry;
        let mut cur = self.head.next;
        while cur != head {
            if unsafe { less(e, cur) } {
                break;
            }
            cur = unsafe { (*cur).next };
        }
        unsafe { Self::insert_before(cur, e) };
    }

    pub fn front(&mut self) -> Option<*mut ListEntry> {
        self.ensure_init();
        if self.is_empty() {
            None
        } else {
            Some(self.head.next)
        }
    }

    /// The entry after `e`, or `None` at the back.
    pub fn next_of(&mut self, e: *mut ListEntry) -> Option<*mut ListEntry> {
        let head = &mut self.head as *mut ListEntry;
        let next = unsafe { (*e).next };
        if next == head {
            None
        } else {
            Some(next)
        }
    }

    pub fn pop_front(&mut self) -> Option<*mut ListEntry> {
        let front = self.front()?;
        unsafe { Self::remove(front) };
        Some(front)
    }

    /// Unlink `e` from whatever list it is on.
    ///
    /// # Safety
    ///
    /// `e` must currently be on a list.
    pub unsafe fn remove(e: *mut ListEntry) {
        unsafe {
            debug_assert!((*e).is_linked() || (*e).next == e);
            (*(*e).prev).next = (*e).next;
            (*(*e).next).prev = (*e).prev;
            (*e).next = e;
            (*e).prev = e;
        }
    }

    unsafe fn insert_before(pos: *mut ListEntry, e: *mut ListEntry) {
        unsafe {
            debug_assert!(!(*e).is_linked(), "entry already listed");
            (*e).next = pos;
            (*e).prev = (*pos).prev;
            (*(*e).next).prev = e;
            (*(*e).prev).next = e;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Item {
        key: u64,
        entry: ListEntry,
    }

    impl Item {
        fn new(key: u64) -> Box<Item> {
            Box::new(Item {
                key,
                entry: ListEntry::new(),
            })
        }
    }

    unsafe fn key_less(a: *const ListEntry, b: *const ListEntry) -> bool {
        let a = unsafe { &*container_of!(a, Item, entry) };
        let b = unsafe { &*container_of!(b, Item, entry) };
        a.key < b.key
    }

    fn keys(list: &mut List) -> Vec<u64> {
        let mut out = Vec::new();
        let mut e = list.front();
        while let Some(cur) = e {
            out.push(unsafe { (*container_of!(cur, Item, entry)).key });
            e = list.next_of(cur);
        }
        out
    }

    #[test]
    fn fifo_push_pop() {
        let mut list = List::new();
        let mut items: Vec<_> = (0..4).map(Item::new).collect();
        for item in &mut items {
            unsafe { list.push_back(&mut item.entry) };
        }
        assert_eq!(keys(&mut list), [0, 1, 2, 3]);
        assert_eq!(list.len(), 4);

        let front = list.pop_front().unwrap();
        assert_eq!(unsafe { (*container_of!(front, Item, entry)).key }, 0);
        assert_eq!(keys(&mut list), [1, 2, 3]);
    }

    #[test]
    fn remove_middle() {
        let mut list = List::new();
        let mut items: Vec<_> = (0..3).map(Item::new).collect();
        for item in &mut items {
            unsafe { list.push_back(&mut item.entry) };
        }
        unsafe { List::remove(&mut items[1].entry) };
        assert_eq!(keys(&mut list), [0, 2]);
        assert!(!items[1].entry.is_linked());
    }

    #[test]
    fn ordered_insert_is_stable() {
        let mut list = List::new();
        // Two items share key 5; the later insertion must land behind the
        // earlier one.
        let mut a = Item::new(5);
        let mut b = Item::new(3);
        let mut c = Item::new(5);
        let mut d = Item::new(1);
        unsafe {
            list.insert_ordered(&mut a.entry, key_less);
            list.insert_ordered(&mut b.entry, key_less);
            list.insert_ordered(&mut c.entry, key_less);
            list.insert_ordered(&mut d.entry, key_less);
        }
        assert_eq!(keys(&mut list), [1, 3, 5, 5]);
        let first = list.front().unwrap();
        let second = list.next_of(first).unwrap();
        let third = list.next_of(second).unwrap();
        assert_eq!(third, &mut a.entry as *mut _);
    }

    #[test]
    fn empty_list() {
        let mut list = List::new();
        assert!(list.is_empty());
        assert!(list.pop_front().is_none());
        assert_eq!(list.len(), 0);
    }
}
