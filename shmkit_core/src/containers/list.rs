// Doubly linked list in shared memory

use super::protocol::{ShmContainer, ShmElement, ShmHandle};
use crate::error::{ShmError, ShmResult};
use crate::memory::{AllocRef, Pointer};
use std::fmt;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ListHeader {
    pub(crate) head: Pointer,
    pub(crate) tail: Pointer,
    pub(crate) len: u64,
}

impl ListHeader {
    pub const EMPTY: ListHeader = ListHeader {
        head: Pointer::NULL,
        tail: Pointer::NULL,
        len: 0,
    };
}

#[repr(C)]
struct ListNode<S> {
    prev: Pointer,
    next: Pointer,
    value: S,
}

/// Doubly linked list; every node is a separate allocation
pub struct ShmList<T: ShmElement> {
    handle: ShmHandle<Self>,
}

fn node<'a, S>(alloc: &AllocRef, p: Pointer) -> &'a mut ListNode<S> {
    unsafe { &mut *alloc.convert::<ListNode<S>>(p) }
}

impl<T: ShmElement> ShmContainer for ShmList<T> {
    type Header = ListHeader;

    fn handle(&self) -> &ShmHandle<Self> {
        &self.handle
    }

    fn handle_mut(&mut self) -> &mut ShmHandle<Self> {
        &mut self.handle
    }

    fn from_handle(handle: ShmHandle<Self>) -> Self {
        Self { handle }
    }

    fn destroy_payload(header: &mut ListHeader, alloc: &AllocRef) -> ShmResult<()> {
        let mut cur = header.head;
        while !cur.is_null() {
            let n = node::<T::Stored>(alloc, cur);
            let next = n.next;
            T::destroy_stored(&mut n.value, alloc)?;
            alloc.free(cur)?;
            header.head = next;
            header.len -= 1;
            cur = next;
        }
        *header = ListHeader::EMPTY;
        Ok(())
    }

    fn copy_payload(src: &ListHeader, from: &AllocRef, to: &AllocRef) -> ShmResult<ListHeader> {
        let mut copied = ListHeader::EMPTY;
        let mut cur = src.head;
        while !cur.is_null() {
            let n = node::<T::Stored>(from, cur);
            let result = T::copy_stored(&n.value, from, to)
                .and_then(|value| Self::link_back(&mut copied, to, value));
            if let Err(e) = result {
                Self::destroy_payload(&mut copied, to)?;
                return Err(e);
            }
            cur = n.next;
        }
        Ok(copied)
    }
}

impl<T: ShmElement> ShmList<T> {
    pub fn new(alloc: &AllocRef) -> ShmResult<Self> {
        Ok(Self::from_handle(ShmHandle::init(None, alloc, ListHeader::EMPTY)?))
    }

    /// Construct an empty list whose header lives at `at`
    pub fn new_in_place(alloc: &AllocRef, at: Pointer) -> ShmResult<Self> {
        Ok(Self::from_handle(ShmHandle::init(Some(at), alloc, ListHeader::EMPTY)?))
    }

    pub fn len(&self) -> usize {
        self.handle.header().len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn new_node(alloc: &AllocRef, value: T::Stored) -> ShmResult<Pointer> {
        let (p, n) = alloc.allocate_ptr::<ListNode<T::Stored>>(1)?;
        unsafe {
            n.write(ListNode {
                prev: Pointer::NULL,
                next: Pointer::NULL,
                value,
            })
        };
        Ok(p)
    }

    fn link_back(header: &mut ListHeader, alloc: &AllocRef, value: T::Stored) -> ShmResult<()> {
        let p = Self::new_node(alloc, value)?;
        Self::attach_back(header, alloc, p);
        Ok(())
    }

    fn attach_back(header: &mut ListHeader, alloc: &AllocRef, p: Pointer) {
        let n = node::<T::Stored>(alloc, p);
        n.prev = header.tail;
        n.next = Pointer::NULL;
        if header.tail.is_null() {
            header.head = p;
        } else {
            node::<T::Stored>(alloc, header.tail).next = p;
        }
        header.tail = p;
        header.len += 1;
    }

    /// Take node `p` out of the chain; the node itself stays allocated
    fn detach(header: &mut ListHeader, alloc: &AllocRef, p: Pointer) {
        let n = node::<T::Stored>(alloc, p);
        let (prev, next) = (n.prev, n.next);
        if prev.is_null() {
            header.head = next;
        } else {
            node::<T::Stored>(alloc, prev).next = next;
        }
        if next.is_null() {
            header.tail = prev;
        } else {
            node::<T::Stored>(alloc, next).prev = prev;
        }
        header.len -= 1;
    }

    /// Detach node `p` and hand back its stored value
    fn unlink(header: &mut ListHeader, alloc: &AllocRef, p: Pointer) -> ShmResult<T::Stored> {
        Self::detach(header, alloc, p);
        let value = node::<T::Stored>(alloc, p).value;
        alloc.free(p)?;
        Ok(value)
    }

    /// Move the first node to the back of `dst` without reallocating it
    ///
    /// Both lists must belong to the same allocator. Returns false if `self`
    /// is empty.
    pub(crate) fn move_front_to(&mut self, dst: &mut ShmList<T>) -> bool {
        let head = self.handle.header().head;
        if head.is_null() {
            return false;
        }
        let alloc = self.handle.alloc().clone();
        Self::detach(self.handle.header_mut(), &alloc, head);
        Self::attach_back(dst.handle.header_mut(), &alloc, head);
        true
    }

    pub fn push_back(&mut self, value: T) -> ShmResult<()> {
        let alloc = self.handle.alloc().clone();
        let stored = value.store(&alloc)?;
        Self::link_back(self.handle.header_mut(), &alloc, stored)
    }

    pub fn push_front(&mut self, value: T) -> ShmResult<()> {
        let alloc = self.handle.alloc().clone();
        let stored = value.store(&alloc)?;
        let p = Self::new_node(&alloc, stored)?;
        let header = self.handle.header_mut();
        node::<T::Stored>(&alloc, p).next = header.head;
        if header.head.is_null() {
            header.tail = p;
        } else {
            node::<T::Stored>(&alloc, header.head).prev = p;
        }
        header.head = p;
        header.len += 1;
        Ok(())
    }

    pub fn pop_front(&mut self) -> ShmResult<Option<T>> {
        let head = self.handle.header().head;
        self.take_node(head)
    }

    pub fn pop_back(&mut self) -> ShmResult<Option<T>> {
        let tail = self.handle.header().tail;
        self.take_node(tail)
    }

    fn take_node(&mut self, p: Pointer) -> ShmResult<Option<T>> {
        if p.is_null() {
            return Ok(None);
        }
        let alloc = self.handle.alloc().clone();
        let stored = Self::unlink(self.handle.header_mut(), &alloc, p)?;
        Ok(Some(T::take(stored, &alloc)))
    }

    pub fn front(&self) -> Option<T> {
        self.iter().next()
    }

    pub fn back(&self) -> Option<T> {
        let tail = self.handle.header().tail;
        if tail.is_null() {
            return None;
        }
        let alloc = self.handle.alloc();
        Some(T::load(&node::<T::Stored>(alloc, tail).value, alloc))
    }

    fn node_at(&self, index: usize) -> Option<Pointer> {
        self.nodes().nth(index)
    }

    pub fn get(&self, index: usize) -> ShmResult<T> {
        let p = self
            .node_at(index)
            .ok_or_else(|| ShmError::out_of_bounds("ShmList::get", index, self.len()))?;
        let alloc = self.handle.alloc();
        Ok(T::load(&node::<T::Stored>(alloc, p).value, alloc))
    }

    /// Remove and return the element at `index`
    pub fn remove(&mut self, index: usize) -> ShmResult<T> {
        let p = self
            .node_at(index)
            .ok_or_else(|| ShmError::out_of_bounds("ShmList::remove", index, self.len()))?;
        self.take_node(p)?
            .ok_or_else(|| ShmError::out_of_bounds("ShmList::remove", index, self.len()))
    }

    /// Keep only the elements for which `keep` returns true
    ///
    /// Returns the number of elements removed (and destroyed).
    pub fn retain<F>(&mut self, mut keep: F) -> ShmResult<usize>
    where
        F: FnMut(&T) -> bool,
    {
        let alloc = self.handle.alloc().clone();
        let nodes: Vec<Pointer> = self.nodes().collect();
        let mut removed = 0;
        for p in nodes {
            let value = T::load(&node::<T::Stored>(&alloc, p).value, &alloc);
            if !keep(&value) {
                let mut stored = Self::unlink(self.handle.header_mut(), &alloc, p)?;
                T::destroy_stored(&mut stored, &alloc)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Destroy every element
    pub fn clear(&mut self) -> ShmResult<()> {
        let alloc = self.handle.alloc().clone();
        Self::destroy_payload(self.handle.header_mut(), &alloc)
    }

    pub fn iter(&self) -> ShmListIter<'_, T> {
        ShmListIter {
            list: self,
            cur: self.handle.header().head,
        }
    }

    fn nodes(&self) -> impl Iterator<Item = Pointer> + '_ {
        let alloc = self.handle.alloc();
        let mut cur = self.handle.header().head;
        std::iter::from_fn(move || {
            if cur.is_null() {
                return None;
            }
            let p = cur;
            cur = node::<T::Stored>(alloc, p).next;
            Some(p)
        })
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.iter().collect()
    }
}

/// Front-to-back iterator over transient element views
pub struct ShmListIter<'a, T: ShmElement> {
    list: &'a ShmList<T>,
    cur: Pointer,
}

impl<T: ShmElement> Iterator for ShmListIter<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if self.cur.is_null() {
            return None;
        }
        let alloc = self.list.handle.alloc();
        let n = node::<T::Stored>(alloc, self.cur);
        self.cur = n.next;
        Some(T::load(&n.value, alloc))
    }
}

impl<T: ShmElement + fmt::Debug> fmt::Debug for ShmList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            return write!(f, "ShmList(null)");
        }
        f.debug_list().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::containers::test_support::stack_allocator;

    #[test]
    fn test_push_pop_both_ends() {
        let alloc = stack_allocator();
        let mut list = ShmList::<u32>::new(&alloc).unwrap();
        list.push_back(2).unwrap();
        list.push_back(3).unwrap();
        list.push_front(1).unwrap();
        assert_eq!(list.to_vec(), vec![1, 2, 3]);
        assert_eq!(list.front(), Some(1));
        assert_eq!(list.back(), Some(3));
        assert_eq!(list.pop_back().unwrap(), Some(3));
        assert_eq!(list.pop_front().unwrap(), Some(1));
        assert_eq!(list.pop_front().unwrap(), Some(2));
        assert_eq!(list.pop_front().unwrap(), None);
        assert!(list.is_empty());
    }

    #[test]
    fn test_get_remove_retain() {
        let alloc = stack_allocator();
        let mut list = ShmList::<u64>::new(&alloc).unwrap();
        for i in 0..10 {
            list.push_back(i).unwrap();
        }
        assert_eq!(list.get(4).unwrap(), 4);
        assert_eq!(list.remove(4).unwrap(), 4);
        assert_eq!(list.len(), 9);
        assert_eq!(list.retain(|v| v % 2 == 0).unwrap(), 4);
        assert_eq!(list.to_vec(), vec![0, 2, 6, 8]);
        assert!(list.get(4).is_err());
        assert_eq!(list.back(), Some(8));
    }

    #[test]
    fn test_list_of_vectors_freed() {
        let alloc = stack_allocator();
        {
            let mut list = ShmList::<crate::containers::ShmVec<u8>>::new(&alloc).unwrap();
            for n in 0..5 {
                let mut v = crate::containers::ShmVec::new(&alloc).unwrap();
                v.resize(n, 1).unwrap();
                list.push_back(v).unwrap();
            }
            let copy = list.try_clone().unwrap();
            assert_eq!(copy.get(4).unwrap().len(), 4);
            list.retain(|v| v.len() > 2).unwrap();
            assert_eq!(list.len(), 2);
            assert_eq!(copy.len(), 5);
        }
        assert_eq!(alloc.currently_allocated_size(), 0);
    }
}
