//! Intrusive cyclic doubly-linked list backed by a container implementing
//! `core::ops::Index`.
//!
//! Both of the kernel's global lists (the ready queue and the timeout queue
//! root) and every per-object wait queue are instances of this structure.
//! Elements carry their own links; the container owns nothing. A corrupted
//! link structure is a fatal programming error and panics.
#![allow(dead_code)]
use core::{fmt, ops};

use super::Init;

/// Cyclic linked list header.
#[derive(Copy, Clone)]
pub struct ListHead<Index> {
    pub first: Option<Index>,
}

impl<Index: fmt::Debug> fmt::Debug for ListHead<Index> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ListHead({:?})", &self.first)
    }
}

impl<Index> Init for ListHead<Index> {
    const INIT: Self = Self { first: None };
}

impl<Index> ListHead<Index> {
    pub const fn new() -> Self {
        Self::INIT
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }
}

/// Links to the neighbor elements.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Link<Index> {
    pub prev: Index,
    pub next: Index,
}

/// A virtual container of `T`s that can be indexed by `Ident<&'static T>`.
#[derive(Debug, Clone, Copy)]
pub struct Static;

impl<T> ops::Index<Ident<&'static T>> for Static {
    type Output = T;

    #[inline]
    fn index(&self, index: Ident<&'static T>) -> &Self::Output {
        index.0
    }
}

/// Reference wrapper that implements `PartialEq` and `Eq` by identity
/// comparison.
#[derive(Clone, Copy)]
pub struct Ident<T>(pub T);

impl<T> fmt::Debug for Ident<&'_ T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // Do not print the pointee. This is a safe measure against infinite
        // recursion.
        f.debug_tuple("Ident").field(&(self.0 as *const T)).finish()
    }
}

impl<T: ?Sized> PartialEq for Ident<&'_ T> {
    fn eq(&self, other: &Self) -> bool {
        core::ptr::eq(self.0, other.0)
    }
}

impl<T: ?Sized> Eq for Ident<&'_ T> {}

/// Cyclic linked list header where elements are linked by
/// [`StaticLink`]`<Element>` (a pair of `&'static Element`).
pub type StaticListHead<Element> = ListHead<Ident<&'static Element>>;

/// Links to neighbor items with a `'static` lifetime.
pub type StaticLink<Element> = Link<Ident<&'static Element>>;

/// An abstract interface to a mutable cell, generic over the key used to
/// unlock it.
pub trait CellLike<Key> {
    type Target;

    fn get(&self, key: &Key) -> Self::Target;
    fn set(&self, key: &mut Key, value: Self::Target);

    #[inline]
    fn modify<T>(&self, key: &mut Key, f: impl FnOnce(&mut Self::Target) -> T) -> T
    where
        Self: Sized,
    {
        let mut x = self.get(key);
        let ret = f(&mut x);
        self.set(key, x);
        ret
    }
}

impl<Element: Copy> CellLike<()> for core::cell::Cell<Element> {
    type Target = Element;

    fn get(&self, _: &()) -> Self::Target {
        self.get()
    }
    fn set(&self, _: &mut (), value: Self::Target) {
        self.set(value);
    }
}

impl<Key, Element: CellLike<Key>> CellLike<Key> for &Element {
    type Target = Element::Target;

    fn get(&self, key: &Key) -> Self::Target {
        (*self).get(key)
    }
    fn set(&self, key: &mut Key, value: Self::Target) {
        (*self).set(key, value);
    }
    fn modify<T>(&self, key: &mut Key, f: impl FnOnce(&mut Self::Target) -> T) -> T {
        (*self).modify(key, f)
    }
}

#[derive(Debug, Clone, Copy)]
pub enum InsertError {
    AlreadyLinked,
}

#[derive(Debug, Clone, Copy)]
pub enum ItemError {
    NotLinked,
}

#[cold]
fn corrupted() -> ! {
    panic!("intrusive list is corrupted");
}

/// `Cell`-based accessor to a linked list.
///
/// The `CellKey` is the key that unlocks the cells containing the head and
/// the links (for the kernel's lists, the CPU Lock token).
#[derive(Debug)]
pub struct ListAccessorCell<'a, HeadCell, Pool, MapLink, CellKey> {
    head: HeadCell,
    pool: &'a Pool,
    map_link: MapLink,
    cell_key: CellKey,
}

impl<'a, HeadCell, Index, Pool, MapLink, Element, LinkCell, CellKey>
    ListAccessorCell<'a, HeadCell, Pool, MapLink, CellKey>
where
    HeadCell: CellLike<CellKey, Target = ListHead<Index>>,
    Pool: ops::Index<Index, Output = Element>,
    MapLink: Fn(&Element) -> &LinkCell,
    LinkCell: CellLike<CellKey, Target = Option<Link<Index>>>,
    Index: PartialEq + Clone,
{
    pub fn new(head: HeadCell, pool: &'a Pool, map_link: MapLink, cell_key: CellKey) -> Self {
        ListAccessorCell {
            head,
            pool,
            map_link,
            cell_key,
        }
    }

    pub fn head(&self) -> ListHead<Index> {
        self.head.get(&self.cell_key)
    }

    pub fn set_head(&mut self, head: ListHead<Index>) {
        self.head.set(&mut self.cell_key, head);
    }

    pub fn pool(&self) -> &Pool {
        self.pool
    }

    pub fn cell_key(&self) -> &CellKey {
        &self.cell_key
    }

    pub fn is_empty(&self) -> bool {
        self.head().is_empty()
    }

    #[inline]
    pub fn front(&self) -> Option<Index> {
        self.head().first
    }

    #[inline]
    pub fn back(&self) -> Option<Index> {
        self.head().first.map(|p| {
            let link = (self.map_link)(&self.pool[p]).get(&self.cell_key);
            match link {
                Some(link) => link.prev,
                None => corrupted(),
            }
        })
    }

    #[inline]
    pub fn front_data(&self) -> Option<&Element> {
        self.front().map(|p| &self.pool[p])
    }

    /// Get the link cell of `i`, panicking if `i` is not linked.
    #[inline]
    fn link_of(&self, i: Index) -> Link<Index> {
        match (self.map_link)(&self.pool[i]).get(&self.cell_key) {
            Some(link) => link,
            None => corrupted(),
        }
    }

    /// Insert `item` before the position `p` (if `at` is `Some(p)`) or at the
    /// list's back (if `at` is `None`).
    pub fn insert(&mut self, item: Index, at: Option<Index>) -> Result<(), InsertError> {
        if (self.map_link)(&self.pool[item.clone()])
            .get(&self.cell_key)
            .is_some()
        {
            return Err(InsertError::AlreadyLinked);
        }

        let mut head = self.head();

        if let Some(first) = head.first {
            let (next, update_first) = if let Some(at) = at {
                let update_first = at == first;
                (at, update_first)
            } else {
                (first, false)
            };

            let prev = self.link_of(next.clone()).prev;

            // prev.next = item
            (self.map_link)(&self.pool[prev.clone()]).modify(&mut self.cell_key, |l| match l {
                Some(l) => l.next = item.clone(),
                None => corrupted(),
            });

            // next.prev = item
            (self.map_link)(&self.pool[next.clone()]).modify(&mut self.cell_key, |l| match l {
                Some(l) => l.prev = item.clone(),
                None => corrupted(),
            });

            // item.prev = prev; item.next = next
            (self.map_link)(&self.pool[item.clone()])
                .set(&mut self.cell_key, Some(Link { prev, next }));

            if update_first {
                head.first = Some(item);
                self.set_head(head);
            }
        } else {
            debug_assert!(at.is_none());

            let link = (self.map_link)(&self.pool[item.clone()]);
            link.set(
                &mut self.cell_key,
                Some(Link {
                    prev: item.clone(),
                    next: item.clone(),
                }),
            );

            head.first = Some(item);
            self.set_head(head);
        }

        Ok(())
    }

    #[inline]
    pub fn push_back(&mut self, item: Index) -> Result<(), InsertError> {
        self.insert(item, None)
    }

    #[inline]
    pub fn push_front(&mut self, item: Index) -> Result<(), InsertError> {
        let at = self.front();
        self.insert(item, at)
    }

    /// Remove `item` from the list. Returns `item`.
    pub fn remove(&mut self, item: Index) -> Result<Index, ItemError> {
        if (self.map_link)(&self.pool[item.clone()])
            .get(&self.cell_key)
            .is_none()
        {
            return Err(ItemError::NotLinked);
        }

        let link = {
            let mut head = self.head();
            if head.first.as_ref() == Some(&item) {
                let next = self.link_of(item.clone()).next;

                if next == item {
                    // The list just became empty
                    head.first = None;
                    self.set_head(head);

                    (self.map_link)(&self.pool[item.clone()]).set(&mut self.cell_key, None);
                    return Ok(item);
                }

                // Move the head pointer
                head.first = Some(next);
                self.set_head(head);
            }

            self.link_of(item.clone())
        };

        // link.prev.next = link.next
        (self.map_link)(&self.pool[link.prev.clone()]).modify(&mut self.cell_key, |l| match l {
            Some(l) => l.next = link.next.clone(),
            None => corrupted(),
        });

        // link.next.prev = link.prev
        (self.map_link)(&self.pool[link.next.clone()]).modify(&mut self.cell_key, |l| match l {
            Some(l) => l.prev = link.prev.clone(),
            None => corrupted(),
        });

        // item.prev = null; item.next = null
        (self.map_link)(&self.pool[item.clone()]).set(&mut self.cell_key, None);

        Ok(item)
    }

    #[inline]
    pub fn pop_front(&mut self) -> Option<Index> {
        self.front().map(|item| match self.remove(item) {
            Ok(item) => item,
            Err(ItemError::NotLinked) => corrupted(),
        })
    }

    /// Get the next element of the specified element, panicking if `i` is not
    /// linked.
    #[inline]
    pub fn next(&self, i: Index) -> Option<Index> {
        let next = self.link_of(i).next;
        if Some(&next) == self.head().first.as_ref() {
            None
        } else {
            Some(next)
        }
    }

    /// Get the previous element of the specified element, panicking if `i` is
    /// not linked.
    #[inline]
    pub fn prev(&self, i: Index) -> Option<Index> {
        if Some(&i) == self.head().first.as_ref() {
            None
        } else {
            Some(self.link_of(i).prev)
        }
    }

    pub fn iter(&self) -> Iter<&Self, Index> {
        Iter {
            next: self.head().first,
            accessor: self,
        }
    }
}

/// An iterator over the elements of `ListAccessorCell`.
#[derive(Debug)]
pub struct Iter<Accessor, Index> {
    accessor: Accessor,
    next: Option<Index>,
}

impl<'a, 'b, HeadCell, Index, Pool, MapLink, Element, LinkCell, CellKey> Iterator
    for Iter<&'b ListAccessorCell<'a, HeadCell, Pool, MapLink, CellKey>, Index>
where
    HeadCell: CellLike<CellKey, Target = ListHead<Index>>,
    Pool: ops::Index<Index, Output = Element>,
    MapLink: 'a + Fn(&Element) -> &LinkCell,
    Element: 'a + 'b,
    LinkCell: CellLike<CellKey, Target = Option<Link<Index>>>,
    Index: PartialEq + Clone,
{
    type Item = (Index, &'a Element);

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(next) = self.next.take() {
            self.next = self.accessor.next(next.clone());
            Some((next.clone(), &self.accessor.pool[next]))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn push<Element>(this: &mut Vec<Element>, x: Element) -> usize {
        let i = this.len();
        this.push(x);
        i
    }

    #[test]
    fn basic_cell() {
        let mut pool = Vec::new();
        let head = Cell::new(ListHead::new());

        macro_rules! get_accessor {
            () => {
                ListAccessorCell::new(&head, &pool, |(_, link): &(u32, _)| link, ())
            };
        }

        let ptr1 = push(&mut pool, (1, Cell::new(None)));
        get_accessor!().push_back(ptr1).unwrap();

        let ptr2 = push(&mut pool, (2, Cell::new(None)));
        get_accessor!().push_back(ptr2).unwrap();

        let ptr3 = push(&mut pool, (3, Cell::new(None)));
        get_accessor!().push_front(ptr3).unwrap();

        let mut accessor = get_accessor!();
        assert!(!accessor.is_empty());
        assert_eq!(accessor.front(), Some(ptr3));
        assert_eq!(accessor.back(), Some(ptr2));
        assert_eq!(accessor.front_data().unwrap().0, 3);

        let items: Vec<_> = accessor.iter().map(|(_, (x, _))| *x).collect();
        assert_eq!(items, vec![3, 1, 2]);

        assert_eq!(accessor.next(ptr3), Some(ptr1));
        assert_eq!(accessor.next(ptr1), Some(ptr2));
        assert_eq!(accessor.next(ptr2), None);
        assert_eq!(accessor.prev(ptr3), None);
        assert_eq!(accessor.prev(ptr1), Some(ptr3));
        assert_eq!(accessor.prev(ptr2), Some(ptr1));

        accessor.remove(ptr1).unwrap();
        accessor.remove(ptr2).unwrap();
        accessor.remove(ptr3).unwrap();

        assert!(accessor.is_empty());
    }

    #[test]
    fn insert_at() {
        let mut pool = Vec::new();
        let head = Cell::new(ListHead::new());

        macro_rules! get_accessor {
            () => {
                ListAccessorCell::new(&head, &pool, |(_, link): &(u32, _)| link, ())
            };
        }

        let ptr1 = push(&mut pool, (1, Cell::new(None)));
        let ptr2 = push(&mut pool, (2, Cell::new(None)));
        let ptr3 = push(&mut pool, (3, Cell::new(None)));

        get_accessor!().push_back(ptr1).unwrap();
        get_accessor!().push_back(ptr3).unwrap();

        // Insert before `ptr3`
        get_accessor!().insert(ptr2, Some(ptr3)).unwrap();

        let accessor = get_accessor!();
        let items: Vec<_> = accessor.iter().map(|(_, (x, _))| *x).collect();
        assert_eq!(items, vec![1, 2, 3]);

        assert!(matches!(
            get_accessor!().insert(ptr2, None),
            Err(InsertError::AlreadyLinked)
        ));
    }

    #[test]
    fn drain_pop_front() {
        let mut pool = Vec::new();
        let head = Cell::new(ListHead::new());

        macro_rules! get_accessor {
            () => {
                ListAccessorCell::new(&head, &pool, |(_, link): &(u32, _)| link, ())
            };
        }

        let ptrs = [
            push(&mut pool, (1, Cell::new(None))),
            push(&mut pool, (2, Cell::new(None))),
            push(&mut pool, (3, Cell::new(None))),
        ];

        for &p in &ptrs {
            get_accessor!().push_back(p).unwrap();
        }

        while get_accessor!().pop_front().is_some() {}

        assert_eq!(head.get().first, None);
        for &ptr in &ptrs {
            assert!(pool[ptr].1.get().is_none());
        }
    }
}
