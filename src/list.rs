//! # Task Lists
//!
//! Minimal intrusive singly linked list (forward only) used for both the run
//! queue and the timer queue. Nothing is allocated: the list only holds a head
//! and a tail [`TaskId`], and the `next` links live in the arena slots
//! themselves, reached through the [`Links`] trait.
//!
//! A task owns exactly one [`Link`], so it can be a member of one list at a
//! time. Inserting a task that is already linked is a bug; debug builds catch
//! it.

use crate::task::TaskId;

/// The link cell embedded in every arena slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Link {
    next: Option<TaskId>,
    linked: bool,
}

impl Link {
    pub const UNLINKED: Link = Link {
        next: None,
        linked: false,
    };

    /// Whether this cell is currently threaded into some list.
    #[inline]
    pub const fn is_linked(&self) -> bool {
        self.linked
    }
}

/// Access to the link cells of an arena, indexed by [`TaskId`].
pub trait Links {
    fn link(&self, id: TaskId) -> &Link;
    fn link_mut(&mut self, id: TaskId) -> &mut Link;
}

impl Links for [Link] {
    fn link(&self, id: TaskId) -> &Link {
        &self[id.index()]
    }

    fn link_mut(&mut self, id: TaskId) -> &mut Link {
        &mut self[id.index()]
    }
}

/// Head and tail of an intrusive list of tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskList {
    head: Option<TaskId>,
    tail: Option<TaskId>,
}

impl Default for TaskList {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskList {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self.head {
            None => {
                assert!(self.tail.is_none(), "list has a tail but no head");
                true
            }
            Some(_) => {
                assert!(self.tail.is_some(), "list has a head but no tail");
                false
            }
        }
    }

    #[inline]
    pub fn peek_front(&self) -> Option<TaskId> {
        self.head
    }

    #[inline]
    pub fn peek_back(&self) -> Option<TaskId> {
        self.tail
    }

    pub fn push_back<L: Links + ?Sized>(&mut self, links: &mut L, id: TaskId) {
        Self::claim(links, id);
        match self.tail {
            None => {
                debug_assert!(self.head.is_none());
                self.head = Some(id);
            }
            Some(tail) => links.link_mut(tail).next = Some(id),
        }
        self.tail = Some(id);
    }

    pub fn push_front<L: Links + ?Sized>(&mut self, links: &mut L, id: TaskId) {
        Self::claim(links, id);
        links.link_mut(id).next = self.head;
        if self.tail.is_none() {
            self.tail = Some(id);
        }
        self.head = Some(id);
    }

    pub fn pop_front<L: Links + ?Sized>(&mut self, links: &mut L) -> Option<TaskId> {
        let id = self.head?;
        let link = links.link_mut(id);
        self.head = link.next;
        *link = Link::UNLINKED;
        if self.head.is_none() {
            self.tail = None;
        }
        Some(id)
    }

    /// Unlinks `id` by scanning from the head. Returns whether it was found;
    /// a task that is not in this list is left alone.
    pub fn remove<L: Links + ?Sized>(&mut self, links: &mut L, id: TaskId) -> bool {
        let mut prev: Option<TaskId> = None;
        let mut cursor = self.head;
        while let Some(cur) = cursor {
            let next = links.link(cur).next;
            if cur == id {
                match prev {
                    None => self.head = next,
                    Some(p) => links.link_mut(p).next = next,
                }
                if self.tail == Some(id) {
                    self.tail = prev;
                }
                *links.link_mut(id) = Link::UNLINKED;
                return true;
            }
            prev = cursor;
            cursor = next;
        }
        false
    }

    /// Inserts `id` before the first element whose key is not less than its
    /// own, so a new element goes ahead of existing elements with an equal
    /// key.
    pub fn sorted_insert<L, K, F>(&mut self, links: &mut L, id: TaskId, key: F)
    where
        L: Links + ?Sized,
        K: Ord,
        F: Fn(&L, TaskId) -> K,
    {
        let new_key = key(links, id);
        let mut prev: Option<TaskId> = None;
        let mut cursor = self.head;
        while let Some(cur) = cursor {
            if new_key <= key(links, cur) {
                break;
            }
            prev = cursor;
            cursor = links.link(cur).next;
        }

        match prev {
            None => self.push_front(links, id),
            Some(p) if cursor.is_none() => {
                debug_assert_eq!(self.tail, Some(p));
                self.push_back(links, id);
            }
            Some(p) => {
                Self::claim(links, id);
                links.link_mut(id).next = cursor;
                links.link_mut(p).next = Some(id);
            }
        }
    }

    pub fn iter<'a, L: Links + ?Sized>(&self, links: &'a L) -> Iter<'a, L> {
        Iter {
            links,
            cursor: self.head,
        }
    }

    pub fn len<L: Links + ?Sized>(&self, links: &L) -> usize {
        self.iter(links).count()
    }

    pub fn contains<L: Links + ?Sized>(&self, links: &L, id: TaskId) -> bool {
        self.iter(links).any(|t| t == id)
    }

    fn claim<L: Links + ?Sized>(links: &mut L, id: TaskId) {
        let link = links.link_mut(id);
        debug_assert!(!link.linked, "task {} is already in a list", id);
        link.linked = true;
        link.next = None;
    }
}

/// Front-to-back iterator over a [`TaskList`].
pub struct Iter<'a, L: ?Sized> {
    links: &'a L,
    cursor: Option<TaskId>,
}

impl<'a, L: Links + ?Sized> Iterator for Iter<'a, L> {
    type Item = TaskId;

    fn next(&mut self) -> Option<TaskId> {
        let cur = self.cursor?;
        self.cursor = self.links.link(cur).next;
        Some(cur)
    }
}
