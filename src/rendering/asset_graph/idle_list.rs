use std::collections::HashMap;

use portalview_files::ObjectId;

#[derive(Debug, Copy, Clone, Default)]
struct Links {
    prev: Option<ObjectId>,
    next: Option<ObjectId>,
}

/// Intrusive doubly linked list of ids, keyed by the id itself: O(1) append, removal from anywhere
/// and popping the oldest entry. Each id is contained at most once.
#[derive(Debug, Default)]
pub struct IdleList {
    links: HashMap<ObjectId, Links>,
    head: Option<ObjectId>,
    tail: Option<ObjectId>,
}

impl IdleList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.links.contains_key(&id)
    }

    pub fn front(&self) -> Option<ObjectId> {
        self.head
    }

    /// Appends `id` as the newest entry, moving it there if it already was contained.
    pub fn push_back(&mut self, id: ObjectId) {
        self.remove(id);

        let links = Links {
            prev: self.tail,
            next: None,
        };
        match self.tail {
            Some(tail) => self.link_mut(tail).next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        self.links.insert(id, links);
    }

    pub fn remove(&mut self, id: ObjectId) -> bool {
        let Some(links) = self.links.remove(&id) else {
            return false;
        };

        match links.prev {
            Some(prev) => self.link_mut(prev).next = links.next,
            None => self.head = links.next,
        }
        match links.next {
            Some(next) => self.link_mut(next).prev = links.prev,
            None => self.tail = links.prev,
        }
        true
    }

    pub fn pop_front(&mut self) -> Option<ObjectId> {
        let head = self.head?;
        self.remove(head);
        Some(head)
    }

    pub fn clear(&mut self) {
        self.links.clear();
        self.head = None;
        self.tail = None;
    }

    /// Oldest first
    pub fn iter(&self) -> impl Iterator<Item = ObjectId> + '_ {
        std::iter::successors(self.head, |id| self.links.get(id).and_then(|links| links.next))
    }

    fn link_mut(&mut self, id: ObjectId) -> &mut Links {
        // Neighbours are always linked, anything else is a bug in this list.
        self.links
            .get_mut(&id)
            .unwrap_or_else(|| panic!("IdleList: {id} is linked but not contained"))
    }
}
