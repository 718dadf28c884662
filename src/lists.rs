//! Index-based intrusive lists.
//!
//! The daemon owns a slab of connections; list membership is expressed as
//! prev/next indices embedded in each connection, one pair per membership
//! domain.  Moving a connection between lists is O(1) and allocation-free,
//! which matters because every read and write bumps the timeout list.

use slab::Slab;

/// Independent membership domains.  A connection carries one [`Links`] pair
/// per domain and can sit in at most one list of each domain at a time.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Domain {
    /// IO state: exactly one of normal / suspended / cleanup.
    Io,
    /// Timeout ordering: default-timeout or custom-timeout list.
    Timeout,
    /// FIFO of connections with undrained readiness.
    Ready,
}

#[derive(Clone, Copy, Default, Debug)]
pub(crate) struct Links {
    pub prev: Option<usize>,
    pub next: Option<usize>,
}

pub(crate) trait HasLinks {
    fn links(&self, domain: Domain) -> &Links;
    fn links_mut(&mut self, domain: Domain) -> &mut Links;
}

#[derive(Debug)]
pub(crate) struct DList {
    domain: Domain,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl DList {
    pub fn new(domain: Domain) -> DList {
        DList {
            domain,
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn head(&self) -> Option<usize> {
        self.head
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append `key` at the tail.  The key must not currently be in any list
    /// of this domain.
    pub fn push_tail<T: HasLinks>(&mut self, slab: &mut Slab<T>, key: usize) {
        {
            let links = slab[key].links_mut(self.domain);
            links.prev = self.tail;
            links.next = None;
        }
        match self.tail {
            Some(old) => slab[old].links_mut(self.domain).next = Some(key),
            None => self.head = Some(key),
        }
        self.tail = Some(key);
        self.len += 1;
    }

    /// Remove `key` from this list.  The key must be a current member.
    pub fn unlink<T: HasLinks>(&mut self, slab: &mut Slab<T>, key: usize) {
        let Links { prev, next } = *slab[key].links(self.domain);
        match prev {
            Some(p) => slab[p].links_mut(self.domain).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => slab[n].links_mut(self.domain).prev = prev,
            None => self.tail = prev,
        }
        let links = slab[key].links_mut(self.domain);
        links.prev = None;
        links.next = None;
        self.len -= 1;
    }

    /// Activity bump: re-append at the tail so the head stays the oldest.
    pub fn move_to_tail<T: HasLinks>(&mut self, slab: &mut Slab<T>, key: usize) {
        if self.tail == Some(key) {
            return;
        }
        self.unlink(slab, key);
        self.push_tail(slab, key);
    }

    pub fn pop_head<T: HasLinks>(&mut self, slab: &mut Slab<T>) -> Option<usize> {
        let key = self.head?;
        self.unlink(slab, key);
        Some(key)
    }

    /// Snapshot of the member keys, head first.  Used where the walk itself
    /// mutates membership.
    pub fn keys<T: HasLinks>(&self, slab: &Slab<T>) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.len);
        let mut cur = self.head;
        while let Some(key) = cur {
            out.push(key);
            cur = slab[key].links(self.domain).next;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Node {
        io: Links,
        to: Links,
    }

    impl HasLinks for Node {
        fn links(&self, domain: Domain) -> &Links {
            match domain {
                Domain::Io => &self.io,
                _ => &self.to,
            }
        }
        fn links_mut(&mut self, domain: Domain) -> &mut Links {
            match domain {
                Domain::Io => &mut self.io,
                _ => &mut self.to,
            }
        }
    }

    #[test]
    fn fifo_order_and_unlink() {
        let mut slab = Slab::new();
        let a = slab.insert(Node::default());
        let b = slab.insert(Node::default());
        let c = slab.insert(Node::default());

        let mut list = DList::new(Domain::Io);
        list.push_tail(&mut slab, a);
        list.push_tail(&mut slab, b);
        list.push_tail(&mut slab, c);
        assert_eq!(list.keys(&slab), vec![a, b, c]);

        list.unlink(&mut slab, b);
        assert_eq!(list.keys(&slab), vec![a, c]);
        assert_eq!(list.len(), 2);

        assert_eq!(list.pop_head(&mut slab), Some(a));
        assert_eq!(list.pop_head(&mut slab), Some(c));
        assert_eq!(list.pop_head(&mut slab), None);
        assert!(list.is_empty());
    }

    #[test]
    fn move_to_tail_keeps_oldest_at_head() {
        let mut slab = Slab::new();
        let a = slab.insert(Node::default());
        let b = slab.insert(Node::default());

        let mut list = DList::new(Domain::Timeout);
        list.push_tail(&mut slab, a);
        list.push_tail(&mut slab, b);
        list.move_to_tail(&mut slab, a);
        assert_eq!(list.keys(&slab), vec![b, a]);
        // a is already the tail; must be a no-op
        list.move_to_tail(&mut slab, a);
        assert_eq!(list.keys(&slab), vec![b, a]);
    }

    #[test]
    fn domains_are_independent() {
        let mut slab = Slab::new();
        let a = slab.insert(Node::default());
        let mut io = DList::new(Domain::Io);
        let mut to = DList::new(Domain::Timeout);
        io.push_tail(&mut slab, a);
        to.push_tail(&mut slab, a);
        io.unlink(&mut slab, a);
        assert_eq!(to.keys(&slab), vec![a]);
    }
}
