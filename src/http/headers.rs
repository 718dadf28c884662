//! Received-header bookkeeping.
//!
//! Every parsed (kind, name, value) triple is appended to one flat list in
//! arrival order.  Names and values live in the connection pool; entries
//! hold region handles, not owned strings.  Duplicates are legal and keep
//! their order; `Connection:` token scans have to see all of them.

use crate::pool::{MemPool, Region};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HeaderKind {
    /// Ordinary request header.
    Header,
    /// One cookie, split out of a `Cookie:` header.
    Cookie,
    /// Trailer received after a chunked upload.
    Footer,
    /// Header attached to a queued response.
    ResponseHeader,
    /// Decoded query-string argument.
    GetArgument,
    /// Decoded form field (populated by host-side post processors).
    PostData,
}

pub(crate) struct HeaderEntry {
    pub kind: HeaderKind,
    pub name: Region,
    pub value: Region,
}

#[derive(Default)]
pub(crate) struct HeaderList {
    entries: Vec<HeaderEntry>,
}

impl HeaderList {
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn push(&mut self, kind: HeaderKind, name: Region, value: Region) {
        self.entries.push(HeaderEntry { kind, name, value });
    }

    pub fn iter(&self) -> impl Iterator<Item = &HeaderEntry> {
        self.entries.iter()
    }

    /// First value for `name` within `kind`, case-insensitive on the name.
    pub fn lookup<'p>(&self, pool: &'p MemPool, kind: HeaderKind, name: &str) -> Option<&'p str> {
        self.entries
            .iter()
            .find(|e| e.kind == kind && pool.str_of(e.name).eq_ignore_ascii_case(name))
            .map(|e| pool.str_of(e.value))
    }

    /// True when any value for `name` carries `token` in its comma list.
    pub fn any_token(&self, pool: &MemPool, kind: HeaderKind, name: &str, token: &str) -> bool {
        self.entries
            .iter()
            .filter(|e| e.kind == kind && pool.str_of(e.name).eq_ignore_ascii_case(name))
            .any(|e| has_token(pool.str_of(e.value), token))
    }

    pub fn count(&self, kind: HeaderKind) -> usize {
        self.entries.iter().filter(|e| e.kind == kind).count()
    }
}

/// Comma-list membership test, case-insensitive, whitespace-tolerant.
pub(crate) fn has_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|part| part.trim().eq_ignore_ascii_case(token))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(pool: &mut MemPool, s: &str) -> Region {
        pool.store(s.as_bytes()).unwrap()
    }

    #[test]
    fn lookup_is_case_insensitive_and_ordered() {
        let mut pool = MemPool::new(256);
        let mut list = HeaderList::default();
        let n1 = store(&mut pool, "Accept");
        let v1 = store(&mut pool, "text/html");
        let n2 = store(&mut pool, "accept");
        let v2 = store(&mut pool, "*/*");
        list.push(HeaderKind::Header, n1, v1);
        list.push(HeaderKind::Header, n2, v2);

        assert_eq!(list.lookup(&pool, HeaderKind::Header, "ACCEPT"), Some("text/html"));
        assert_eq!(list.count(HeaderKind::Header), 2);
        assert_eq!(list.lookup(&pool, HeaderKind::Cookie, "accept"), None);
    }

    #[test]
    fn token_scan_sees_every_duplicate() {
        let mut pool = MemPool::new(256);
        let mut list = HeaderList::default();
        let n1 = store(&mut pool, "Connection");
        let v1 = store(&mut pool, "keep-alive");
        let n2 = store(&mut pool, "Connection");
        let v2 = store(&mut pool, "foo, Close");
        list.push(HeaderKind::Header, n1, v1);
        list.push(HeaderKind::Header, n2, v2);

        assert!(list.any_token(&pool, HeaderKind::Header, "connection", "close"));
        assert!(list.any_token(&pool, HeaderKind::Header, "connection", "keep-alive"));
        assert!(!list.any_token(&pool, HeaderKind::Header, "connection", "upgrade"));
    }

    #[test]
    fn has_token_trims_and_ignores_case() {
        assert!(has_token("Keep-Alive , close", "CLOSE"));
        assert!(!has_token("closed", "close"));
        assert!(!has_token("", "close"));
    }
}
