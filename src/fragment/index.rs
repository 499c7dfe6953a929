//! Per-replica index of a journal's fragments.
//!
//! The index orders committed and persisted fragments by offset, answers
//! point queries ("which fragment covers this offset"), and signals
//! write-head advances so blocking reads can wait for content. Entries
//! covering unpersisted content carry a shared handle onto the spool's
//! backing file; persisted-only entries are read through their store.

use std::fs::File;
use std::sync::{Arc, RwLock};

use tokio::sync::watch;

use super::Fragment;
use crate::types::Journal;

/// An indexed fragment and, for locally-spooled content, the file holding
/// its bytes.
#[derive(Clone, Debug)]
pub struct IndexedFragment {
    pub fragment: Fragment,
    pub file: Option<Arc<File>>,
}

pub struct FragmentIndex {
    journal: Journal,
    /// Fragments sorted by (begin, end).
    fragments: RwLock<Vec<IndexedFragment>>,
    /// Broadcast of the current end offset.
    end_signal: watch::Sender<i64>,
}

impl FragmentIndex {
    pub fn new(journal: Journal) -> FragmentIndex {
        let (end_signal, _) = watch::channel(0);
        FragmentIndex {
            journal,
            fragments: RwLock::new(Vec::new()),
            end_signal,
        }
    }

    #[inline]
    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// The journal write head: one past the last indexed byte.
    pub fn end_offset(&self) -> i64 {
        *self.end_signal.borrow()
    }

    /// Add or update `fragment`. A fragment sharing a begin offset with an
    /// indexed one replaces it when it covers at least as much content
    /// (the open spool fragment grows in place as commits land).
    pub fn add(&self, fragment: Fragment, file: Option<Arc<File>>) {
        if fragment.content_length() == 0 {
            return;
        }
        let entry = IndexedFragment { fragment, file };
        let mut fragments = match self.fragments.write() {
            Ok(f) => f,
            Err(poisoned) => poisoned.into_inner(),
        };
        match fragments.binary_search_by(|f| f.fragment.begin.cmp(&entry.fragment.begin)) {
            Ok(i) => {
                if fragments[i].fragment.end <= entry.fragment.end {
                    fragments[i] = entry;
                }
            }
            Err(i) => fragments.insert(i, entry),
        }
        let end = fragments.iter().map(|f| f.fragment.end).max().unwrap_or(0);
        drop(fragments);

        self.end_signal.send_if_modified(|cur| {
            if end > *cur {
                *cur = end;
                true
            } else {
                false
            }
        });
    }

    /// The fragment covering `offset`, or the next fragment past it. The
    /// returned offset is `offset`, advanced to the fragment's begin when
    /// the requested offset sits in a gap. Offset -1 queries the write
    /// head.
    pub fn query(&self, offset: i64) -> Option<(IndexedFragment, i64)> {
        let offset = if offset == -1 {
            self.end_offset()
        } else {
            offset
        };
        let fragments = match self.fragments.read() {
            Ok(f) => f,
            Err(poisoned) => poisoned.into_inner(),
        };
        for f in fragments.iter() {
            if f.fragment.end > offset {
                return Some((f.clone(), offset.max(f.fragment.begin)));
            }
        }
        None
    }

    /// Wait until the end offset exceeds `offset`.
    pub async fn await_beyond(&self, offset: i64) -> i64 {
        let mut rx = self.end_signal.subscribe();
        loop {
            let cur = *rx.borrow_and_update();
            if cur > offset {
                return cur;
            }
            if rx.changed().await.is_err() {
                return cur;
            }
        }
    }
}
