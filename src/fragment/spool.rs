//! Spool: the open, mutable fragment at the write head of a replica.
//!
//! A spool owns a committed fragment `[begin, end)`, a backing temp file,
//! and `delta` bytes of streamed content not yet covered by a committed
//! proposal. Two rolling SHA-1 states track the digest through `end`
//! (committed) and through `end + delta` (live); commits promote the live
//! state, rollbacks restore the committed one.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::Arc;

use bytes::Bytes;
use sha1::{Digest, Sha1};

use super::{Fragment, Sum};
use crate::error::{Error, Result};
use crate::types::Journal;

/// Outcome of applying a fragment proposal to a spool.
#[derive(Debug)]
pub enum ProposalOutcome {
    /// The proposal matched the spool's computed next fragment (or its
    /// current one); streamed content through the proposal end is now
    /// committed.
    Committed,
    /// The proposal equaled the committed fragment; streamed content was
    /// discarded.
    RolledBack,
    /// The proposal began a new fragment. The prior spool is returned
    /// sealed, for persistence, when it holds any content.
    Rolled(Option<Spool>),
    /// The proposal is inconsistent with the spool.
    Mismatch,
}

pub struct Spool {
    /// The committed fragment. Content in `[begin, end)` is immutable.
    pub fragment: Fragment,
    /// Backing file, shared with index entries serving reads of the
    /// committed range.
    file: Arc<File>,
    /// Streamed bytes beyond `end`, not yet committed.
    delta: i64,
    committed_digest: Sha1,
    live_digest: Sha1,
}

impl Spool {
    /// Open an empty spool of `journal` at byte offset `begin`.
    pub fn new(journal: Journal, begin: i64) -> Result<Spool> {
        let mut fragment = Fragment::zero(journal);
        fragment.begin = begin;
        fragment.end = begin;
        Ok(Spool {
            fragment,
            file: Arc::new(tempfile::tempfile()?),
            delta: 0,
            committed_digest: Sha1::new(),
            live_digest: Sha1::new(),
        })
    }

    /// Shared handle onto the backing file, for index entries.
    pub fn shared_file(&self) -> Arc<File> {
        self.file.clone()
    }

    /// Uncommitted streamed bytes.
    #[inline]
    pub fn delta(&self) -> i64 {
        self.delta
    }

    /// The candidate fragment which would commit all streamed content.
    pub fn next(&self) -> Fragment {
        let mut next = self.fragment.clone();
        next.end += self.delta;
        next.sum = if next.content_length() == 0 {
            Sum::ZERO
        } else {
            Sum::from_digest(self.live_digest.clone())
        };
        next
    }

    /// Spool streamed content. `content_delta` must equal the bytes
    /// already streamed since the last commit.
    pub fn apply_content(&mut self, content: &[u8], content_delta: i64) -> Result<()> {
        if content_delta != self.delta {
            return Err(Error::Validation(format!(
                "invalid ContentDelta ({}; expected {})",
                content_delta, self.delta
            )));
        }
        let at = (self.fragment.content_length() + self.delta) as u64;
        self.file.write_all_at(content, at)?;
        self.live_digest.update(content);
        self.delta += content.len() as i64;
        Ok(())
    }

    /// Apply a fragment proposal: commit, roll back, roll forward, or
    /// reject it.
    pub fn apply_proposal(&mut self, proposal: &Fragment) -> Result<ProposalOutcome> {
        if proposal.journal != self.fragment.journal {
            return Err(Error::Validation(format!(
                "proposal journal mismatch ({} vs {})",
                proposal.journal, self.fragment.journal
            )));
        }

        // Committing: the proposal covers the spool range plus all (or a
        // prefix of none) streamed content, with a matching digest.
        let next = self.next();
        if *proposal == next {
            self.fragment = next;
            self.committed_digest = self.live_digest.clone();
            self.delta = 0;
            return Ok(ProposalOutcome::Committed);
        }

        // Rolling back: the proposal is exactly the committed fragment.
        if *proposal == self.fragment {
            if self.delta != 0 {
                self.file.set_len(self.fragment.content_length() as u64)?;
                self.live_digest = self.committed_digest.clone();
                self.delta = 0;
                return Ok(ProposalOutcome::RolledBack);
            }
            return Ok(ProposalOutcome::Committed);
        }

        // Rolling forward: an empty proposal at or beyond our end starts
        // a new fragment, sealing the current spool for persistence.
        if proposal.content_length() == 0 && proposal.begin >= self.fragment.end {
            let mut fragment = Fragment::zero(self.fragment.journal.clone());
            fragment.begin = proposal.begin;
            fragment.end = proposal.begin;
            fragment.compression_codec = proposal.compression_codec;
            fragment.backing_store = proposal.backing_store.clone();

            let sealed = std::mem::replace(
                self,
                Spool {
                    fragment,
                    file: Arc::new(tempfile::tempfile()?),
                    delta: 0,
                    committed_digest: Sha1::new(),
                    live_digest: Sha1::new(),
                },
            );
            // Only a spool holding committed content persists.
            if sealed.fragment.content_length() != 0 {
                return Ok(ProposalOutcome::Rolled(Some(sealed)));
            }
            return Ok(ProposalOutcome::Rolled(None));
        }

        Ok(ProposalOutcome::Mismatch)
    }

    /// Read committed content at journal byte `offset` into `buf`,
    /// returning the bytes read.
    pub fn read_at(&self, offset: i64, buf: &mut [u8]) -> Result<usize> {
        if offset < self.fragment.begin || offset >= self.fragment.end {
            return Err(Error::Validation(format!(
                "offset {} outside spool range [{}, {})",
                offset, self.fragment.begin, self.fragment.end
            )));
        }
        let available = (self.fragment.end - offset) as usize;
        let n = buf.len().min(available);
        self.file
            .read_exact_at(&mut buf[..n], (offset - self.fragment.begin) as u64)?;
        Ok(n)
    }

    /// The spool's complete committed content, for persistence.
    pub fn committed_content(&self) -> Result<Bytes> {
        let mut buf = vec![0u8; self.fragment.content_length() as usize];
        self.file.read_exact_at(&mut buf, 0)?;
        Ok(Bytes::from(buf))
    }
}

impl std::fmt::Debug for Spool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Spool")
            .field("fragment", &self.fragment)
            .field("delta", &self.delta)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spool() -> Spool {
        Spool::new(Journal::from("a/journal"), 0).unwrap()
    }

    #[test]
    fn stream_and_commit() {
        let mut s = spool();
        s.apply_content(b"foobar", 0).unwrap();
        s.apply_content(b"bazbing", 6).unwrap();
        assert_eq!(s.delta(), 13);

        let next = s.next();
        assert_eq!(next.begin, 0);
        assert_eq!(next.end, 13);
        assert_eq!(next.sum, Sum::of(b"foobarbazbing"));

        assert!(matches!(
            s.apply_proposal(&next).unwrap(),
            ProposalOutcome::Committed
        ));
        assert_eq!(s.fragment.end, 13);
        assert_eq!(s.delta(), 0);

        let mut buf = [0u8; 13];
        assert_eq!(s.read_at(0, &mut buf).unwrap(), 13);
        assert_eq!(&buf, b"foobarbazbing");
    }

    #[test]
    fn content_delta_mismatch_rejected() {
        let mut s = spool();
        s.apply_content(b"abc", 0).unwrap();
        assert!(s.apply_content(b"def", 5).is_err());
        // The spool is unchanged by the rejected write.
        assert_eq!(s.delta(), 3);
    }

    #[test]
    fn rollback_discards_streamed_content() {
        let mut s = spool();
        s.apply_content(b"foobar", 0).unwrap();
        s.apply_proposal(&s.next()).unwrap();

        // Stream more, then roll back to the committed fragment.
        s.apply_content(b"junk", 0).unwrap();
        let committed = s.fragment.clone();
        assert!(matches!(
            s.apply_proposal(&committed).unwrap(),
            ProposalOutcome::RolledBack
        ));
        assert_eq!(s.delta(), 0);
        assert_eq!(s.fragment.end, 6);

        // A subsequent append digests as though the junk never happened.
        s.apply_content(b"bazbing", 0).unwrap();
        let next = s.next();
        assert_eq!(next.end, 13);
        assert_eq!(next.sum, Sum::of(b"foobarbazbing"));
        assert!(matches!(
            s.apply_proposal(&next).unwrap(),
            ProposalOutcome::Committed
        ));
    }

    #[test]
    fn rollback_of_clean_spool_is_commit() {
        let mut s = spool();
        s.apply_content(b"foobar", 0).unwrap();
        s.apply_proposal(&s.next()).unwrap();

        let committed = s.fragment.clone();
        assert!(matches!(
            s.apply_proposal(&committed).unwrap(),
            ProposalOutcome::Committed
        ));
    }

    #[test]
    fn roll_forward_seals_prior_spool() {
        let mut s = spool();
        s.apply_content(b"foobar", 0).unwrap();
        s.apply_proposal(&s.next()).unwrap();

        let mut roll = Fragment::zero(Journal::from("a/journal"));
        roll.begin = 6;
        roll.end = 6;
        roll.backing_store = "mem://stores/test".to_string();

        match s.apply_proposal(&roll).unwrap() {
            ProposalOutcome::Rolled(Some(sealed)) => {
                assert_eq!(sealed.fragment.begin, 0);
                assert_eq!(sealed.fragment.end, 6);
                assert_eq!(sealed.committed_content().unwrap(), Bytes::from("foobar"));
            }
            other => panic!("expected sealed spool, got {other:?}"),
        }
        assert_eq!(s.fragment.begin, 6);
        assert_eq!(s.fragment.end, 6);
        assert_eq!(s.fragment.backing_store, "mem://stores/test");
    }

    #[test]
    fn roll_forward_of_empty_spool_seals_nothing() {
        let mut s = spool();
        let mut roll = Fragment::zero(Journal::from("a/journal"));
        roll.begin = 0;
        roll.end = 0;
        roll.backing_store = "mem://stores/test".to_string();

        // Equal-range empty proposal with differing codec/store fields is
        // a roll, not a mismatch.
        assert!(matches!(
            s.apply_proposal(&roll).unwrap(),
            ProposalOutcome::Rolled(None)
        ));
        assert_eq!(s.fragment.backing_store, "mem://stores/test");
    }

    #[test]
    fn inconsistent_proposal_is_mismatch() {
        let mut s = spool();
        s.apply_content(b"foobar", 0).unwrap();

        // Wrong digest.
        let mut bad = s.next();
        bad.sum = Sum::of(b"other");
        assert!(matches!(
            s.apply_proposal(&bad).unwrap(),
            ProposalOutcome::Mismatch
        ));

        // Wrong end offset.
        let mut bad = s.next();
        bad.end += 1;
        bad.sum = Sum::of(b"foobarx");
        assert!(matches!(
            s.apply_proposal(&bad).unwrap(),
            ProposalOutcome::Mismatch
        ));

        // Wrong journal errors outright.
        let bad = Fragment::zero(Journal::from("other/journal"));
        assert!(s.apply_proposal(&bad).is_err());
    }

    #[test]
    fn next_of_empty_spool_is_zero_sum() {
        let s = spool();
        let next = s.next();
        assert_eq!(next.content_length(), 0);
        assert!(next.sum.is_zero());
    }
}
