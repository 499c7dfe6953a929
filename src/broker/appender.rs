//! Appender: drives the content of one Append RPC through the pipeline.
//!
//! The appender owns the pipeline's send half for the duration of its
//! RPC. It scatters client content as it arrives, maintains a running
//! SHA-1 over exactly the appended bytes, and finishes with a two-phase
//! commit: end-of-input scatters a proposal covering the streamed
//! content; a client error scatters a rollback proposal equal to the
//! spool's committed fragment.

use sha1::{Digest, Sha1};

use super::pipeline::Pipeline;
use crate::allocator::FragmentSpec;
use crate::error::{Error, Result};
use crate::fragment::{Fragment, Sum};
use crate::protocol::{AppendRequest, ReplicateRequest};

pub struct Appender {
    /// Fragment covering exactly this append's content. Cleared on a
    /// client error.
    pub fragment: Option<Fragment>,
    /// Client-side error which forced a rollback, if any.
    pub error: Option<Error>,
    summer: Sha1,
}

impl Appender {
    /// Begin an append, potentially rolling the spool's fragment forward
    /// first: an empty spool, or one at its target length, adopts the
    /// journal spec's codec and primary store at a fresh offset. The roll
    /// is scattered without acknowledgement.
    pub async fn begin(pipeline: &mut Pipeline, spec: &FragmentSpec) -> Appender {
        let cur = pipeline.spool().fragment.clone();

        if cur.content_length() == 0 || cur.content_length() >= spec.length {
            let mut next = Fragment::zero(cur.journal.clone());
            next.begin = cur.end;
            next.end = cur.end;
            next.compression_codec = spec.compression_codec;
            next.backing_store = spec.stores.first().cloned().unwrap_or_default();

            if next != cur {
                pipeline
                    .scatter(&ReplicateRequest {
                        proposal: Some(next),
                        acknowledge: false,
                        ..Default::default()
                    })
                    .await;
            }
        }

        let end = pipeline.spool().fragment.end;
        let mut fragment = Fragment::zero(pipeline.spool().fragment.journal.clone());
        fragment.begin = end;
        fragment.end = end;

        Appender {
            fragment: Some(fragment),
            error: None,
            summer: Sha1::new(),
        }
    }

    /// Process the next client message. `None` is clean end-of-input.
    /// Returns whether the appender expects further messages.
    pub async fn on_recv(
        &mut self,
        pipeline: &mut Pipeline,
        msg: Option<Result<AppendRequest>>,
    ) -> bool {
        let req = match msg {
            Some(Ok(req)) => match req.validate() {
                Ok(()) if req.journal.is_none() => req,
                Ok(_) => {
                    return self
                        .finish(pipeline, Some(Error::Validation("unexpected Journal".into())))
                        .await
                }
                Err(err) => return self.finish(pipeline, Some(err)).await,
            },
            Some(Err(err)) => return self.finish(pipeline, Some(err)).await,
            None => return self.finish(pipeline, None).await,
        };

        // Forward content through the pipeline, tracking this append's
        // digest and range.
        let delta = self
            .fragment
            .as_ref()
            .map(|f| f.content_length())
            .unwrap_or(0);
        self.summer.update(&req.content);
        if let Some(fragment) = &mut self.fragment {
            fragment.end += req.content.len() as i64;
        }
        pipeline
            .scatter(&ReplicateRequest {
                content: req.content,
                content_delta: delta,
                ..Default::default()
            })
            .await;

        pipeline.send_err().is_none()
    }

    /// Issue the final proposal: a commit of the streamed content on
    /// clean end-of-input, or a rollback to the committed fragment on a
    /// client error. Always returns false.
    async fn finish(&mut self, pipeline: &mut Pipeline, err: Option<Error>) -> bool {
        let proposal = match err {
            None => {
                if let Some(fragment) = &mut self.fragment {
                    fragment.sum = if fragment.content_length() == 0 {
                        Sum::ZERO
                    } else {
                        Sum::from_digest(self.summer.clone())
                    };
                }
                pipeline.spool().next()
            }
            Some(err) => {
                // The pipeline remains healthy; spooled partial content
                // is rolled back on every replica.
                self.error = Some(err);
                self.fragment = None;
                pipeline.spool().fragment.clone()
            }
        };

        pipeline
            .scatter(&ReplicateRequest {
                proposal: Some(proposal),
                acknowledge: true,
                ..Default::default()
            })
            .await;
        false
    }
}
