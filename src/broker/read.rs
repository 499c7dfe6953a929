//! Read service loop.
//!
//! Reads resolve against any assigned replica (proxying when the local
//! broker holds none) and stream per-fragment metadata responses followed
//! by content chunks. Unpersisted content is served from the spool's
//! backing file; persisted fragments through their store, alongside a
//! pre-signed URL clients may fetch directly.

use std::os::unix::fs::FileExt;
use std::sync::Arc;

use tokio::sync::mpsc;

use super::resolver::{ResolveArgs, Resolver};
use super::Dialer;
use crate::constants::MAX_READ_CHUNK;
use crate::error::{Result, Status};
use crate::fragment::StoreRegistry;
use crate::protocol::{ReadRequest, ReadResponse};

pub(super) async fn serve_read(
    resolver: &Resolver,
    registry: &StoreRegistry,
    dialer: &Arc<dyn Dialer>,
    req: ReadRequest,
    tx: mpsc::Sender<ReadResponse>,
) -> Result<()> {
    req.validate()?;

    let resolution = resolver
        .resolve(ResolveArgs {
            journal: req.journal.clone(),
            may_proxy: !req.do_not_proxy && req.header.is_none(),
            proxy_header: req.header.clone(),
            ..Default::default()
        })
        .await?;

    if resolution.status != Status::Ok {
        let _ = tx
            .send(ReadResponse {
                status: resolution.status,
                header: Some(resolution.header),
                route: Some(resolution.route),
                ..Default::default()
            })
            .await;
        return Ok(());
    }

    if let Some((id, endpoint)) = &resolution.proxy_to {
        let mut proxied = req.clone();
        proxied.header = Some(resolution.header.clone());
        let mut rx = dialer.read(id, endpoint, proxied).await?;
        while let Some(resp) = rx.recv().await {
            if tx.send(resp).await.is_err() {
                break;
            }
        }
        return Ok(());
    }

    let Some(replica) = resolution.replica else {
        // Resolution yields a replica or a proxy target for Ok statuses.
        return Ok(());
    };

    let mut offset = if req.offset == -1 {
        replica.index.end_offset()
    } else {
        req.offset
    };

    loop {
        let Some((indexed, resolved_offset)) = replica.index.query(offset) else {
            if req.block {
                replica.index.await_beyond(offset).await;
                continue;
            }
            let _ = tx
                .send(ReadResponse {
                    status: Status::OffsetNotYetAvailable,
                    header: Some(resolution.header.clone()),
                    route: Some(resolution.route.clone()),
                    write_head: replica.index.end_offset(),
                    ..Default::default()
                })
                .await;
            return Ok(());
        };
        offset = resolved_offset;
        let fragment = indexed.fragment.clone();

        let fragment_url = if fragment.backing_store.is_empty() {
            String::new()
        } else {
            registry
                .store_for(&fragment)
                .and_then(|store| store.sign(&fragment))
                .unwrap_or_default()
        };
        let metadata = ReadResponse {
            status: Status::Ok,
            header: Some(resolution.header.clone()),
            route: Some(resolution.route.clone()),
            offset,
            write_head: replica.index.end_offset().max(fragment.end),
            fragment: Some(fragment.clone()),
            fragment_url,
            ..Default::default()
        };
        if tx.send(metadata).await.is_err() {
            return Ok(());
        }
        if req.metadata_only {
            return Ok(());
        }

        // Stream the fragment's content from the resolved offset.
        match &indexed.file {
            Some(file) => {
                while offset != fragment.end {
                    let n = MAX_READ_CHUNK.min((fragment.end - offset) as usize);
                    let mut buf = vec![0u8; n];
                    file.read_exact_at(&mut buf, (offset - fragment.begin) as u64)?;
                    if tx.send(ReadResponse::chunk(buf)).await.is_err() {
                        return Ok(());
                    }
                    offset += n as i64;
                }
            }
            None => {
                let store = registry.store_for(&fragment)?;
                let mut content = store.open(&fragment, offset).await?;
                offset = fragment.end;
                while !content.is_empty() {
                    let chunk = content.split_to(MAX_READ_CHUNK.min(content.len()));
                    if tx.send(ReadResponse::chunk(chunk)).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}
