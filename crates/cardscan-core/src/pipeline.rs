//! Serialized insert/delete processing.
//!
//! Scan discovery and live change events both submit work here. One worker
//! task drains the queue, so at most one file is being parsed at a time and
//! the model has a single writer.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::event::ScannerEvent;
use crate::filter;
use crate::media::{FileRecord, FileRef, MediaKind};
use crate::scanner::Inner;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Origin {
    Scan,
    Live,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpOutcome {
    Inserted { position: usize },
    Deleted { position: usize },
    Skipped,
}

#[derive(Debug)]
pub(crate) enum PipelineOp {
    Insert {
        kind: MediaKind,
        file: FileRef,
        origin: Origin,
        ack: Option<oneshot::Sender<OpOutcome>>,
    },
    Delete {
        name: String,
        origin: Origin,
        ack: Option<oneshot::Sender<OpOutcome>>,
    },
}

impl PipelineOp {
    fn name(&self) -> &str {
        match self {
            PipelineOp::Insert { file, .. } => file.name(),
            PipelineOp::Delete { name, .. } => name,
        }
    }

    fn is_delete(&self) -> bool {
        matches!(self, PipelineOp::Delete { .. })
    }

    fn complete(self, outcome: OpOutcome) {
        let ack = match self {
            PipelineOp::Insert { ack, .. } | PipelineOp::Delete { ack, .. } => ack,
        };
        if let Some(ack) = ack {
            let _ = ack.send(outcome);
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct PipelineHandle {
    tx: mpsc::UnboundedSender<PipelineOp>,
}

impl PipelineHandle {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<PipelineOp>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queues an insert and waits for the worker to finish it.
    pub(crate) async fn insert(&self, kind: MediaKind, file: FileRef, origin: Origin) -> OpOutcome {
        let (ack, done) = oneshot::channel();
        self.send(PipelineOp::Insert {
            kind,
            file,
            origin,
            ack: Some(ack),
        });
        done.await.unwrap_or(OpOutcome::Skipped)
    }

    /// Queues a delete and waits for the worker to finish it.
    pub(crate) async fn delete(&self, name: String, origin: Origin) -> OpOutcome {
        let (ack, done) = oneshot::channel();
        self.send(PipelineOp::Delete {
            name,
            origin,
            ack: Some(ack),
        });
        done.await.unwrap_or(OpOutcome::Skipped)
    }

    pub(crate) fn submit(&self, op: PipelineOp) {
        self.send(op);
    }

    fn send(&self, op: PipelineOp) {
        if let Err(err) = self.tx.send(op) {
            debug!("pipeline closed, dropping work for {}", err.0.name());
            err.0.complete(OpOutcome::Skipped);
        }
    }
}

/// Orders a drained batch: deletions first, then insertions, FIFO within
/// each group. An insertion followed later in the batch by a deletion of the
/// same name is dropped and acknowledged as skipped.
pub(crate) fn order_batch(batch: Vec<PipelineOp>) -> Vec<PipelineOp> {
    let mut last_delete: HashMap<String, usize> = HashMap::new();
    for (idx, op) in batch.iter().enumerate() {
        if op.is_delete() {
            last_delete.insert(op.name().to_owned(), idx);
        }
    }

    let mut deletes = Vec::new();
    let mut inserts = Vec::new();
    for (idx, op) in batch.into_iter().enumerate() {
        if op.is_delete() {
            deletes.push(op);
        } else if last_delete.get(op.name()).is_some_and(|&del| del > idx) {
            trace!("insert of {} superseded by a later delete", op.name());
            op.complete(OpOutcome::Skipped);
        } else {
            inserts.push(op);
        }
    }
    deletes.extend(inserts);
    deletes
}

pub(crate) async fn run(inner: Arc<Inner>, mut rx: mpsc::UnboundedReceiver<PipelineOp>) {
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        while let Ok(op) = rx.try_recv() {
            batch.push(op);
        }
        trace!("pipeline batch of {}", batch.len());

        let mut live_change = false;
        for op in order_batch(batch) {
            let outcome = match &op {
                PipelineOp::Insert { kind, file, .. } => insert(&inner, kind, file).await,
                PipelineOp::Delete { name, .. } => delete(&inner, name).await,
            };
            let origin = match &op {
                PipelineOp::Insert { origin, .. } | PipelineOp::Delete { origin, .. } => *origin,
            };
            if origin == Origin::Live && outcome != OpOutcome::Skipped {
                live_change = true;
            }
            op.complete(outcome);
        }

        if live_change && !inner.is_scanning() {
            let _ = inner.persistence.save(&inner.model).await;
        }
    }
    debug!("pipeline worker stopped");
}

async fn insert(inner: &Inner, kind: &MediaKind, file: &FileRef) -> OpOutcome {
    let Some(source) = inner.source(kind) else {
        warn!("no source configured for kind {}", kind);
        return OpOutcome::Skipped;
    };

    let file = match file {
        FileRef::Known(file) => file.clone(),
        FileRef::NameOnly(name) => match source.storage.get(name).await {
            Ok(file) => file,
            Err(err) => {
                warn!("could not resolve {}: {}", name, err);
                return OpOutcome::Skipped;
            }
        },
    };
    if !filter::accepts(&source.config, &file) {
        trace!("ignoring {}", file.name);
        return OpOutcome::Skipped;
    }

    let metadata = match source.parser.parse(&file, source.storage.as_ref()).await {
        Ok(metadata) => metadata,
        Err(err) => {
            warn!("dropping {}: {}", file.name, err);
            return OpOutcome::Skipped;
        }
    };

    let record = FileRecord::new(kind.clone(), file, metadata);
    let outcome = inner.model.lock().insert(record.clone());
    if let Some((position, old)) = outcome.replaced {
        debug!("replacing {} at {}", old.name, position);
        let persisted = old.persisted;
        let name = old.name.clone();
        inner.notifier.notify(ScannerEvent::Delete {
            record: old,
            position,
        });
        if persisted {
            inner.persistence.discard_thumbnail(&name).await;
        }
    }
    debug!("inserted {} at {}", record.name, outcome.position);
    inner.notifier.notify(ScannerEvent::Insert {
        record,
        position: outcome.position,
    });
    OpOutcome::Inserted {
        position: outcome.position,
    }
}

async fn delete(inner: &Inner, name: &str) -> OpOutcome {
    let removed = inner.model.lock().remove(name);
    let Some((position, record)) = removed else {
        trace!("delete of unknown {}", name);
        return OpOutcome::Skipped;
    };
    debug!("deleted {} from {}", name, position);
    let persisted = record.persisted;
    inner
        .notifier
        .notify(ScannerEvent::Delete { record, position });
    if persisted {
        inner.persistence.discard_thumbnail(name).await;
    }
    OpOutcome::Deleted { position }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaFile;

    fn insert_op(name: &str) -> (PipelineOp, oneshot::Receiver<OpOutcome>) {
        let (ack, rx) = oneshot::channel();
        let op = PipelineOp::Insert {
            kind: MediaKind::from("pictures"),
            file: FileRef::Known(MediaFile::new(name, "image/jpeg", 1, 1)),
            origin: Origin::Scan,
            ack: Some(ack),
        };
        (op, rx)
    }

    fn delete_op(name: &str) -> PipelineOp {
        PipelineOp::Delete {
            name: name.into(),
            origin: Origin::Live,
            ack: None,
        }
    }

    fn describe(ops: &[PipelineOp]) -> Vec<String> {
        ops.iter()
            .map(|op| {
                let verb = if op.is_delete() { "del" } else { "ins" };
                format!("{verb} {}", op.name())
            })
            .collect()
    }

    #[test]
    fn deletions_run_before_insertions() {
        let (a, _) = insert_op("a");
        let (b, _) = insert_op("b");
        let ordered = order_batch(vec![a, delete_op("x"), b, delete_op("y")]);
        assert_eq!(describe(&ordered), vec!["del x", "del y", "ins a", "ins b"]);
    }

    #[tokio::test]
    async fn later_delete_supersedes_insert() {
        let (first, superseded) = insert_op("a");
        let (second, _kept) = insert_op("a");
        let ordered = order_batch(vec![first, delete_op("a"), second]);
        assert_eq!(describe(&ordered), vec!["del a", "ins a"]);
        assert_eq!(superseded.await.unwrap(), OpOutcome::Skipped);
    }

    #[tokio::test]
    async fn closed_pipeline_acknowledges_as_skipped() {
        let (handle, rx) = PipelineHandle::new();
        drop(rx);
        let outcome = handle
            .insert(
                MediaKind::from("pictures"),
                FileRef::NameOnly("a.jpg".into()),
                Origin::Scan,
            )
            .await;
        assert_eq!(outcome, OpOutcome::Skipped);
        assert_eq!(handle.delete("a.jpg".into(), Origin::Live).await, OpOutcome::Skipped);
    }
}
