use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, trace, warn};

use crate::config::{MediaSource, ScanMode, ScannerConfig, validate_sources};
use crate::enumerate::EnumerationHandle;
use crate::error::{CardScanError, Result};
use crate::event::{CardState, Notifier, ScannerEvent};
use crate::filter;
use crate::index::IndexPersistence;
use crate::media::{FileRecord, FileRef, MediaFile, MediaKind};
use crate::model::MediaIndex;
use crate::pipeline::{self, Origin, PipelineHandle, PipelineOp};
use crate::reconcile;
use crate::storage::{Availability, StorageChange};

#[derive(Debug, Clone, Copy)]
struct ScanStatus {
    state: CardState,
    /// Sub-scans of the current generation still running.
    scanning: usize,
    /// Bumped by every new scan and by a forced drain.
    generation: u64,
}

pub(crate) struct Inner {
    pub(crate) config: ScannerConfig,
    pub(crate) sources: Vec<MediaSource>,
    pub(crate) model: Mutex<MediaIndex>,
    pub(crate) notifier: Notifier,
    pub(crate) persistence: IndexPersistence,
    pub(crate) pipeline: PipelineHandle,
    status: Mutex<ScanStatus>,
    index_loaded: AtomicBool,
    /// Scans started by the scanner itself rather than by a caller.
    background: Mutex<JoinSet<()>>,
}

impl Inner {
    pub(crate) fn source(&self, kind: &MediaKind) -> Option<&MediaSource> {
        self.sources.iter().find(|source| &source.kind == kind)
    }

    pub(crate) fn generation(&self) -> u64 {
        self.status.lock().generation
    }

    pub(crate) fn is_scanning(&self) -> bool {
        self.status.lock().scanning > 0
    }

    fn state(&self) -> CardState {
        self.status.lock().state
    }

    /// Starts a new scan generation. Returns it along with whether this
    /// moved the scanner from idle to scanning.
    fn begin_scan(&self) -> Result<(u64, bool)> {
        let mut status = self.status.lock();
        if status.state != CardState::Ready {
            return Err(CardScanError::Unavailable(status.state));
        }
        status.generation += 1;
        let started = status.scanning == 0;
        status.scanning = self.sources.len();
        Ok((status.generation, started))
    }

    pub(crate) async fn end_scan(&self, generation: u64) {
        let (finished, ready) = {
            let mut status = self.status.lock();
            if status.generation != generation || status.scanning == 0 {
                return;
            }
            status.scanning -= 1;
            (status.scanning == 0, status.state == CardState::Ready)
        };
        if !finished {
            return;
        }
        info!("scan finished with {} records", self.model.lock().len());
        self.notifier.notify(ScannerEvent::ScanEnd);
        if ready {
            let _ = self.persistence.save(&self.model).await;
        }
    }

    async fn scan(self: &Arc<Self>, mode: ScanMode) -> Result<()> {
        let (generation, started) = self.begin_scan()?;
        if started {
            self.notifier.notify(ScannerEvent::ScanStart);
        }
        info!("starting {:?} scan (generation {})", mode, generation);

        let since: Vec<Option<i64>> = {
            let mut model = self.model.lock();
            let mut since = Vec::with_capacity(self.sources.len());
            for source in &self.sources {
                model.mark_unverified(&source.kind);
                since.push(model.newest_date(&source.kind).map(|date| date + 1));
            }
            since
        };

        let mut tasks = JoinSet::new();
        for (idx, since) in since.into_iter().enumerate() {
            tasks.spawn(reconcile::sub_scan(self.clone(), idx, mode, since, generation));
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                error!("sub-scan task failed: {}", err);
                self.end_scan(generation).await;
            }
        }
        Ok(())
    }

    fn spawn_scan(self: &Arc<Self>, mode: ScanMode) {
        let inner = self.clone();
        let mut background = self.background.lock();
        while background.try_join_next().is_some() {}
        background.spawn(async move {
            if let Err(err) = inner.scan(mode).await {
                debug!("background scan not started: {}", err);
            }
        });
    }

    async fn ensure_loaded(&self) {
        if self.index_loaded.swap(true, Ordering::AcqRel) {
            return;
        }
        let loaded = self.persistence.load().await;
        let mut model = self.model.lock();
        if model.is_empty() {
            *model = loaded;
        }
    }

    async fn apply_availability(self: &Arc<Self>, availability: Availability) {
        let next = CardState::from(availability);
        if next == CardState::Ready {
            self.ensure_loaded().await;
        }

        let drained = {
            let mut status = self.status.lock();
            if status.state == next {
                return;
            }
            status.state = next;
            let drained = next != CardState::Ready && status.scanning > 0;
            if drained {
                status.scanning = 0;
                status.generation += 1;
            }
            drained
        };

        match next {
            CardState::Ready => {
                info!("card available");
                self.notifier.notify(ScannerEvent::Ready);
                self.spawn_scan(ScanMode::Incremental);
            }
            reason => {
                info!("card unavailable: {}", reason);
                self.notifier.notify(ScannerEvent::Unavailable { reason });
                if drained {
                    warn!("scan aborted by card loss");
                    self.notifier.notify(ScannerEvent::ScanEnd);
                }
            }
        }
    }

    async fn handle_change(self: &Arc<Self>, idx: usize, change: StorageChange) {
        let source = &self.sources[idx];
        let availability = match change {
            StorageChange::Available => Availability::Available,
            StorageChange::Unavailable => Availability::Unavailable,
            StorageChange::Shared => Availability::Shared,
            StorageChange::Modified(name) => {
                if filter::ignore_name(&name) || !filter::in_directory(&source.config, &name) {
                    trace!("ignoring change to {}", name);
                    return;
                }
                self.pipeline.submit(PipelineOp::Insert {
                    kind: source.kind.clone(),
                    file: FileRef::NameOnly(name),
                    origin: Origin::Live,
                    ack: None,
                });
                return;
            }
            StorageChange::Deleted(name) => {
                if filter::ignore_name(&name) || !filter::in_directory(&source.config, &name) {
                    trace!("ignoring removal of {}", name);
                    return;
                }
                self.pipeline.submit(PipelineOp::Delete {
                    name,
                    origin: Origin::Live,
                    ack: None,
                });
                return;
            }
        };
        if idx == 0 {
            self.apply_availability(availability).await;
        } else {
            trace!("{} availability follows the primary source", source.kind);
        }
    }
}

async fn listen(inner: Arc<Inner>, idx: usize, mut rx: broadcast::Receiver<StorageChange>) {
    loop {
        match rx.recv().await {
            Ok(change) => inner.handle_change(idx, change).await,
            Err(RecvError::Lagged(missed)) => {
                warn!(
                    "{} listener missed {} storage changes, rescanning",
                    inner.sources[idx].kind, missed
                );
                inner.spawn_scan(ScanMode::Incremental);
            }
            Err(RecvError::Closed) => {
                debug!("{} change stream closed", inner.sources[idx].kind);
                break;
            }
        }
    }
}

/// Keeps an index of the media on a removable card in sync with the card.
///
/// The first source is the primary one: its availability drives the
/// scanner's state and the index lives on its storage.
pub struct Scanner {
    inner: Arc<Inner>,
    tasks: Vec<JoinHandle<()>>,
}

impl Scanner {
    pub async fn open(config: ScannerConfig, sources: Vec<MediaSource>) -> Result<Self> {
        config.validate()?;
        validate_sources(&sources)?;
        let primary = sources[0].storage.clone();

        let receivers: Vec<_> = sources
            .iter()
            .map(|source| source.storage.subscribe())
            .collect();

        let state = match primary.available().await {
            Ok(availability) => CardState::from(availability),
            Err(err) => {
                warn!("availability probe failed: {}", err);
                CardState::NoCard
            }
        };
        let persistence = IndexPersistence::new(&config, primary);
        let loaded = state == CardState::Ready;
        let model = if loaded {
            persistence.load().await
        } else {
            MediaIndex::new()
        };

        let (pipeline, rx) = PipelineHandle::new();
        let inner = Arc::new(Inner {
            config,
            sources,
            model: Mutex::new(model),
            notifier: Notifier::new(),
            persistence,
            pipeline,
            status: Mutex::new(ScanStatus {
                state,
                scanning: 0,
                generation: 0,
            }),
            index_loaded: AtomicBool::new(loaded),
            background: Mutex::new(JoinSet::new()),
        });

        info!(
            "opened scanner {} ({} kinds, {} records, {})",
            inner.config.name,
            inner.sources.len(),
            inner.model.lock().len(),
            state
        );
        inner.notifier.notify(match state {
            CardState::Ready => ScannerEvent::Ready,
            reason => ScannerEvent::Unavailable { reason },
        });

        let mut tasks = vec![tokio::spawn(pipeline::run(inner.clone(), rx))];
        for (idx, rx) in receivers.into_iter().enumerate() {
            tasks.push(tokio::spawn(listen(inner.clone(), idx, rx)));
        }
        Ok(Self { inner, tasks })
    }

    pub fn config(&self) -> &ScannerConfig {
        &self.inner.config
    }

    /// Registers the event callback, replacing any earlier one. Events raised
    /// so far are delivered to it first, in order.
    pub fn set_callback<F>(&self, callback: F)
    where
        F: FnMut(ScannerEvent) + Send + 'static,
    {
        self.inner.notifier.set_callback(callback);
    }

    /// Reconciles the model with the card using the configured mode.
    pub async fn scan(&self) -> Result<()> {
        self.scan_with(self.inner.config.scan_mode).await
    }

    /// Fails with [`CardScanError::Unavailable`] unless the card is ready.
    /// Returns once this scan has finished or been superseded by a newer one.
    pub async fn scan_with(&self, mode: ScanMode) -> Result<()> {
        self.inner.scan(mode).await
    }

    pub fn state(&self) -> CardState {
        self.inner.state()
    }

    pub fn is_scanning(&self) -> bool {
        self.inner.is_scanning()
    }

    pub fn len(&self) -> usize {
        self.inner.model.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.model.lock().is_empty()
    }

    /// Snapshot of every record, newest first.
    pub fn files(&self) -> Vec<FileRecord> {
        self.inner.model.lock().files().to_vec()
    }

    pub fn record(&self, name: &str) -> Option<FileRecord> {
        self.inner.model.lock().get(name).cloned()
    }

    /// Walks a snapshot of the records, newest first, calling `callback` for
    /// each until done or cancelled through the returned handle.
    pub fn enumerate<F>(&self, callback: F) -> EnumerationHandle
    where
        F: FnMut(FileRecord) + Send + 'static,
    {
        EnumerationHandle::spawn(self.files(), callback)
    }

    fn require_ready(&self) -> Result<()> {
        match self.state() {
            CardState::Ready => Ok(()),
            state => Err(CardScanError::Unavailable(state)),
        }
    }

    fn source_of(&self, name: &str) -> Result<&MediaSource> {
        let kind = self
            .inner
            .model
            .lock()
            .get(name)
            .map(|record| record.kind.clone())
            .ok_or_else(|| CardScanError::UnknownFile(name.to_owned()))?;
        self.inner
            .source(&kind)
            .ok_or(CardScanError::UnknownKind(kind))
    }

    pub async fn get_file(&self, name: &str) -> Result<MediaFile> {
        self.require_ready()?;
        let source = self.source_of(name)?;
        source.storage.get(name).await
    }

    /// Deletes the file from the card and drops its record.
    pub async fn delete_file(&self, name: &str) -> Result<()> {
        self.require_ready()?;
        let source = self.source_of(name)?;
        source.storage.delete(name).await?;
        self.inner
            .pipeline
            .delete(name.to_owned(), Origin::Live)
            .await;
        Ok(())
    }

    /// Writes `blob` to the card as `name`, replacing any existing file. The
    /// record appears once the storage reports the change.
    pub async fn add_file(
        &self,
        kind: impl Into<MediaKind>,
        name: &str,
        blob: impl Into<Bytes>,
    ) -> Result<()> {
        self.require_ready()?;
        let kind = kind.into();
        let source = self
            .inner
            .source(&kind)
            .ok_or_else(|| CardScanError::UnknownKind(kind.clone()))?;
        let _ = source.storage.delete(name).await;
        source.storage.add_named(blob.into(), name).await
    }

    pub async fn free_space(&self) -> Result<u64> {
        self.require_ready()?;
        self.inner.sources[0].storage.free_space().await
    }

    /// Thumbnail bytes for a record, from memory or from its blob on the card.
    pub async fn thumbnail(&self, name: &str) -> Option<Bytes> {
        let (cached, persisted) = {
            let model = self.inner.model.lock();
            let record = model.get(name)?;
            (record.metadata.thumbnail.clone(), record.persisted)
        };
        match cached {
            Some(thumbnail) => Some(thumbnail),
            None if persisted => self.inner.persistence.read_thumbnail(name).await,
            None => None,
        }
    }

    /// Writes the index now if anything changed since the last save.
    pub async fn save(&self) -> Result<bool> {
        self.inner.persistence.save(&self.inner.model).await
    }
}

impl Drop for Scanner {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        self.inner.background.lock().abort_all();
    }
}

impl std::fmt::Debug for Scanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scanner")
            .field("name", &self.inner.config.name)
            .field("state", &self.state())
            .field("records", &self.len())
            .finish()
    }
}
