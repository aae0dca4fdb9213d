//! Chunked parallel transfer engine.
//!
//! Both sides of a transfer live here. As requester the engine plans the
//! thread ranges, asks the owner for each one, collects frames into
//! per-thread buffers and writes the merged file once every thread has
//! completed. As owner it serves thread requests from registered share
//! roots, streaming each range in concurrent batches of frames.
//!
//! Whole-file downloads pass a global FIFO admission queue first; at most
//! `max_concurrent_transfers` run at once.
//!
//! While a peer's session is interrupted its transfers are paused, not
//! failed: [`suspend_peer`](ChunkedTransferEngine::suspend_peer) parks the
//! uploads and [`resume_peer`](ChunkedTransferEngine::resume_peer) serves
//! them again and re-requests every unfinished download thread. Frames that
//! arrive twice are ignored by the reassembler.

use crate::channel::DataChannelTransport;
use crate::config::TransferConfig;
use crate::control::{ControlMessage, TransferRequest};
use crate::error::{Error, Result};
use crate::frame::TransferFrame;
use crate::link::PeerId;
use crate::transfer::admission::{AdmissionPermit, AdmissionQueue};
use crate::transfer::progress::TransferProgress;
use crate::transfer::share::ShareAccess;
use crate::transfer::tracker::{ThreadCompletionTracker, TrackerOutcome};
use crate::transfer::{FileDescriptor, TransportProvider, parse_thread_id, thread_request_id};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::future::join_all;
use huddle_files::{ByteRange, FileChunker, FileStore, Reassembler, plan_ranges};
use std::collections::VecDeque;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State of one download on the requester
struct Download {
    request_id: String,
    descriptor: FileDescriptor,
    save_path: PathBuf,
    ranges: Vec<ByteRange>,
    buffers: Mutex<Option<Reassembler>>,
    tracker: ThreadCompletionTracker,
    slot: Mutex<Option<AdmissionPermit>>,
    cancel: CancellationToken,
    /// Every thread has been asked for once
    requested: AtomicBool,
    /// Claimed by whichever comes first: the final write or a cancel
    settled: AtomicBool,
}

impl Download {
    fn new(
        request_id: String,
        descriptor: FileDescriptor,
        save_path: PathBuf,
        cancel: CancellationToken,
    ) -> Self {
        let ranges = if descriptor.size == 0 {
            Vec::new()
        } else {
            plan_ranges(descriptor.size)
        };
        Self {
            request_id,
            save_path,
            buffers: Mutex::new(Some(Reassembler::new(ranges.len()))),
            tracker: ThreadCompletionTracker::new(ranges.len()),
            slot: Mutex::new(None),
            cancel,
            requested: AtomicBool::new(false),
            settled: AtomicBool::new(false),
            descriptor,
            ranges,
        }
    }

    /// Request for thread `thread`, sent on behalf of `requester`
    fn thread_request(&self, thread: usize, requester: &str) -> TransferRequest {
        let descriptor = &self.descriptor;
        let range = self.ranges[thread];
        TransferRequest {
            request_id: thread_request_id(&self.request_id, thread),
            share_id: descriptor.share_id.clone(),
            owner_id: descriptor.owner_id.clone(),
            requester_id: requester.to_string(),
            file_path: descriptor.path.clone(),
            file_name: descriptor.name.clone(),
            file_size: descriptor.size,
            range_start: Some(range.start),
            range_end: Some(range.end),
            thread_index: Some(thread as u32),
            password: descriptor.password.clone(),
        }
    }

    /// Store a chunk; returns whether the thread finished and the bytes held
    fn insert_chunk(
        &self,
        thread: usize,
        index: u32,
        total: u32,
        data: Vec<u8>,
    ) -> Option<huddle_files::Result<(bool, u64)>> {
        let mut buffers = lock(&self.buffers);
        let buffers = buffers.as_mut()?;
        Some(
            buffers
                .insert_chunk(thread, index, total, data)
                .map(|done| (done, buffers.received_bytes())),
        )
    }

    fn mark_complete(&self, thread: usize, total: u32) -> Option<huddle_files::Result<bool>> {
        let mut buffers = lock(&self.buffers);
        Some(buffers.as_mut()?.mark_complete(thread, total))
    }

    fn take_buffers(&self) -> Option<Reassembler> {
        lock(&self.buffers).take()
    }

    /// Returns `true` for the first caller only
    fn settle(&self) -> bool {
        !self.settled.swap(true, Ordering::AcqRel)
    }

    /// Drop buffers, wake the join and give back the admission slot
    fn release(&self) {
        lock(&self.buffers).take();
        lock(&self.slot).take();
        self.tracker.release();
    }
}

/// A thread being served to a requester
struct Upload {
    peer_id: PeerId,
    request: TransferRequest,
    serial: u64,
    cancel: CancellationToken,
}

/// Chunked parallel transfer engine
pub struct ChunkedTransferEngine {
    local_id: PeerId,
    config: TransferConfig,
    transports: Arc<dyn TransportProvider>,
    store: Arc<dyn FileStore>,
    admission: AdmissionQueue,
    downloads: DashMap<String, Arc<Download>>,
    uploads: DashMap<String, Upload>,
    upload_serial: AtomicU64,
    /// Uploads parked while their requester's session is interrupted
    suspended: DashMap<String, (PeerId, TransferRequest)>,
    shares: DashMap<String, ShareAccess>,
    progress: DashMap<String, TransferProgress>,
    /// Finished request ids, oldest first
    finished: Mutex<VecDeque<String>>,
    progress_tx: broadcast::Sender<TransferProgress>,
    shutdown: CancellationToken,
}

impl ChunkedTransferEngine {
    /// Create an engine
    ///
    /// # Arguments
    ///
    /// * `local_id` - Id of the local lobby member
    /// * `config` - Transfer limits
    /// * `transports` - Source of connected data channels
    /// * `store` - Where shared files are read from and downloads written to
    pub fn new(
        local_id: impl Into<PeerId>,
        config: TransferConfig,
        transports: Arc<dyn TransportProvider>,
        store: Arc<dyn FileStore>,
    ) -> Arc<Self> {
        let (progress_tx, _) = broadcast::channel(config.progress_capacity.max(1));
        Arc::new(Self {
            local_id: local_id.into(),
            admission: AdmissionQueue::new(config.max_concurrent_transfers),
            config,
            transports,
            store,
            downloads: DashMap::new(),
            uploads: DashMap::new(),
            upload_serial: AtomicU64::new(0),
            suspended: DashMap::new(),
            shares: DashMap::new(),
            progress: DashMap::new(),
            finished: Mutex::new(VecDeque::new()),
            progress_tx,
            shutdown: CancellationToken::new(),
        })
    }

    // ============ Shares ============

    /// Serve files under `root` as open share `share_id`
    pub fn share_directory(&self, share_id: impl Into<String>, root: impl Into<PathBuf>) {
        self.share(share_id, ShareAccess::new(root));
    }

    /// Serve a share under the rules in `access`
    pub fn share(&self, share_id: impl Into<String>, access: ShareAccess) {
        let share_id = share_id.into();
        tracing::info!(
            "Sharing {} as {}{}",
            access.root().display(),
            share_id,
            if access.is_protected() { " (password protected)" } else { "" }
        );
        self.shares.insert(share_id, access);
    }

    /// Stop serving a share
    pub fn unshare(&self, share_id: &str) -> bool {
        self.shares.remove(share_id).is_some()
    }

    /// Stop serving every expired share and return their ids
    pub fn cleanup_expired_shares(&self) -> Vec<String> {
        let expired: Vec<String> = self
            .shares
            .iter()
            .filter(|share| share.is_expired())
            .map(|share| share.key().clone())
            .collect();
        for share_id in &expired {
            if self.shares.remove(share_id).is_some() {
                tracing::info!("Share {} expired", share_id);
            }
        }
        expired
    }

    // ============ Requester side ============

    /// Start downloading a remote file
    ///
    /// Returns the request id (`transfer-<uuid>`). The download waits for an
    /// admission slot, then runs in the background; follow it through
    /// [`subscribe_progress`](Self::subscribe_progress) or
    /// [`progress`](Self::progress).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Shutdown`] after [`shutdown`](Self::shutdown).
    pub fn request_download(
        self: &Arc<Self>,
        descriptor: FileDescriptor,
        save_path: impl Into<PathBuf>,
    ) -> Result<String> {
        let request_id = format!("transfer-{}", uuid::Uuid::new_v4());
        self.start_download(request_id.clone(), descriptor, save_path)?;
        Ok(request_id)
    }

    /// Start downloading under a caller-chosen request id
    ///
    /// # Errors
    ///
    /// Returns [`Error::ThreadTransfer`] if the id is already in use, or
    /// [`Error::Shutdown`] after [`shutdown`](Self::shutdown).
    pub fn start_download(
        self: &Arc<Self>,
        request_id: impl Into<String>,
        descriptor: FileDescriptor,
        save_path: impl Into<PathBuf>,
    ) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Shutdown("transfer engine stopped".into()));
        }
        let request_id = request_id.into();
        let download = Arc::new(Download::new(
            request_id.clone(),
            descriptor,
            save_path.into(),
            self.shutdown.child_token(),
        ));

        match self.downloads.entry(request_id.clone()) {
            Entry::Occupied(_) => {
                return Err(Error::ThreadTransfer(format!(
                    "request id {request_id} already in use"
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&download));
            }
        }

        tracing::info!(
            "Queued {} ({} bytes, {} threads) from {} as {}",
            download.descriptor.name,
            download.descriptor.size,
            download.ranges.len(),
            download.descriptor.owner_id,
            request_id
        );
        let progress = TransferProgress::new(&request_id, download.descriptor.size);
        self.progress.insert(request_id, progress.clone());
        let _ = self.progress_tx.send(progress);

        tokio::spawn(Arc::clone(self).run_download(download));
        Ok(())
    }

    async fn run_download(self: Arc<Self>, download: Arc<Download>) {
        let id = download.request_id.clone();
        let result = self.drive_download(&download).await;
        download.release();
        self.downloads
            .remove_if(&id, |_, current| Arc::ptr_eq(current, &download));

        match result {
            Ok(()) => {
                tracing::info!(
                    "Transfer {} complete: {}",
                    id,
                    download.save_path.display()
                );
                self.update_progress(&id, TransferProgress::complete);
            }
            // usually reported by cancel() already
            Err(Error::Cancelled) => self.update_progress(&id, TransferProgress::cancel),
            Err(e) => {
                tracing::warn!("Transfer {} failed: {}", id, e);
                self.notify_cancel(&download.descriptor.owner_id, &id);
                let reason = e.to_string();
                self.update_progress(&id, |p| p.fail(reason));
            }
        }
    }

    async fn drive_download(&self, download: &Download) -> Result<()> {
        let permit = tokio::select! {
            _ = download.cancel.cancelled() => return Err(Error::Cancelled),
            permit = self.admission.acquire() => permit,
        };
        let permit = permit.ok_or_else(|| Error::Shutdown("admission queue closed".into()))?;
        *lock(&download.slot) = Some(permit);
        if download.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let descriptor = &download.descriptor;
        if descriptor.size == 0 {
            tracing::debug!("{} is empty, writing directly", descriptor.name);
            return self.persist(download).await;
        }

        self.update_progress(&download.request_id, TransferProgress::start);

        let transport = self
            .transports
            .transport(&descriptor.owner_id)
            .ok_or_else(|| Error::SessionNotFound(descriptor.owner_id.clone()))?;
        self.send_thread_requests(&transport, download, 0..download.ranges.len())
            .await?;
        download.requested.store(true, Ordering::Release);
        tracing::debug!(
            "Requested {} threads of {} from {}",
            download.ranges.len(),
            download.request_id,
            descriptor.owner_id
        );

        let outcome = tokio::select! {
            _ = download.cancel.cancelled() => return Err(Error::Cancelled),
            outcome = download.tracker.wait() => outcome,
        };
        match outcome {
            TrackerOutcome::Completed => {}
            TrackerOutcome::Failed(reason) => return Err(Error::ThreadTransfer(reason)),
            TrackerOutcome::Released => return Err(Error::Cancelled),
        }

        self.persist(download).await
    }

    async fn send_thread_requests(
        &self,
        transport: &DataChannelTransport,
        download: &Download,
        threads: impl IntoIterator<Item = usize>,
    ) -> Result<()> {
        for thread in threads {
            let request = download.thread_request(thread, &self.local_id);
            transport
                .send_control(&ControlMessage::TransferRequest(request))
                .await?;
        }
        Ok(())
    }

    /// Merge the threads and write the file, unless a cancel got there first
    async fn persist(&self, download: &Download) -> Result<()> {
        let size = download.descriptor.size;
        let data = if size == 0 {
            Vec::new()
        } else {
            let buffers = download.take_buffers().ok_or(Error::Cancelled)?;
            let data = buffers.merge()?;
            if data.len() as u64 != size {
                return Err(Error::ThreadTransfer(format!(
                    "received {} bytes, expected {}",
                    data.len(),
                    size
                )));
            }
            data
        };

        if download.cancel.is_cancelled() || !download.settle() {
            tracing::debug!("{} cancelled before it was saved", download.request_id);
            return Err(Error::Cancelled);
        }
        self.store.write_all(&download.save_path, &data).await?;
        Ok(())
    }

    /// Feed an inbound transfer frame from `peer_id`
    ///
    /// Frames that do not decode, or that belong to an unknown or cancelled
    /// request, are discarded.
    pub fn handle_frame(&self, peer_id: &str, data: &[u8]) {
        let frame = match TransferFrame::decode(data) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Discarding malformed frame from {}: {}", peer_id, e);
                return;
            }
        };
        let Some((request_id, thread)) = parse_thread_id(frame.id()) else {
            tracing::debug!("Frame id {} names no thread", frame.id());
            return;
        };
        let request_id = request_id.to_string();
        let Some(download) = self.downloads.get(&request_id).map(|d| Arc::clone(d.value())) else {
            tracing::trace!("Discarding frame for unknown request {}", request_id);
            return;
        };
        if download.cancel.is_cancelled() {
            return;
        }
        if download.descriptor.owner_id != peer_id {
            tracing::warn!(
                "Frame for {} from {}, expected owner {}",
                request_id,
                peer_id,
                download.descriptor.owner_id
            );
            return;
        }

        let finished = match frame {
            TransferFrame::Chunk {
                index, total, data, ..
            } => match download.insert_chunk(thread, index, total, data) {
                Some(Ok((done, received))) => {
                    self.update_progress(&request_id, |p| p.update(received));
                    Ok(done)
                }
                Some(Err(e)) => Err(e.to_string()),
                None => return,
            },
            TransferFrame::Complete { total, .. } => match download.mark_complete(thread, total) {
                Some(result) => result.map_err(|e| e.to_string()),
                None => return,
            },
            TransferFrame::Error { message, .. } => Err(message),
        };

        match finished {
            Ok(true) => {
                tracing::debug!("Thread {} of {} complete", thread, request_id);
                download.tracker.complete(thread);
            }
            Ok(false) => {}
            Err(reason) => {
                tracing::warn!("Thread {} of {} failed: {}", thread, request_id, reason);
                download.tracker.fail(format!("thread {thread}: {reason}"));
            }
        }
    }

    /// Cancel a download
    ///
    /// Buffers, the completion join and the admission slot are released
    /// at once; the owner is told to stop on a best-effort basis.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransferNotFound`] if no such download is running,
    /// or [`Error::ThreadTransfer`] if the file is already being written.
    pub fn cancel(&self, request_id: &str) -> Result<()> {
        let download = self
            .downloads
            .get(request_id)
            .map(|d| Arc::clone(d.value()))
            .ok_or_else(|| Error::TransferNotFound(request_id.to_string()))?;
        if !download.settle() {
            return Err(Error::ThreadTransfer(format!(
                "{request_id} is already being saved"
            )));
        }
        self.downloads
            .remove_if(request_id, |_, current| Arc::ptr_eq(current, &download));

        download.cancel.cancel();
        download.release();
        self.update_progress(request_id, TransferProgress::cancel);
        self.notify_cancel(&download.descriptor.owner_id, request_id);
        tracing::info!("Transfer {} cancelled", request_id);
        Ok(())
    }

    fn notify_cancel(&self, owner_id: &str, request_id: &str) {
        let Some(transport) = self.transports.transport(owner_id) else {
            return;
        };
        let message = ControlMessage::CancelTransfer {
            request_id: request_id.to_string(),
        };
        tokio::spawn(async move {
            if let Err(e) = transport.send_control(&message).await {
                tracing::debug!("Cancel notice to {} not sent: {}", transport.peer_id(), e);
            }
        });
    }

    // ============ Interrupted sessions ============

    /// Pause work with `peer_id` while its session is interrupted
    ///
    /// Uploads to the peer stop and are parked until
    /// [`resume_peer`](Self::resume_peer). Downloads from the peer keep
    /// their buffers and admission slots.
    pub fn suspend_peer(&self, peer_id: &str) {
        let mut parked = 0;
        for entry in self.uploads.iter() {
            if entry.peer_id == peer_id {
                entry.cancel.cancel();
                self.suspended
                    .insert(entry.key().clone(), (peer_id.to_string(), entry.request.clone()));
                parked += 1;
            }
        }
        let waiting = self
            .downloads
            .iter()
            .filter(|d| d.descriptor.owner_id == peer_id)
            .count();
        tracing::info!(
            "Session with {} interrupted: {} uploads parked, {} downloads waiting",
            peer_id,
            parked,
            waiting
        );
    }

    /// Pick up work with `peer_id` after its session recovered
    ///
    /// Parked uploads are served again and every download from the peer
    /// asks once more for the threads it has not finished.
    pub fn resume_peer(self: &Arc<Self>, peer_id: &str) {
        let parked: Vec<String> = self
            .suspended
            .iter()
            .filter(|entry| entry.0 == peer_id)
            .map(|entry| entry.key().clone())
            .collect();
        for id in parked {
            if let Some((_, (_, request))) = self.suspended.remove(&id) {
                self.serve(peer_id, request);
            }
        }

        let downloads: Vec<Arc<Download>> = self
            .downloads
            .iter()
            .filter(|d| {
                d.descriptor.owner_id == peer_id
                    && d.requested.load(Ordering::Acquire)
                    && !d.cancel.is_cancelled()
            })
            .map(|d| Arc::clone(d.value()))
            .collect();
        for download in downloads {
            let engine = Arc::clone(self);
            tokio::spawn(async move { engine.request_again(&download).await });
        }
    }

    async fn request_again(&self, download: &Download) {
        let pending = download.tracker.pending();
        if pending.is_empty() {
            return;
        }
        let owner = &download.descriptor.owner_id;
        let Some(transport) = self.transports.transport(owner) else {
            tracing::warn!("No session with {} to resume {}", owner, download.request_id);
            return;
        };
        tracing::info!(
            "Resuming {} threads of {} from {}",
            pending.len(),
            download.request_id,
            owner
        );
        if let Err(e) = self.send_thread_requests(&transport, download, pending).await {
            download.tracker.fail(format!("resume failed: {e}"));
        }
    }

    /// Fail every download served by `peer_id` and stop serving it
    pub fn abort_peer(&self, peer_id: &str) {
        for entry in self.downloads.iter() {
            if entry.descriptor.owner_id == peer_id {
                entry
                    .tracker
                    .fail(format!("owner {peer_id} is no longer connected"));
            }
        }
        for entry in self.uploads.iter() {
            if entry.peer_id == peer_id {
                entry.cancel.cancel();
            }
        }
        self.suspended.retain(|_, (requester, _)| requester != peer_id);
    }

    // ============ Owner side ============

    /// Handle a transfer control message from `peer_id`
    pub fn handle_control(self: &Arc<Self>, peer_id: &str, message: ControlMessage) {
        match message {
            ControlMessage::TransferRequest(request) => self.serve(peer_id, request),
            ControlMessage::CancelTransfer { request_id } => self.stop_upload(&request_id),
            other => tracing::trace!("Engine ignoring {:?}", other),
        }
    }

    fn stop_upload(&self, request_id: &str) {
        let targets = |id: &str| {
            id == request_id || parse_thread_id(id).is_some_and(|(id, _)| id == request_id)
        };
        let mut stopped = 0;
        for entry in self.uploads.iter() {
            if targets(entry.key()) {
                entry.cancel.cancel();
                stopped += 1;
            }
        }
        self.suspended.retain(|id, _| !targets(id));
        tracing::debug!("Cancel for {} stopped {} uploads", request_id, stopped);
    }

    fn serve(self: &Arc<Self>, peer_id: &str, request: TransferRequest) {
        let Some(transport) = self.transports.transport(peer_id) else {
            tracing::warn!("Transfer request from {} without a session", peer_id);
            return;
        };

        let id = request.request_id.clone();
        let serial = self.upload_serial.fetch_add(1, Ordering::Relaxed);
        let cancel = self.shutdown.child_token();
        self.suspended.remove(&id);
        let upload = Upload {
            peer_id: peer_id.to_string(),
            request: request.clone(),
            serial,
            cancel: cancel.clone(),
        };
        if let Some(previous) = self.uploads.insert(id.clone(), upload) {
            // a repeated request replaces the stream already running
            previous.cancel.cancel();
        }

        tracing::info!(
            "Serving {} {} of {} to {}",
            id,
            request.range(),
            request.file_name,
            peer_id
        );

        let engine = Arc::clone(self);
        let peer_id = peer_id.to_string();
        tokio::spawn(async move {
            let result = engine.serve_thread(&transport, &request, &cancel).await;
            engine
                .uploads
                .remove_if(&id, |_, upload| upload.serial == serial);

            match result {
                Ok(()) => tracing::debug!("Upload {} finished", id),
                Err(Error::Cancelled) => tracing::debug!("Upload {} cancelled", id),
                Err(e) => {
                    tracing::warn!("Upload {} failed: {}", id, e);
                    let frame = TransferFrame::Error {
                        id: id.clone(),
                        message: e.to_string(),
                    };
                    if let Err(send) = transport.send_frame(&frame).await {
                        tracing::debug!("Error frame for {} not sent: {}", id, send);
                        if matches!(e, Error::Channel(_)) {
                            // the link itself is down; serve again if it recovers
                            engine.suspended.insert(id, (peer_id, request));
                        }
                    }
                }
            }
        });
    }

    /// Check the request against its share and resolve the file path
    fn authorize(&self, request: &TransferRequest) -> Result<PathBuf> {
        let access = self
            .shares
            .get(&request.share_id)
            .map(|share| share.value().clone())
            .ok_or_else(|| Error::ThreadTransfer(format!("unknown share {}", request.share_id)))?;
        if access.is_expired() {
            return Err(Error::ThreadTransfer(format!(
                "share {} has expired",
                request.share_id
            )));
        }
        if !access.admits(request.password.as_deref()) {
            tracing::warn!(
                "Rejected {} from {}: wrong password for share {}",
                request.request_id,
                request.requester_id,
                request.share_id
            );
            return Err(Error::ThreadTransfer(format!(
                "incorrect password for share {}",
                request.share_id
            )));
        }
        resolve_share_path(access.root(), &request.file_path)
            .ok_or_else(|| Error::ThreadTransfer(format!("invalid path {}", request.file_path)))
    }

    async fn serve_thread(
        &self,
        transport: &DataChannelTransport,
        request: &TransferRequest,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let path = self.authorize(request)?;
        let data = self.store.read_range(&path, request.range()).await?;
        let chunker = FileChunker::with_chunk_size(self.config.frame_chunk_size);
        let total = chunker.chunk_count(data.len() as u64);
        let chunks: Vec<(u32, &[u8])> = chunker.chunks(&data).collect();

        for batch in chunks.chunks(self.config.send_batch_size) {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let sends = batch.iter().map(|&(index, bytes)| {
                let frame = TransferFrame::Chunk {
                    id: request.request_id.clone(),
                    index,
                    total,
                    data: bytes.to_vec(),
                };
                async move { transport.send_frame(&frame).await }
            });
            for result in join_all(sends).await {
                result?;
            }
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        transport
            .send_frame(&TransferFrame::Complete {
                id: request.request_id.clone(),
                total,
            })
            .await?;
        Ok(())
    }

    // ============ Progress ============

    fn update_progress(&self, request_id: &str, update: impl FnOnce(&mut TransferProgress)) {
        let snapshot = match self.progress.get_mut(request_id) {
            Some(mut progress) => {
                if progress.status.is_terminal() {
                    return;
                }
                update(&mut progress);
                progress.clone()
            }
            None => return,
        };
        let finished = snapshot.status.is_terminal();
        let _ = self.progress_tx.send(snapshot);
        if finished {
            self.retire(request_id);
        }
    }

    /// Keep the final state of at most `progress_retention` finished transfers
    fn retire(&self, request_id: &str) {
        let mut finished = lock(&self.finished);
        finished.push_back(request_id.to_string());
        while finished.len() > self.config.progress_retention {
            let Some(oldest) = finished.pop_front() else {
                break;
            };
            self.progress
                .remove_if(&oldest, |_, progress| progress.status.is_terminal());
        }
    }

    /// Subscribe to progress snapshots
    pub fn subscribe_progress(&self) -> broadcast::Receiver<TransferProgress> {
        self.progress_tx.subscribe()
    }

    /// Latest progress of a request
    ///
    /// Finished transfers stay queryable until `progress_retention` newer
    /// ones have finished.
    pub fn progress(&self, request_id: &str) -> Option<TransferProgress> {
        self.progress.get(request_id).map(|p| p.value().clone())
    }

    /// Downloads not yet finished
    pub fn active_downloads(&self) -> usize {
        self.downloads.len()
    }

    /// Downloads currently holding an admission slot
    pub fn admitted(&self) -> usize {
        self.admission.active()
    }

    /// Threads currently being served
    pub fn active_uploads(&self) -> usize {
        self.uploads.len()
    }

    /// Cancel everything and refuse new work
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.admission.close();
        self.suspended.clear();
        let ids: Vec<String> = self.downloads.iter().map(|d| d.key().clone()).collect();
        for id in ids {
            let _ = self.cancel(&id);
        }
    }
}

impl std::fmt::Debug for ChunkedTransferEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkedTransferEngine")
            .field("local_id", &self.local_id)
            .field("downloads", &self.downloads.len())
            .field("uploads", &self.uploads.len())
            .field("suspended", &self.suspended.len())
            .finish()
    }
}

/// Join a requested path onto a share root, refusing escapes
fn resolve_share_path(root: &Path, relative: &str) -> Option<PathBuf> {
    let relative = Path::new(relative);
    let safe = relative
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    (safe && !relative.as_os_str().is_empty()).then(|| root.join(relative))
}
