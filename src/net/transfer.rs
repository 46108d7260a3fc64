//! File transfer: offer, accept/reject, chunk streaming and reassembly
//!
//! ```text
//! Pending ──accept──► Transferring ──last chunk──► Completed
//!    │                     │
//!    └─reject / cancel─►  Failed  ◄─io error / out-of-order chunk / peer gone
//! ```
//!
//! A sender withdraws an unanswered offer with a `file_response` carrying
//! `accepted: false`; the receiver fails its record when that arrives.
//!
//! Control envelopes (`file_request`, `file_response`, `file_chunk`) are not
//! sealed; only chat content is.

use super::connection::Outbound;
use super::message::{Envelope, FileChunk, FileTransferRequest, FileTransferResponse};
use super::protocol::{NetError, NetEvent, Network};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{oneshot, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Attempts at finding a free name in the download directory
const MAX_NAME_SUFFIX: u32 = 1000;

/// `file_response` message a sender uses to withdraw its offer
pub const CANCELLED_MESSAGE: &str = "cancelled";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Pending,
    Transferring,
    /// Receiver: last chunk written to disk. Sender: every chunk written to the socket.
    Completed,
    Failed,
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Pending => "pending",
            TransferStatus::Transferring => "transferring",
            TransferStatus::Completed => "completed",
            TransferStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Send,
    Receive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRecord {
    pub file_id: String,
    pub file_name: String,
    /// Source path on the sender, destination once a receive is accepted
    #[serde(skip)]
    pub file_path: Option<PathBuf>,
    pub file_size: u64,
    pub bytes_transferred: u64,
    pub status: TransferStatus,
    pub direction: Direction,
    pub peer_name: String,
    pub peer_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

impl TransferRecord {
    /// Percent complete, 100 for empty files that finished
    pub fn progress(&self) -> u8 {
        if self.file_size == 0 {
            return if self.status == TransferStatus::Completed { 100 } else { 0 };
        }
        ((self.bytes_transferred.min(self.file_size) * 100) / self.file_size) as u8
    }
}

/// Open destination file for an accepted receive
struct ReceiveSink {
    file: File,
    next_chunk: u64,
}

/// Result of applying one incoming chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    Written,
    Completed,
    Failed(String),
    /// Unknown file ID, wrong peer, or not accepted
    Ignored,
}

/// Transfer records plus open receive files
pub struct TransferTable {
    records: RwLock<HashMap<String, TransferRecord>>,
    sinks: Mutex<HashMap<String, ReceiveSink>>,
}

impl TransferTable {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            sinks: Mutex::new(HashMap::new()),
        }
    }

    /// Returns false if the ID is already in use
    pub async fn insert(&self, record: TransferRecord) -> bool {
        let mut records = self.records.write().await;
        if records.contains_key(&record.file_id) {
            return false;
        }
        records.insert(record.file_id.clone(), record);
        true
    }

    pub async fn get(&self, file_id: &str) -> Option<TransferRecord> {
        self.records.read().await.get(file_id).cloned()
    }

    /// All records, oldest first
    pub async fn list(&self) -> Vec<TransferRecord> {
        let mut list: Vec<TransferRecord> = self.records.read().await.values().cloned().collect();
        list.sort_by(|a, b| a.start_time.cmp(&b.start_time).then_with(|| a.file_id.cmp(&b.file_id)));
        list
    }

    /// Atomically move `file_id` from `from` to `to`, checking direction
    pub async fn transition(
        &self,
        file_id: &str,
        direction: Direction,
        from: TransferStatus,
        to: TransferStatus,
    ) -> Result<TransferRecord, NetError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(file_id)
            .filter(|r| r.direction == direction)
            .ok_or_else(|| NetError::TransferNotFound(file_id.to_string()))?;

        if record.status != from {
            return Err(NetError::InvalidTransferState {
                file_id: file_id.to_string(),
                status: record.status,
                expected: from,
            });
        }
        record.status = to;
        if to.is_terminal() {
            record.end_time = Some(Utc::now());
        }
        Ok(record.clone())
    }

    /// Mark a live transfer finished. Already-terminal records are left alone.
    pub async fn finish(&self, file_id: &str, status: TransferStatus) -> bool {
        let mut records = self.records.write().await;
        match records.get_mut(file_id) {
            Some(record) if !record.status.is_terminal() => {
                record.status = status;
                record.end_time = Some(Utc::now());
                true
            }
            _ => false,
        }
    }

    pub async fn set_path(&self, file_id: &str, path: PathBuf) {
        if let Some(record) = self.records.write().await.get_mut(file_id) {
            record.file_path = Some(path);
        }
    }

    pub async fn add_progress(&self, file_id: &str, bytes: u64) {
        if let Some(record) = self.records.write().await.get_mut(file_id) {
            record.bytes_transferred = record.bytes_transferred.saturating_add(bytes);
        }
    }

    /// Fail every live transfer with `peer_id`. Returns the affected IDs.
    pub async fn fail_peer(&self, peer_id: &str) -> Vec<String> {
        let failed: Vec<String> = {
            let mut records = self.records.write().await;
            records
                .values_mut()
                .filter(|r| r.peer_id == peer_id && !r.status.is_terminal())
                .map(|r| {
                    r.status = TransferStatus::Failed;
                    r.end_time = Some(Utc::now());
                    r.file_id.clone()
                })
                .collect()
        };
        if !failed.is_empty() {
            let mut sinks = self.sinks.lock().await;
            for file_id in &failed {
                sinks.remove(file_id);
            }
            info!("{} transfer(s) with {} failed: peer gone", failed.len(), peer_id);
        }
        failed
    }

    /// Attach the destination file. Refused once the record left `Transferring`.
    async fn open_sink(&self, file_id: &str, file: File) -> bool {
        let records = self.records.read().await;
        match records.get(file_id) {
            Some(r) if r.status == TransferStatus::Transferring => {
                self.sinks
                    .lock()
                    .await
                    .insert(file_id.to_string(), ReceiveSink { file, next_chunk: 0 });
                true
            }
            _ => false,
        }
    }

    /// Fail a live receive and close its file
    pub async fn abort_receive(&self, file_id: &str) -> bool {
        let failed = self.finish(file_id, TransferStatus::Failed).await;
        self.sinks.lock().await.remove(file_id);
        failed
    }

    /// Append one chunk of a receive from `peer_id`
    pub async fn apply_chunk(&self, peer_id: &str, chunk: &FileChunk) -> ChunkOutcome {
        let record = match self.get(&chunk.file_id).await {
            Some(r)
                if r.direction == Direction::Receive
                    && r.peer_id == peer_id
                    && r.status == TransferStatus::Transferring =>
            {
                r
            }
            _ => return ChunkOutcome::Ignored,
        };
        let received = record.bytes_transferred.saturating_add(chunk.data.len() as u64);

        let mut sinks = self.sinks.lock().await;
        let Some(sink) = sinks.get_mut(&chunk.file_id) else {
            return ChunkOutcome::Ignored;
        };

        let outcome = if chunk.chunk_num != sink.next_chunk {
            ChunkOutcome::Failed(format!(
                "expected chunk {}, got {}",
                sink.next_chunk, chunk.chunk_num
            ))
        } else if received > record.file_size {
            ChunkOutcome::Failed(format!(
                "{} bytes exceeds advertised size {}",
                received, record.file_size
            ))
        } else if let Err(e) = sink.file.write_all(&chunk.data).await {
            ChunkOutcome::Failed(e.to_string())
        } else {
            sink.next_chunk += 1;
            if chunk.is_last() {
                match sink.file.flush().await {
                    Ok(()) => ChunkOutcome::Completed,
                    Err(e) => ChunkOutcome::Failed(e.to_string()),
                }
            } else {
                ChunkOutcome::Written
            }
        };

        if outcome != ChunkOutcome::Written {
            sinks.remove(&chunk.file_id);
        }
        drop(sinks);

        match &outcome {
            ChunkOutcome::Written => {
                self.add_progress(&chunk.file_id, chunk.data.len() as u64).await;
            }
            ChunkOutcome::Completed => {
                self.add_progress(&chunk.file_id, chunk.data.len() as u64).await;
                self.finish(&chunk.file_id, TransferStatus::Completed).await;
            }
            ChunkOutcome::Failed(_) => {
                self.finish(&chunk.file_id, TransferStatus::Failed).await;
            }
            ChunkOutcome::Ignored => {}
        }
        outcome
    }
}

impl Default for TransferTable {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// HELPERS
// =============================================================================

/// `max(1, ceil(size / chunk_size))`: an empty file still sends one chunk
pub fn total_chunks(size: u64, chunk_size: usize) -> u64 {
    let chunk = chunk_size.max(1) as u64;
    size.div_ceil(chunk).max(1)
}

/// 16 hex characters
pub fn new_file_id() -> String {
    hex::encode(rand::random::<[u8; 8]>())
}

/// Keep only the final path component of a peer-supplied name
pub fn sanitize_file_name(name: &str) -> Option<String> {
    let last = name.rsplit(['/', '\\']).next().unwrap_or("");
    let cleaned: String = last.chars().filter(|c| !c.is_control()).collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        return None;
    }
    Some(cleaned.to_string())
}

/// `dir/name`, or `dir/stem-N.ext` if that exists
async fn unused_path(dir: &Path, name: &str) -> std::io::Result<PathBuf> {
    let candidate = dir.join(name);
    if !tokio::fs::try_exists(&candidate).await? {
        return Ok(candidate);
    }
    let path = Path::new(name);
    let stem = path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    let ext = path.extension().map(|e| e.to_string_lossy().into_owned());
    for n in 1..=MAX_NAME_SUFFIX {
        let file_name = match &ext {
            Some(ext) => format!("{}-{}.{}", stem, n, ext),
            None => format!("{}-{}", stem, n),
        };
        let candidate = dir.join(file_name);
        if !tokio::fs::try_exists(&candidate).await? {
            return Ok(candidate);
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::AlreadyExists,
        format!("no free name for {} in {}", name, dir.display()),
    ))
}

/// Fill `buf` from `file` until full or EOF
async fn read_full(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

// =============================================================================
// OPERATIONS
// =============================================================================

impl Network {
    /// Offer a local file to the peer called `target_name`. Returns the file ID.
    pub async fn request_file_send(
        &self,
        path: impl AsRef<Path>,
        target_name: &str,
    ) -> Result<String, NetError> {
        let path = path.as_ref();
        let peer = self
            .inner
            .peers
            .find_by_name(target_name)
            .await
            .ok_or_else(|| NetError::PeerNotFound(target_name.to_string()))?;

        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(NetError::NotAFile(path.to_path_buf()));
        }
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| NetError::NotAFile(path.to_path_buf()))?;

        let file_id = new_file_id();
        let now = Utc::now();
        let record = TransferRecord {
            file_id: file_id.clone(),
            file_name: file_name.clone(),
            file_path: Some(path.to_path_buf()),
            file_size: metadata.len(),
            bytes_transferred: 0,
            status: TransferStatus::Pending,
            direction: Direction::Send,
            peer_name: peer.name.clone(),
            peer_id: peer.id.clone(),
            start_time: now,
            end_time: None,
        };
        self.inner.transfers.insert(record).await;

        let request = FileTransferRequest {
            kind: "file_request".into(),
            file_id: file_id.clone(),
            file_name: file_name.clone(),
            file_size: metadata.len(),
            from: self.id().to_string(),
            to: peer.id.clone(),
            timestamp: now,
        };
        if let Err(e) = self.send_envelope(&peer.id, Envelope::file_request(self.id(), &request)).await {
            self.inner.transfers.finish(&file_id, TransferStatus::Failed).await;
            return Err(e);
        }

        info!(
            "Offered {} ({} bytes) to {} as {}",
            file_name,
            metadata.len(),
            peer.name,
            file_id
        );
        Ok(file_id)
    }

    /// Accept or reject a pending incoming offer
    pub async fn respond_to_file_transfer(&self, file_id: &str, accept: bool) -> Result<(), NetError> {
        let transfers = &self.inner.transfers;

        if !accept {
            let record = transfers
                .transition(file_id, Direction::Receive, TransferStatus::Pending, TransferStatus::Failed)
                .await?;
            info!("Rejected {} from {}", record.file_name, record.peer_name);
            self.emit(NetEvent::TransferFinished {
                file_id: file_id.to_string(),
                status: TransferStatus::Failed,
            });
            return self.send_file_response(&record.peer_id, file_id, false, "rejected").await;
        }

        let record = transfers
            .transition(
                file_id,
                Direction::Receive,
                TransferStatus::Pending,
                TransferStatus::Transferring,
            )
            .await?;

        match self.create_download(&record.file_name).await {
            Ok((path, file)) => {
                transfers.set_path(file_id, path.clone()).await;
                if !transfers.open_sink(file_id, file).await {
                    // Withdrawn by the sender while the file was being created
                    let _ = tokio::fs::remove_file(&path).await;
                    return Err(NetError::InvalidTransferState {
                        file_id: file_id.to_string(),
                        status: TransferStatus::Failed,
                        expected: TransferStatus::Pending,
                    });
                }
                info!("Accepted {} from {}, saving to {}", record.file_name, record.peer_name, path.display());
                self.send_file_response(&record.peer_id, file_id, true, "accepted").await
            }
            Err(e) => {
                warn!("Cannot save {}: {}", record.file_name, e);
                transfers.finish(file_id, TransferStatus::Failed).await;
                self.emit(NetEvent::TransferFinished {
                    file_id: file_id.to_string(),
                    status: TransferStatus::Failed,
                });
                // The sender still learns the offer is off
                if let Err(send_err) = self
                    .send_file_response(&record.peer_id, file_id, false, "receiver cannot save file")
                    .await
                {
                    debug!("Could not send rejection for {}: {}", file_id, send_err);
                }
                Err(e.into())
            }
        }
    }

    /// Withdraw an outgoing offer that has not been answered yet
    pub async fn cancel_transfer(&self, file_id: &str) -> Result<(), NetError> {
        let record = self
            .inner
            .transfers
            .transition(file_id, Direction::Send, TransferStatus::Pending, TransferStatus::Failed)
            .await?;
        info!("Cancelled offer of {} to {}", record.file_name, record.peer_name);
        self.emit(NetEvent::TransferFinished {
            file_id: file_id.to_string(),
            status: TransferStatus::Failed,
        });
        if let Err(e) = self
            .send_file_response(&record.peer_id, file_id, false, CANCELLED_MESSAGE)
            .await
        {
            debug!("Could not tell {} about cancelled {}: {}", record.peer_name, file_id, e);
        }
        Ok(())
    }

    pub async fn list_transfers(&self) -> Vec<TransferRecord> {
        self.inner.transfers.list().await
    }

    async fn create_download(&self, file_name: &str) -> std::io::Result<(PathBuf, File)> {
        let dir = &self.inner.config.download_dir;
        tokio::fs::create_dir_all(dir).await?;
        let path = unused_path(dir, file_name).await?;
        let file = File::create(&path).await?;
        Ok((path, file))
    }

    async fn send_file_response(
        &self,
        peer_id: &str,
        file_id: &str,
        accepted: bool,
        message: &str,
    ) -> Result<(), NetError> {
        let response = FileTransferResponse {
            kind: "file_response".into(),
            file_id: file_id.to_string(),
            accepted,
            message: message.to_string(),
            timestamp: Utc::now(),
        };
        self.send_envelope(peer_id, Envelope::file_response(self.id(), peer_id, &response))
            .await
    }

    // =========================================================================
    // DISPATCH HANDLERS
    // =========================================================================

    pub(crate) async fn on_file_request(&self, peer_id: &str, request: FileTransferRequest) {
        let Some(peer) = self.inner.peers.lookup(peer_id).await else {
            return;
        };
        let file_name = sanitize_file_name(&request.file_name)
            .unwrap_or_else(|| format!("download-{}", request.file_id));

        let record = TransferRecord {
            file_id: request.file_id.clone(),
            file_name,
            file_path: None,
            file_size: request.file_size,
            bytes_transferred: 0,
            status: TransferStatus::Pending,
            direction: Direction::Receive,
            peer_name: peer.name,
            peer_id: peer.id,
            start_time: Utc::now(),
            end_time: None,
        };

        if !self.inner.transfers.insert(record.clone()).await {
            debug!("Duplicate file_request {} from {}", request.file_id, peer_id);
            return;
        }
        info!(
            "{} offers {} ({} bytes) as {}",
            record.peer_name, record.file_name, record.file_size, record.file_id
        );
        self.emit(NetEvent::FileOffered(record));
    }

    pub(crate) async fn on_file_response(&self, peer_id: &str, response: FileTransferResponse) {
        let Some(record) = self.inner.transfers.get(&response.file_id).await else {
            debug!("file_response for unknown transfer {}", response.file_id);
            return;
        };
        if record.peer_id != peer_id {
            debug!("file_response for {} from wrong peer {}", response.file_id, peer_id);
            return;
        }
        if record.direction == Direction::Receive {
            self.on_offer_withdrawn(record, response).await;
            return;
        }

        let to = if response.accepted {
            TransferStatus::Transferring
        } else {
            TransferStatus::Failed
        };
        let record = match self
            .inner
            .transfers
            .transition(&response.file_id, Direction::Send, TransferStatus::Pending, to)
            .await
        {
            Ok(record) => record,
            Err(e) => {
                debug!("Ignoring file_response: {}", e);
                return;
            }
        };

        if !response.accepted {
            info!("{} declined {}: {}", record.peer_name, record.file_name, response.message);
            self.emit(NetEvent::TransferFinished {
                file_id: record.file_id,
                status: TransferStatus::Failed,
            });
            return;
        }

        info!("{} accepted {}, sending", record.peer_name, record.file_name);
        let net = self.clone();
        tokio::spawn(async move {
            net.stream_file(record).await;
        });
    }

    /// The sender took back an offer we hold, answered or not
    async fn on_offer_withdrawn(&self, record: TransferRecord, response: FileTransferResponse) {
        if response.accepted {
            debug!("Ignoring acceptance of our own incoming {}", record.file_id);
            return;
        }
        if self.inner.transfers.abort_receive(&record.file_id).await {
            info!("{} withdrew {}: {}", record.peer_name, record.file_name, response.message);
            self.emit(NetEvent::TransferFinished {
                file_id: record.file_id,
                status: TransferStatus::Failed,
            });
        }
    }

    pub(crate) async fn on_file_chunk(&self, peer_id: &str, chunk: FileChunk) {
        match self.inner.transfers.apply_chunk(peer_id, &chunk).await {
            ChunkOutcome::Written | ChunkOutcome::Ignored => {}
            ChunkOutcome::Completed => {
                info!("Received {} ({} chunks)", chunk.file_id, chunk.total_chunks);
                self.emit(NetEvent::TransferFinished {
                    file_id: chunk.file_id,
                    status: TransferStatus::Completed,
                });
            }
            ChunkOutcome::Failed(reason) => {
                warn!("Transfer {} failed: {}", chunk.file_id, reason);
                self.emit(NetEvent::TransferFinished {
                    file_id: chunk.file_id,
                    status: TransferStatus::Failed,
                });
            }
        }
    }

    // =========================================================================
    // STREAMING
    // =========================================================================

    async fn stream_file(self, record: TransferRecord) {
        let status = match self.send_chunks(&record).await {
            Ok(chunks) => {
                info!("Sent {} to {} in {} chunks", record.file_name, record.peer_name, chunks);
                TransferStatus::Completed
            }
            Err(e) => {
                warn!("Sending {} to {} failed: {}", record.file_name, record.peer_name, e);
                TransferStatus::Failed
            }
        };
        if self.inner.transfers.finish(&record.file_id, status).await {
            self.emit(NetEvent::TransferFinished {
                file_id: record.file_id,
                status,
            });
        }
    }

    async fn send_chunks(&self, record: &TransferRecord) -> Result<u64, NetError> {
        let path = record
            .file_path
            .as_ref()
            .ok_or_else(|| NetError::TransferNotFound(record.file_id.clone()))?;
        let mut file = File::open(path).await?;

        let chunk_size = self.inner.config.chunk_size.max(1);
        let total = total_chunks(record.file_size, chunk_size);
        let tx = self
            .inner
            .peers
            .with_peer(&record.peer_id, |p| p.tx.clone())
            .await
            .ok_or_else(|| NetError::PeerNotFound(record.peer_id.clone()))?;

        let mut buf = vec![0u8; chunk_size];
        for chunk_num in 0..total {
            if self.inner.shutdown.is_cancelled() {
                return Err(NetError::NotRunning);
            }
            let n = read_full(&mut file, &mut buf).await?;
            let chunk = FileChunk {
                kind: "file_chunk".into(),
                file_id: record.file_id.clone(),
                chunk_num,
                total_chunks: total,
                data: buf[..n].to_vec(),
                timestamp: Utc::now(),
                encrypted: false,
                nonce: None,
                ciphertext: None,
            };
            tx.send(Envelope::file_chunk(self.id(), &record.peer_id, &chunk).into())
                .await
                .map_err(|_| NetError::PeerGone(record.peer_id.clone()))?;
            self.inner.transfers.add_progress(&record.file_id, n as u64).await;
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        tx.send(Outbound::Flush(ack_tx))
            .await
            .map_err(|_| NetError::PeerGone(record.peer_id.clone()))?;
        ack_rx
            .await
            .map_err(|_| NetError::PeerGone(record.peer_id.clone()))?;
        Ok(total)
    }
}
