use async_trait::async_trait;
use flux_proto::{TransferFrame, CHUNK_SIZE};
use flux_transfer::{
    sha256_hex, ChannelTransport, FileDescriptor, FileReceiver, FileSender, MemoryEndpoint,
    MemoryLink, ReceivedFile, ReceiverConfig, SenderConfig, TransferError, TransferUpdate,
    TransportError,
};
use rand::RngCore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

fn descriptor(id: &str) -> FileDescriptor {
    FileDescriptor {
        transfer_id: id.to_string(),
        file_name: format!("{id}.bin"),
        file_type: "bin".to_string(),
    }
}

fn random_payload(len: usize) -> Vec<u8> {
    let mut payload = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut payload);
    payload
}

fn spawn_receiver(
    endpoint: MemoryEndpoint,
) -> (
    JoinHandle<Result<ReceivedFile, TransferError>>,
    mpsc::Receiver<TransferUpdate>,
) {
    let (updates_tx, updates_rx) = mpsc::channel(1024);
    let MemoryEndpoint { link, mut events } = endpoint;
    let handle = tokio::spawn(async move {
        let receiver = FileReceiver::new(ReceiverConfig::default(), updates_tx);
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        receiver.receive(link.as_ref(), &mut events, cancel_rx).await
    });
    (handle, updates_rx)
}

fn drain(mut updates: mpsc::Receiver<TransferUpdate>) -> Vec<TransferUpdate> {
    let mut collected = Vec::new();
    while let Ok(update) = updates.try_recv() {
        collected.push(update);
    }
    collected
}

fn assert_progress_monotone(updates: &[TransferUpdate], total: u64) {
    let mut previous = 0u64;
    for update in updates {
        if let TransferUpdate::Progress { transferred, .. } = update {
            assert!(
                *transferred >= previous,
                "progress regressed: {transferred} < {previous}"
            );
            assert!(*transferred <= total);
            previous = *transferred;
        }
    }
}

/// Transport wrapper that lets a test rewrite, drop, or duplicate frames in
/// flight; each outbound payload maps to zero or more forwarded payloads.
struct RewriteLink<F> {
    inner: Arc<MemoryLink>,
    rewrite: F,
}

#[async_trait]
impl<F> ChannelTransport for RewriteLink<F>
where
    F: Fn(usize, Vec<u8>) -> Vec<Vec<u8>> + Send + Sync,
{
    fn channel_count(&self) -> usize {
        self.inner.channel_count()
    }

    async fn send(&self, channel: usize, payload: Vec<u8>) -> Result<(), TransportError> {
        for forwarded in (self.rewrite)(channel, payload) {
            self.inner.send(channel, forwarded).await?;
        }
        Ok(())
    }

    fn buffered_amount(&self, channel: usize) -> u64 {
        self.inner.buffered_amount(channel)
    }

    fn total_buffered_amount(&self) -> u64 {
        self.inner.total_buffered_amount()
    }
}

#[tokio::test]
async fn full_transfer_across_four_channels() {
    let payload = random_payload(10 * 1024 * 1024);
    let expected_checksum = sha256_hex(&payload);
    let (sender_end, receiver_end) = MemoryLink::pair(4, "full");
    let (receiver_handle, receiver_updates) = spawn_receiver(receiver_end);

    // Every frame must respect channel discipline: control on channel 0,
    // chunk index modulo the fan-out.
    let checked = RewriteLink {
        inner: Arc::clone(&sender_end.link),
        rewrite: |channel: usize, payload: Vec<u8>| {
            match TransferFrame::decode(&payload).expect("sender emits valid frames") {
                TransferFrame::Chunk { index, .. } => {
                    assert_eq!(channel, index as usize % 4, "chunk {index} off its channel")
                }
                _ => assert_eq!(channel, 0, "control frame off channel 0"),
            }
            vec![payload]
        },
    };

    let (updates_tx, sender_updates) = mpsc::channel(1024);
    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let sender = FileSender::new(SenderConfig::default(), updates_tx);
    let mut events = sender_end.events;
    sender
        .send_bytes(
            &checked,
            &mut events,
            cancel_rx,
            &descriptor("t-full"),
            &payload,
        )
        .await
        .expect("sender completes");

    let received = receiver_handle
        .await
        .unwrap()
        .expect("receiver completes");
    assert_eq!(received.size, payload.len() as u64);
    assert_eq!(received.checksum, expected_checksum);
    let persisted = tokio::fs::read(&received.path).await.unwrap();
    assert_eq!(sha256_hex(&persisted), expected_checksum);
    assert_eq!(persisted.len(), payload.len());

    let sender_updates = drain(sender_updates);
    let receiver_updates = drain(receiver_updates);
    assert_progress_monotone(&sender_updates, payload.len() as u64);
    assert_progress_monotone(&receiver_updates, payload.len() as u64);
    assert_eq!(sender_updates.last(), Some(&TransferUpdate::Completed));
    assert_eq!(receiver_updates.last(), Some(&TransferUpdate::Completed));

    tokio::fs::remove_file(&received.path).await.ok();
}

#[tokio::test]
async fn zero_byte_transfer_sends_only_metadata_and_complete() {
    let (sender_end, receiver_end) = MemoryLink::pair(4, "zero");
    let (receiver_handle, _receiver_updates) = spawn_receiver(receiver_end);

    let chunk_frames = Arc::new(std::sync::atomic::AtomicU32::new(0));
    let counter = Arc::clone(&chunk_frames);
    let counting = RewriteLink {
        inner: Arc::clone(&sender_end.link),
        rewrite: move |_channel, payload: Vec<u8>| {
            if matches!(
                TransferFrame::decode(&payload),
                Ok(TransferFrame::Chunk { .. })
            ) {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
            vec![payload]
        },
    };

    let (updates_tx, _updates_rx) = mpsc::channel(64);
    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let sender = FileSender::new(SenderConfig::default(), updates_tx);
    let mut events = sender_end.events;
    sender
        .send_bytes(&counting, &mut events, cancel_rx, &descriptor("t-zero"), &[])
        .await
        .expect("zero-byte transfer succeeds");

    let received = receiver_handle.await.unwrap().expect("receiver completes");
    assert_eq!(received.size, 0);
    assert_eq!(
        chunk_frames.load(std::sync::atomic::Ordering::SeqCst),
        0,
        "zero-byte payload must produce no chunk frames"
    );
    let persisted = tokio::fs::read(&received.path).await.unwrap();
    assert!(persisted.is_empty());
    tokio::fs::remove_file(&received.path).await.ok();
}

#[tokio::test]
async fn exact_multiple_produces_no_partial_tail() {
    let payload = random_payload(2 * CHUNK_SIZE);
    let (sender_end, receiver_end) = MemoryLink::pair(4, "exact");
    let (receiver_handle, _updates) = spawn_receiver(receiver_end);

    let sizes = Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen = Arc::clone(&sizes);
    let counting = RewriteLink {
        inner: Arc::clone(&sender_end.link),
        rewrite: move |_channel, payload: Vec<u8>| {
            if let Ok(TransferFrame::Chunk { data, .. }) = TransferFrame::decode(&payload) {
                seen.lock().unwrap().push(data.len());
            }
            vec![payload]
        },
    };

    let (updates_tx, _updates_rx) = mpsc::channel(64);
    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let sender = FileSender::new(SenderConfig::default(), updates_tx);
    let mut events = sender_end.events;
    sender
        .send_bytes(
            &counting,
            &mut events,
            cancel_rx,
            &descriptor("t-exact"),
            &payload,
        )
        .await
        .unwrap();

    let received = receiver_handle.await.unwrap().unwrap();
    assert_eq!(received.size, payload.len() as u64);
    let sizes = sizes.lock().unwrap();
    assert_eq!(sizes.as_slice(), &[CHUNK_SIZE, CHUNK_SIZE]);
    tokio::fs::remove_file(&received.path).await.ok();
}

#[tokio::test]
async fn corrupted_chunk_fails_with_checksum_mismatch() {
    let payload = random_payload(5 * CHUNK_SIZE);
    let (sender_end, receiver_end) = MemoryLink::pair(4, "corrupt");
    let (receiver_handle, receiver_updates) = spawn_receiver(receiver_end);

    let tampering = RewriteLink {
        inner: Arc::clone(&sender_end.link),
        rewrite: |_channel, payload: Vec<u8>| {
            if let Ok(TransferFrame::Chunk { index: 1, data }) = TransferFrame::decode(&payload) {
                let zeroed = TransferFrame::Chunk {
                    index: 1,
                    data: vec![0u8; data.len()],
                };
                return vec![zeroed.encode().unwrap()];
            }
            vec![payload]
        },
    };

    let (updates_tx, sender_updates) = mpsc::channel(64);
    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let sender = FileSender::new(SenderConfig::default(), updates_tx);
    let mut events = sender_end.events;
    let result = sender
        .send_bytes(
            &tampering,
            &mut events,
            cancel_rx,
            &descriptor("t-corrupt"),
            &payload,
        )
        .await;
    assert_eq!(
        result,
        Err(TransferError::Rejected("Checksum mismatch".to_string()))
    );

    let receiver_result = receiver_handle.await.unwrap();
    assert_eq!(receiver_result, Err(TransferError::ChecksumMismatch));
    let sender_updates = drain(sender_updates);
    assert_eq!(
        sender_updates.last(),
        Some(&TransferUpdate::Failed("Checksum mismatch".to_string()))
    );
    let receiver_updates = drain(receiver_updates);
    assert_eq!(
        receiver_updates.last(),
        Some(&TransferUpdate::Failed("Checksum mismatch".to_string()))
    );
}

#[tokio::test]
async fn dropped_chunk_reports_smallest_missing_index() {
    let payload = random_payload(5 * CHUNK_SIZE);
    let (sender_end, receiver_end) = MemoryLink::pair(4, "drop");
    let (receiver_handle, _updates) = spawn_receiver(receiver_end);

    let dropping = RewriteLink {
        inner: Arc::clone(&sender_end.link),
        rewrite: |_channel, payload: Vec<u8>| {
            if let Ok(TransferFrame::Chunk { index: 2, .. }) = TransferFrame::decode(&payload) {
                return Vec::new();
            }
            vec![payload]
        },
    };

    let (updates_tx, _updates_rx) = mpsc::channel(64);
    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let sender = FileSender::new(SenderConfig::default(), updates_tx);
    let mut events = sender_end.events;
    let result = sender
        .send_bytes(
            &dropping,
            &mut events,
            cancel_rx,
            &descriptor("t-drop"),
            &payload,
        )
        .await;
    assert_eq!(
        result,
        Err(TransferError::Rejected("Missing chunk 2".to_string()))
    );
    assert_eq!(
        receiver_handle.await.unwrap(),
        Err(TransferError::MissingChunk(2))
    );
}

#[tokio::test]
async fn duplicate_chunk_first_occurrence_wins() {
    let payload = random_payload(3 * CHUNK_SIZE);
    let expected_checksum = sha256_hex(&payload);
    let (sender_end, receiver_end) = MemoryLink::pair(4, "dup");
    let (receiver_handle, _updates) = spawn_receiver(receiver_end);

    // Chunk 0 arrives twice, the replay carrying garbage; the first copy
    // must win.
    let duplicating = RewriteLink {
        inner: Arc::clone(&sender_end.link),
        rewrite: |_channel, payload: Vec<u8>| {
            if let Ok(TransferFrame::Chunk { index: 0, data }) = TransferFrame::decode(&payload) {
                let replay = TransferFrame::Chunk {
                    index: 0,
                    data: vec![0xaa; data.len()],
                };
                return vec![payload, replay.encode().unwrap()];
            }
            vec![payload]
        },
    };

    let (updates_tx, _updates_rx) = mpsc::channel(64);
    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let sender = FileSender::new(SenderConfig::default(), updates_tx);
    let mut events = sender_end.events;
    sender
        .send_bytes(
            &duplicating,
            &mut events,
            cancel_rx,
            &descriptor("t-dup"),
            &payload,
        )
        .await
        .expect("duplicates are tolerated");

    let received = receiver_handle.await.unwrap().unwrap();
    assert_eq!(received.checksum, expected_checksum);
    tokio::fs::remove_file(&received.path).await.ok();
}

#[tokio::test]
async fn local_cancel_tears_down_both_sides() {
    let payload = random_payload(64 * 16 * 1024);
    let (sender_end, receiver_end) =
        MemoryLink::pair_with_pacing(4, "cancel", Some(Duration::from_millis(10)));
    let (receiver_handle, receiver_updates) = spawn_receiver(receiver_end);

    let (updates_tx, sender_updates) = mpsc::channel(1024);
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let config = SenderConfig {
        chunk_size: 16 * 1024,
        high_watermark: 64 * 1024,
        low_watermark: 16 * 1024,
    };
    let sender = FileSender::new(config, updates_tx);
    let link = Arc::clone(&sender_end.link);
    let mut events = sender_end.events;

    let cancel_trigger = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(60)).await;
        let _ = cancel_tx.send(true);
        cancel_tx
    });

    let result = sender
        .send_bytes(
            link.as_ref(),
            &mut events,
            cancel_rx,
            &descriptor("t-cancel"),
            &payload,
        )
        .await;
    assert_eq!(result, Err(TransferError::Cancelled));
    assert_eq!(
        receiver_handle.await.unwrap(),
        Err(TransferError::Cancelled)
    );
    assert_eq!(drain(sender_updates).last(), Some(&TransferUpdate::Cancelled));
    assert_eq!(
        drain(receiver_updates).last(),
        Some(&TransferUpdate::Cancelled)
    );
    cancel_trigger.await.unwrap();
}

#[tokio::test]
async fn backpressure_bounds_buffered_bytes() {
    let chunk_size = 8 * 1024;
    let high = 32 * 1024u64;
    let payload = random_payload(64 * chunk_size);
    let (sender_end, receiver_end) =
        MemoryLink::pair_with_pacing(4, "bp", Some(Duration::from_millis(1)));
    let (receiver_handle, _updates) = spawn_receiver(receiver_end);

    let (updates_tx, _updates_rx) = mpsc::channel(1024);
    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let config = SenderConfig {
        chunk_size,
        high_watermark: high,
        low_watermark: 16 * 1024,
    };
    let sender = FileSender::new(config, updates_tx);
    let link = Arc::clone(&sender_end.link);
    let mut events = sender_end.events;
    sender
        .send_bytes(
            link.as_ref(),
            &mut events,
            cancel_rx,
            &descriptor("t-bp"),
            &payload,
        )
        .await
        .expect("paced transfer completes");

    let received = receiver_handle.await.unwrap().unwrap();
    assert_eq!(received.size, payload.len() as u64);
    let bound = high + (chunk_size as u64) * 4;
    assert!(
        link.peak_buffered_amount() <= bound,
        "peak {} exceeded bound {}",
        link.peak_buffered_amount(),
        bound
    );
    tokio::fs::remove_file(&received.path).await.ok();
}
