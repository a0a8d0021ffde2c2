//! End-to-end transfers over an in-memory loopback wire
//!
//! Each test runs a real sender engine against a real receiver engine
//! on the same runtime, optionally through a byte-level proxy that
//! injects faults.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serimodem::{
    loopback_pair, DiskStore, LoopbackChannel, MemoryStore, ProtocolFlavor, SessionEvent,
    SessionState, Transfer, TransferConfig, WireChannel, XmodemFlavor, YmodemFlavor,
    ZmodemFlavor,
};
use std::path::{Path, PathBuf};
use std::time::Duration;

const CPMEOF: u8 = 0x1A;
const CAN: u8 = 0x18;

/// Config tightened so a failing exchange surfaces quickly.
fn test_config() -> TransferConfig {
    TransferConfig {
        timeout: Duration::from_secs(2),
        handshake_interval: Duration::from_millis(200),
        drain_quiet: Duration::from_millis(100),
        ..TransferConfig::default()
    }
}

fn seeded_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen()).collect()
}

/// Run a sender and a receiver to their terminal states.
async fn run_pair(
    sender: Transfer,
    receiver: Transfer,
    sender_store: MemoryStore,
    receiver_store: MemoryStore,
) -> (SessionState, SessionState) {
    let (mut tx_chan, mut rx_chan) = loopback_pair(16);
    let send_task = tokio::spawn(async move { sender.run(&mut tx_chan, &sender_store).await });
    let recv_task = tokio::spawn(async move { receiver.run(&mut rx_chan, &receiver_store).await });
    (send_task.await.unwrap(), recv_task.await.unwrap())
}

/// Forward bytes between two proxy ends, letting `tap` rewrite the
/// sender-to-receiver direction byte by byte.
fn spawn_proxy(
    mut from_sender: LoopbackChannel,
    mut from_receiver: LoopbackChannel,
    mut tap: impl FnMut(usize, u8) -> Vec<u8> + Send + 'static,
) {
    tokio::spawn(async move {
        let mut count = 0usize;
        loop {
            let mut moved = false;
            loop {
                match from_sender.read_byte(Duration::from_millis(1)).await {
                    Ok(byte) => {
                        for out in tap(count, byte) {
                            if from_receiver.write_all(&[out]).await.is_err() {
                                return;
                            }
                        }
                        count += 1;
                        moved = true;
                    }
                    Err(serimodem::WireError::Timeout) => break,
                    Err(_) => return,
                }
            }
            if from_receiver.flush().await.is_err() {
                return;
            }
            loop {
                match from_receiver.read_byte(Duration::from_millis(1)).await {
                    Ok(byte) => {
                        if from_sender.write_all(&[byte]).await.is_err() {
                            return;
                        }
                        moved = true;
                    }
                    Err(serimodem::WireError::Timeout) => break,
                    Err(_) => return,
                }
            }
            if from_sender.flush().await.is_err() {
                return;
            }
            if !moved {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }
    });
}

#[tokio::test]
async fn xmodem_crc_clean_transfer() {
    let sender_store = MemoryStore::new();
    sender_store.insert("/src/data.bin", vec![0u8; 1024]);
    let receiver_store = MemoryStore::new();

    let sender = Transfer::upload(
        ProtocolFlavor::Xmodem(XmodemFlavor::Crc),
        vec![PathBuf::from("/src/data.bin")],
        test_config(),
    )
    .unwrap();
    let receiver = Transfer::download_named(
        ProtocolFlavor::Xmodem(XmodemFlavor::Crc),
        PathBuf::from("/dl"),
        "data.bin",
        test_config(),
    )
    .unwrap();

    let recv_session = receiver.session();
    let mut progress = recv_session.subscribe();

    let (s_state, r_state) =
        run_pair(sender, receiver, sender_store, receiver_store.clone()).await;
    assert_eq!(s_state, SessionState::End);
    assert_eq!(r_state, SessionState::End);

    let got = receiver_store.get(Path::new("/dl/data.bin")).unwrap();
    assert_eq!(got, vec![0u8; 1024]);
    assert_eq!(recv_session.bytes_transferred(), 1024);
    assert_eq!(recv_session.current_file().unwrap().errors, 0);

    // Counters observed by subscribers never decrease.
    let mut last = 0u64;
    while let Ok(event) = progress.try_recv() {
        if let SessionEvent::Progress {
            bytes_transferred, ..
        } = event
        {
            assert!(bytes_transferred >= last);
            last = bytes_transferred;
        }
    }
}

#[tokio::test]
async fn xmodem_vanilla_pads_short_file() {
    let sender_store = MemoryStore::new();
    sender_store.insert("/src/short.bin", b"one hundred bytes of payload".to_vec());
    let receiver_store = MemoryStore::new();

    let sender = Transfer::upload(
        ProtocolFlavor::Xmodem(XmodemFlavor::Vanilla),
        vec![PathBuf::from("/src/short.bin")],
        test_config(),
    )
    .unwrap();
    let receiver = Transfer::download_named(
        ProtocolFlavor::Xmodem(XmodemFlavor::Vanilla),
        PathBuf::from("/dl"),
        "short.bin",
        test_config(),
    )
    .unwrap();

    let (s_state, r_state) =
        run_pair(sender, receiver, sender_store, receiver_store.clone()).await;
    assert_eq!(s_state, SessionState::End);
    assert_eq!(r_state, SessionState::End);

    // Pure XMODEM cannot know the size: the file keeps its CPMEOF
    // padding out to the block boundary.
    let got = receiver_store.get(Path::new("/dl/short.bin")).unwrap();
    assert_eq!(got.len(), 128);
    assert_eq!(&got[..28], b"one hundred bytes of payload");
    assert!(got[28..].iter().all(|&b| b == CPMEOF));
}

#[tokio::test]
async fn xmodem_1k_g_streams_without_acks() {
    let payload = seeded_bytes(10 * 1024, 7);
    let sender_store = MemoryStore::new();
    sender_store.insert("/src/stream.bin", payload.clone());
    let receiver_store = MemoryStore::new();

    let sender = Transfer::upload(
        ProtocolFlavor::Xmodem(XmodemFlavor::OneKG),
        vec![PathBuf::from("/src/stream.bin")],
        test_config(),
    )
    .unwrap();
    let receiver = Transfer::download_named(
        ProtocolFlavor::Xmodem(XmodemFlavor::OneKG),
        PathBuf::from("/dl"),
        "stream.bin",
        test_config(),
    )
    .unwrap();

    let (s_state, r_state) =
        run_pair(sender, receiver, sender_store, receiver_store.clone()).await;
    assert_eq!(s_state, SessionState::End);
    assert_eq!(r_state, SessionState::End);

    let got = receiver_store.get(Path::new("/dl/stream.bin")).unwrap();
    assert_eq!(got, payload); // exact multiple of 1K, no padding
}

#[tokio::test]
async fn xmodem_sequence_wraps_past_255() {
    // 320 blocks of 128 bytes: the sequence byte wraps 255 -> 0.
    let payload = seeded_bytes(320 * 128, 11);
    let sender_store = MemoryStore::new();
    sender_store.insert("/src/long.bin", payload.clone());
    let receiver_store = MemoryStore::new();

    let sender = Transfer::upload(
        ProtocolFlavor::Xmodem(XmodemFlavor::Crc),
        vec![PathBuf::from("/src/long.bin")],
        test_config(),
    )
    .unwrap();
    let receiver = Transfer::download_named(
        ProtocolFlavor::Xmodem(XmodemFlavor::Crc),
        PathBuf::from("/dl"),
        "long.bin",
        test_config(),
    )
    .unwrap();

    let (s_state, r_state) =
        run_pair(sender, receiver, sender_store, receiver_store.clone()).await;
    assert_eq!(s_state, SessionState::End);
    assert_eq!(r_state, SessionState::End);
    assert_eq!(
        receiver_store.get(Path::new("/dl/long.bin")).unwrap(),
        payload
    );
}

#[tokio::test]
async fn xmodem_crc_recovers_from_bit_flip() {
    let payload = seeded_bytes(8 * 128, 13);
    let sender_store = MemoryStore::new();
    sender_store.insert("/src/flip.bin", payload.clone());
    let receiver_store = MemoryStore::new();

    let sender = Transfer::upload(
        ProtocolFlavor::Xmodem(XmodemFlavor::Crc),
        vec![PathBuf::from("/src/flip.bin")],
        test_config(),
    )
    .unwrap();
    let receiver = Transfer::download_named(
        ProtocolFlavor::Xmodem(XmodemFlavor::Crc),
        PathBuf::from("/dl"),
        "flip.bin",
        test_config(),
    )
    .unwrap();
    let recv_session = receiver.session();

    let (mut tx_chan, tx_proxy) = loopback_pair(16);
    let (mut rx_chan, rx_proxy) = loopback_pair(16);

    // Flip one payload bit inside block 3 (each block is 133 bytes on
    // the wire), once.
    let corrupt_at = 2 * 133 + 40;
    let mut done = false;
    spawn_proxy(tx_proxy, rx_proxy, move |index, byte| {
        if index == corrupt_at && !done {
            done = true;
            vec![byte ^ 0x01]
        } else {
            vec![byte]
        }
    });

    let s_store = sender_store.clone();
    let r_store = receiver_store.clone();
    let send_task = tokio::spawn(async move { sender.run(&mut tx_chan, &s_store).await });
    let recv_task = tokio::spawn(async move { receiver.run(&mut rx_chan, &r_store).await });

    assert_eq!(send_task.await.unwrap(), SessionState::End);
    assert_eq!(recv_task.await.unwrap(), SessionState::End);

    assert_eq!(
        receiver_store.get(Path::new("/dl/flip.bin")).unwrap(),
        payload
    );
    // One NAK/retransmit cycle was charged to the file.
    assert_eq!(recv_session.current_file().unwrap().errors, 1);
}

#[tokio::test]
async fn xmodem_remote_cancel_mid_transfer() {
    // Scripted peer: handshakes in CRC mode, ACKs four blocks, then
    // aborts with CAN CAN during block 5.
    let payload = seeded_bytes(8 * 128, 17);
    let sender_store = MemoryStore::new();
    sender_store.insert("/src/abort.bin", payload);

    let sender = Transfer::upload(
        ProtocolFlavor::Xmodem(XmodemFlavor::Crc),
        vec![PathBuf::from("/src/abort.bin")],
        test_config(),
    )
    .unwrap();
    let send_session = sender.session();

    let (mut tx_chan, mut peer) = loopback_pair(16);
    let peer_task = tokio::spawn(async move {
        peer.write_all(b"C").await.unwrap();
        peer.flush().await.unwrap();
        let timeout = Duration::from_secs(5);
        for block in 0..5 {
            let mut packet = [0u8; 133];
            peer.read_exact(&mut packet, timeout).await.unwrap();
            if block < 4 {
                peer.write_all(&[0x06]).await.unwrap(); // ACK
            } else {
                peer.write_all(&[CAN, CAN]).await.unwrap();
            }
            peer.flush().await.unwrap();
        }
        // Hold the channel open so the sender sees the CANs rather
        // than a closed pipe.
        tokio::time::sleep(Duration::from_secs(2)).await;
    });

    let state = sender.run(&mut tx_chan, &sender_store).await;
    assert_eq!(state, SessionState::Abort);
    let last = send_session.last_message().unwrap();
    assert!(last.is_error());
    assert!(last.text.contains("RemoteCancel"));
    peer_task.await.unwrap();
}

#[tokio::test]
async fn ymodem_batch_of_two_files() {
    let b_payload = seeded_bytes(256, 23);
    let send_dir = tempfile::tempdir().unwrap();
    let recv_dir = tempfile::tempdir().unwrap();
    let a_path = send_dir.path().join("a.txt");
    let b_path = send_dir.path().join("b.bin");
    std::fs::write(&a_path, b"hello").unwrap();
    std::fs::write(&b_path, &b_payload).unwrap();

    let sender = Transfer::upload(
        ProtocolFlavor::Ymodem(YmodemFlavor::Vanilla),
        vec![a_path, b_path],
        test_config(),
    )
    .unwrap();
    let receiver = Transfer::download(
        ProtocolFlavor::Ymodem(YmodemFlavor::Vanilla),
        recv_dir.path().to_path_buf(),
        test_config(),
    )
    .unwrap();

    let recv_session = receiver.session();
    let mut events = recv_session.subscribe();

    let (mut tx_chan, mut rx_chan) = loopback_pair(16);
    let store = DiskStore::new();
    let send_task = tokio::spawn(async move { sender.run(&mut tx_chan, &store).await });
    let recv_task = tokio::spawn(async move { receiver.run(&mut rx_chan, &store).await });
    assert_eq!(send_task.await.unwrap(), SessionState::End);
    assert_eq!(recv_task.await.unwrap(), SessionState::End);

    // Declared sizes survive the block padding.
    assert_eq!(
        std::fs::read(recv_dir.path().join("a.txt")).unwrap(),
        b"hello"
    );
    assert_eq!(
        std::fs::read(recv_dir.path().join("b.bin")).unwrap(),
        b_payload
    );

    let mut file_done = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, SessionEvent::StateChanged(SessionState::FileDone)) {
            file_done += 1;
        }
    }
    assert_eq!(file_done, 2);
    assert_eq!(recv_session.files().len(), 2);
}

#[tokio::test]
async fn ymodem_empty_file() {
    let sender_store = MemoryStore::new();
    sender_store.insert("/src/empty.dat", Vec::new());
    let receiver_store = MemoryStore::new();

    let sender = Transfer::upload(
        ProtocolFlavor::Ymodem(YmodemFlavor::Vanilla),
        vec![PathBuf::from("/src/empty.dat")],
        test_config(),
    )
    .unwrap();
    let receiver = Transfer::download(
        ProtocolFlavor::Ymodem(YmodemFlavor::Vanilla),
        PathBuf::from("/dl"),
        test_config(),
    )
    .unwrap();
    let recv_session = receiver.session();

    let (s_state, r_state) =
        run_pair(sender, receiver, sender_store, receiver_store.clone()).await;
    assert_eq!(s_state, SessionState::End);
    assert_eq!(r_state, SessionState::End);

    let got = receiver_store.get(Path::new("/dl/empty.dat")).unwrap();
    assert!(got.is_empty());
    assert_eq!(recv_session.current_file().unwrap().size, 0);
}

#[tokio::test]
async fn ymodem_g_round_trip() {
    let payload = seeded_bytes(5000, 29);
    let sender_store = MemoryStore::new();
    sender_store.insert("/src/g.bin", payload.clone());
    let receiver_store = MemoryStore::new();

    let sender = Transfer::upload(
        ProtocolFlavor::Ymodem(YmodemFlavor::G),
        vec![PathBuf::from("/src/g.bin")],
        test_config(),
    )
    .unwrap();
    let receiver = Transfer::download(
        ProtocolFlavor::Ymodem(YmodemFlavor::G),
        PathBuf::from("/dl"),
        test_config(),
    )
    .unwrap();

    let (s_state, r_state) =
        run_pair(sender, receiver, sender_store, receiver_store.clone()).await;
    assert_eq!(s_state, SessionState::End);
    assert_eq!(r_state, SessionState::End);
    assert_eq!(receiver_store.get(Path::new("/dl/g.bin")).unwrap(), payload);
}

#[tokio::test]
async fn zmodem_round_trip_crc32() {
    let payload = seeded_bytes(100 * 1024 + 37, 31);
    let sender_store = MemoryStore::new();
    sender_store.insert("/src/z.bin", payload.clone());
    let receiver_store = MemoryStore::new();

    let sender = Transfer::upload(
        ProtocolFlavor::Zmodem(ZmodemFlavor::Crc32),
        vec![PathBuf::from("/src/z.bin")],
        test_config(),
    )
    .unwrap();
    let receiver = Transfer::download(
        ProtocolFlavor::Zmodem(ZmodemFlavor::Crc32),
        PathBuf::from("/dl"),
        test_config(),
    )
    .unwrap();

    let (s_state, r_state) =
        run_pair(sender, receiver, sender_store, receiver_store.clone()).await;
    assert_eq!(s_state, SessionState::End);
    assert_eq!(r_state, SessionState::End);
    assert_eq!(receiver_store.get(Path::new("/dl/z.bin")).unwrap(), payload);
}

#[tokio::test]
async fn zmodem_round_trip_crc16() {
    let payload = seeded_bytes(20 * 1024, 37);
    let sender_store = MemoryStore::new();
    sender_store.insert("/src/z16.bin", payload.clone());
    let receiver_store = MemoryStore::new();

    let sender = Transfer::upload(
        ProtocolFlavor::Zmodem(ZmodemFlavor::Vanilla),
        vec![PathBuf::from("/src/z16.bin")],
        test_config(),
    )
    .unwrap();
    let receiver = Transfer::download(
        ProtocolFlavor::Zmodem(ZmodemFlavor::Vanilla),
        PathBuf::from("/dl"),
        test_config(),
    )
    .unwrap();

    let (s_state, r_state) =
        run_pair(sender, receiver, sender_store, receiver_store.clone()).await;
    assert_eq!(s_state, SessionState::End);
    assert_eq!(r_state, SessionState::End);
    assert_eq!(receiver_store.get(Path::new("/dl/z16.bin")).unwrap(), payload);
}

#[tokio::test]
async fn zmodem_batch_of_two_files() {
    let one = seeded_bytes(3000, 41);
    let two = seeded_bytes(1024, 43);
    let sender_store = MemoryStore::new();
    sender_store.insert("/src/one.bin", one.clone());
    sender_store.insert("/src/two.bin", two.clone());
    let receiver_store = MemoryStore::new();

    let sender = Transfer::upload(
        ProtocolFlavor::Zmodem(ZmodemFlavor::Crc32),
        vec![PathBuf::from("/src/one.bin"), PathBuf::from("/src/two.bin")],
        test_config(),
    )
    .unwrap();
    let receiver = Transfer::download(
        ProtocolFlavor::Zmodem(ZmodemFlavor::Crc32),
        PathBuf::from("/dl"),
        test_config(),
    )
    .unwrap();

    let (s_state, r_state) =
        run_pair(sender, receiver, sender_store, receiver_store.clone()).await;
    assert_eq!(s_state, SessionState::End);
    assert_eq!(r_state, SessionState::End);
    assert_eq!(receiver_store.get(Path::new("/dl/one.bin")).unwrap(), one);
    assert_eq!(receiver_store.get(Path::new("/dl/two.bin")).unwrap(), two);
}

#[tokio::test]
async fn zmodem_resumes_partial_download() {
    let payload = seeded_bytes(8192, 47);
    let send_dir = tempfile::tempdir().unwrap();
    let recv_dir = tempfile::tempdir().unwrap();
    let src = send_dir.path().join("big.bin");
    std::fs::write(&src, &payload).unwrap();
    // An earlier attempt left the first half on disk.
    std::fs::write(recv_dir.path().join("big.bin"), &payload[..4096]).unwrap();

    let sender = Transfer::upload(
        ProtocolFlavor::Zmodem(ZmodemFlavor::Crc32),
        vec![src],
        test_config(),
    )
    .unwrap();
    let receiver = Transfer::download(
        ProtocolFlavor::Zmodem(ZmodemFlavor::Crc32),
        recv_dir.path().to_path_buf(),
        test_config(),
    )
    .unwrap();
    let recv_session = receiver.session();

    let (mut tx_chan, mut rx_chan) = loopback_pair(16);
    let store = DiskStore::new();
    let send_task = tokio::spawn(async move { sender.run(&mut tx_chan, &store).await });
    let recv_task = tokio::spawn(async move { receiver.run(&mut rx_chan, &store).await });
    assert_eq!(send_task.await.unwrap(), SessionState::End);
    assert_eq!(recv_task.await.unwrap(), SessionState::End);

    assert_eq!(
        std::fs::read(recv_dir.path().join("big.bin")).unwrap(),
        payload
    );
    // The receiver asked to restart at the existing length.
    assert!((0..recv_session.message_count())
        .filter_map(|i| recv_session.message(i))
        .any(|m| m.text.contains("resuming") && m.text.contains("4096")));
}

#[tokio::test]
async fn zmodem_local_cancel_keeps_partial() {
    let payload = seeded_bytes(256 * 1024, 53);
    let sender_store = MemoryStore::new();
    sender_store.insert("/src/cancel.bin", payload.clone());
    let receiver_store = MemoryStore::new();

    let sender = Transfer::upload(
        ProtocolFlavor::Zmodem(ZmodemFlavor::Crc32),
        vec![PathBuf::from("/src/cancel.bin")],
        test_config(),
    )
    .unwrap();
    let receiver = Transfer::download(
        ProtocolFlavor::Zmodem(ZmodemFlavor::Crc32),
        PathBuf::from("/dl"),
        test_config(),
    )
    .unwrap();
    let recv_session = receiver.session();

    // Observer: cancel once half the file is through.
    {
        let session = recv_session.clone();
        let mut events = session.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SessionEvent::Progress {
                        bytes_transferred, ..
                    }) if bytes_transferred >= 128 * 1024 => {
                        session.cancel_transfer(true);
                        return;
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                        // Fell behind the engine; the flag matters, not
                        // the exact event, so just keep reading.
                    }
                    Err(_) => return,
                }
            }
        });
    }

    let started = std::time::Instant::now();
    let (_, r_state) = run_pair(sender, receiver, sender_store, receiver_store.clone()).await;
    assert_eq!(r_state, SessionState::Abort);
    assert!(started.elapsed() < Duration::from_secs(10));

    let last = recv_session.last_message().unwrap();
    assert!(last.text.contains("LocalCancel"));

    // keep_partial: the half-written file survives and matches the
    // source prefix.
    let partial = receiver_store.get(Path::new("/dl/cancel.bin")).unwrap();
    assert!(partial.len() >= 128 * 1024);
    assert_eq!(partial[..], payload[..partial.len()]);
}

#[tokio::test]
async fn zmodem_local_cancel_discards_partial() {
    let payload = seeded_bytes(64 * 1024, 59);
    let sender_store = MemoryStore::new();
    sender_store.insert("/src/drop.bin", payload);
    let receiver_store = MemoryStore::new();

    let sender = Transfer::upload(
        ProtocolFlavor::Zmodem(ZmodemFlavor::Crc32),
        vec![PathBuf::from("/src/drop.bin")],
        test_config(),
    )
    .unwrap();
    let receiver = Transfer::download(
        ProtocolFlavor::Zmodem(ZmodemFlavor::Crc32),
        PathBuf::from("/dl"),
        test_config(),
    )
    .unwrap();
    let recv_session = receiver.session();

    {
        let session = recv_session.clone();
        let mut events = session.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SessionEvent::Progress {
                        bytes_transferred, ..
                    }) if bytes_transferred >= 16 * 1024 => {
                        session.cancel_transfer(false);
                        return;
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(_) => return,
                }
            }
        });
    }

    let (_, r_state) = run_pair(sender, receiver, sender_store, receiver_store.clone()).await;
    assert_eq!(r_state, SessionState::Abort);
    assert!(!receiver_store.contains(Path::new("/dl/drop.bin")));
}

#[tokio::test]
async fn zmodem_peer_can_run_aborts_receiver() {
    let payload = seeded_bytes(64 * 1024, 61);
    let sender_store = MemoryStore::new();
    sender_store.insert("/src/injected.bin", payload);
    let receiver_store = MemoryStore::new();

    let sender = Transfer::upload(
        ProtocolFlavor::Zmodem(ZmodemFlavor::Crc32),
        vec![PathBuf::from("/src/injected.bin")],
        test_config(),
    )
    .unwrap();
    let receiver = Transfer::download(
        ProtocolFlavor::Zmodem(ZmodemFlavor::Crc32),
        PathBuf::from("/dl"),
        test_config(),
    )
    .unwrap();
    let recv_session = receiver.session();

    let (mut tx_chan, tx_proxy) = loopback_pair(16);
    let (mut rx_chan, rx_proxy) = loopback_pair(16);

    // Inject five raw CANs into the data stream partway through. The
    // injection point sits well past the negotiation exchanges so the
    // receiver is mid subpacket stream when they arrive.
    let mut injected = false;
    spawn_proxy(tx_proxy, rx_proxy, move |index, byte| {
        if index == 48 * 1024 && !injected {
            injected = true;
            vec![CAN, CAN, CAN, CAN, CAN]
        } else {
            vec![byte]
        }
    });

    let s_store = sender_store.clone();
    let r_store = receiver_store.clone();
    let send_task = tokio::spawn(async move { sender.run(&mut tx_chan, &s_store).await });
    let recv_task = tokio::spawn(async move { receiver.run(&mut rx_chan, &r_store).await });

    assert_eq!(recv_task.await.unwrap(), SessionState::Abort);
    let last = recv_session.last_message().unwrap();
    assert!(last.text.contains("RemoteCancel"));
    // The sender also terminates once the receiver is gone.
    let _ = send_task.await.unwrap();
}

#[tokio::test]
async fn ymodem_exact_block_multiple_has_no_padding() {
    let payload = seeded_bytes(2048, 67);
    let sender_store = MemoryStore::new();
    sender_store.insert("/src/exact.bin", payload.clone());
    let receiver_store = MemoryStore::new();

    let sender = Transfer::upload(
        ProtocolFlavor::Ymodem(YmodemFlavor::Vanilla),
        vec![PathBuf::from("/src/exact.bin")],
        test_config(),
    )
    .unwrap();
    let receiver = Transfer::download(
        ProtocolFlavor::Ymodem(YmodemFlavor::Vanilla),
        PathBuf::from("/dl"),
        test_config(),
    )
    .unwrap();

    let (s_state, r_state) =
        run_pair(sender, receiver, sender_store, receiver_store.clone()).await;
    assert_eq!(s_state, SessionState::End);
    assert_eq!(r_state, SessionState::End);
    assert_eq!(
        receiver_store.get(Path::new("/dl/exact.bin")).unwrap(),
        payload
    );
}
