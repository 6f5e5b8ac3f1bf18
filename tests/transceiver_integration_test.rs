//! Integration tests for the link transceiver over an in-memory duplex link.

use rust_thermo::error::ThermoError;
use rust_thermo::link::{AsyncLinkTransceiver, TransceiverBuilder};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::task::JoinHandle;

/// Device that reads `terminator`-delimited commands and answers each with the next scripted
/// reply. An empty reply means "stay silent".
fn spawn_scripted_device(
    device: DuplexStream,
    terminator: u8,
    replies: Vec<Vec<u8>>,
) -> JoinHandle<Vec<String>> {
    tokio::spawn(async move {
        let (read_half, mut write_half) = tokio::io::split(device);
        let mut reader = BufReader::new(read_half);
        let mut received = Vec::new();
        for reply in replies {
            let mut command = Vec::new();
            match reader.read_until(terminator, &mut command).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            command.pop();
            received.push(String::from_utf8_lossy(&command).to_string());
            if !reply.is_empty() && write_half.write_all(&reply).await.is_err() {
                break;
            }
        }
        received
    })
}

/// Device that answers every CR-terminated command with "<command>!\r" after a short delay.
fn spawn_slow_echo(device: DuplexStream) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (read_half, mut write_half) = tokio::io::split(device);
        let mut reader = BufReader::new(read_half);
        let mut command = Vec::new();
        while let Ok(n) = reader.read_until(b'\r', &mut command).await {
            if n == 0 {
                break;
            }
            command.pop();
            tokio::time::sleep(Duration::from_millis(5)).await;
            let mut reply = command.clone();
            reply.extend_from_slice(b"!\r");
            // Written in two pieces so the reader sees a partial reply first.
            let (head, tail) = reply.split_at(reply.len() / 2);
            if write_half.write_all(head).await.is_err() {
                break;
            }
            tokio::task::yield_now().await;
            if write_half.write_all(tail).await.is_err() {
                break;
            }
            command.clear();
        }
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers_get_their_own_replies() {
    let (host, device) = tokio::io::duplex(1024);
    let _device = spawn_slow_echo(device);
    let link = Arc::new(AsyncLinkTransceiver::new(host).unwrap());

    let mut tasks = Vec::new();
    for caller in 0..8 {
        let link = Arc::clone(&link);
        tasks.push(tokio::spawn(async move {
            let mut replies = Vec::new();
            for exchange in 0..5 {
                let command = format!("C{caller}-{exchange}");
                let reply = link.send_and_receive(&command).await.unwrap();
                replies.push((command, reply));
            }
            replies
        }));
    }

    for task in tasks {
        for (command, reply) in task.await.unwrap() {
            assert_eq!(reply, format!("{command}!"));
        }
    }
}

#[tokio::test]
async fn test_sequential_replies_in_order() {
    let (host, device) = tokio::io::duplex(256);
    let device = spawn_scripted_device(
        device,
        b'\r',
        vec![b"one\r".to_vec(), b"two\r".to_vec(), b"three\r".to_vec()],
    );
    let link = AsyncLinkTransceiver::new(host).unwrap();

    assert_eq!(link.send_and_receive("a").await.unwrap(), "one");
    assert_eq!(link.send_and_receive("b").await.unwrap(), "two");
    assert_eq!(link.send_and_receive("c").await.unwrap(), "three");
    assert_eq!(device.await.unwrap(), vec!["a", "b", "c"]);
}

#[tokio::test(start_paused = true)]
async fn test_overflow_fails_exchange_and_next_starts_clean() {
    let (host, device) = tokio::io::duplex(256);
    let mut oversized = vec![b'x'; 20];
    oversized.push(b'\r');
    let _device = spawn_scripted_device(device, b'\r', vec![oversized, b"ok\r".to_vec()]);

    let link = TransceiverBuilder::new()
        .with_capacity(16)
        .with_timeout(Duration::from_millis(500))
        .build(host)
        .unwrap();

    let err = link.send_and_receive("A").await.unwrap_err();
    assert!(matches!(err, ThermoError::Timeout { .. }));
    assert_eq!(link.send_and_receive("B").await.unwrap(), "ok");
}

#[tokio::test]
async fn test_custom_checker_overrides_terminator() {
    let (host, device) = tokio::io::duplex(256);
    // Replies are fixed four-unit records with no terminator at all.
    let _device = spawn_scripted_device(device, b'\n', vec![b"ABCD".to_vec(), b"\x02\r\r\x03".to_vec()]);

    let link = TransceiverBuilder::new()
        .with_command_terminator("\n")
        .with_reply_checker(Arc::new(|buf: &[u8]| buf.len() == 4))
        .build(host)
        .unwrap();

    assert_eq!(link.send_and_receive("first").await.unwrap(), "ABCD");
    // Nothing is stripped when a custom checker is used.
    assert_eq!(link.send_and_receive("second").await.unwrap(), "\u{2}\r\r\u{3}");
}

#[tokio::test]
async fn test_multi_unit_terminator_and_latin1_units() {
    let (host, device) = tokio::io::duplex(256);
    let _device = spawn_scripted_device(device, b'\n', vec![vec![b'2', b'5', 0xb0, b'C', b'\r', b'\n']]);

    let link = TransceiverBuilder::new()
        .with_reply_terminator("\r\n")
        .with_command_terminator("\n")
        .build(host)
        .unwrap();

    assert_eq!(link.send_and_receive("T?").await.unwrap(), "25°C");
}

#[tokio::test(start_paused = true)]
async fn test_send_only_swallows_timeout() {
    let (host, device) = tokio::io::duplex(256);
    let device = spawn_scripted_device(device, b'\r', vec![Vec::new(), b"fine\r".to_vec()]);
    let link = TransceiverBuilder::new()
        .with_timeout(Duration::from_millis(100))
        .build(host)
        .unwrap();

    link.send_only("RESET").await;
    assert_eq!(link.send_and_receive("PV?").await.unwrap(), "fine");
    assert_eq!(device.await.unwrap(), vec!["RESET", "PV?"]);
}
