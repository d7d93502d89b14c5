//! Async serial transport for board chains.
//!
//! A chain owns one serial device. The read half feeds the receive loop;
//! the write half is shared behind an async mutex between the poll task,
//! the rule engine, and the light layer. Any `AsyncRead + AsyncWrite`
//! stream works, which lets tests drive a chain over an in-memory duplex
//! pipe instead of a real port.

use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_serial::SerialPortBuilderExt;
use tracing::debug;

/// Trait alias for streams usable as chain transports.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Dynamic serial stream type.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Shared write half of a chain transport.
pub type SharedWriter = Arc<Mutex<WriteHalf<DynSerial>>>;

/// Read half consumed by the chain's receive loop.
pub type ChainReader = ReadHalf<DynSerial>;

/// Open the serial device for a chain.
pub fn open_port(path: &str, baud: u32) -> anyhow::Result<DynSerial> {
    let stream = tokio_serial::new(path, baud)
        .open_native_async()
        .with_context(|| format!("failed to open serial port '{path}' at {baud} baud"))?;
    debug!(port = path, baud, "serial port opened");
    Ok(Box::new(stream))
}

/// Split a transport into its receive half and shared write half.
pub fn split(port: DynSerial) -> (ChainReader, SharedWriter) {
    let (reader, writer) = tokio::io::split(port);
    (reader, Arc::new(Mutex::new(writer)))
}

/// Write one encoded frame and flush it before returning.
///
/// The port lock is held across the write and flush of the whole frame so
/// concurrent writers cannot interleave bytes mid-frame.
pub async fn send_frame(writer: &SharedWriter, frame: &[u8]) -> std::io::Result<()> {
    let mut guard = writer.lock().await;
    guard.write_all(frame).await?;
    guard.flush().await
}

/// Send a batch of frames, each flushed whole.
pub async fn send_frames(writer: &SharedWriter, frames: &[Vec<u8>]) -> std::io::Result<()> {
    for frame in frames {
        send_frame(writer, frame).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn frames_from_concurrent_writers_do_not_interleave() {
        let (ours, theirs) = tokio::io::duplex(256);
        let (_reader, writer) = split(Box::new(ours));

        let a = writer.clone();
        let b = writer.clone();
        let t1 = tokio::spawn(async move { send_frame(&a, &[1u8; 8]).await });
        let t2 = tokio::spawn(async move { send_frame(&b, &[2u8; 8]).await });
        t1.await.unwrap().unwrap();
        t2.await.unwrap().unwrap();

        let mut peer = theirs;
        let mut buf = [0u8; 16];
        peer.read_exact(&mut buf).await.unwrap();
        let first = buf[0];
        assert!(buf[..8].iter().all(|&b| b == first));
        assert!(buf[8..].iter().all(|&b| b != first));
    }
}
