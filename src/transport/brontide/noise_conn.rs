use std::io::{self, Read, Write};

use bytes::{Buf, BytesMut};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::noise_machine::{
    BrontideMachine, MessageOpener, MessageSealer, NoiseError, ENC_HEADER_SIZE,
};

#[derive(Debug, thiserror::Error)]
pub enum NoiseConnError {
    #[error("handshake failed: {0}")]
    Handshake(NoiseError),
    #[error("noise error: {0}")]
    Noise(#[from] NoiseError),
    #[error("handshake task failed: {0}")]
    Join(String),
}

/// Drive the three handshake acts over raw relay channels.
///
/// The machine speaks blocking `Read`/`Write`, so it runs on the blocking pool. The inbound
/// receiver is handed back together with any bytes that arrived after act two.
///
/// # Errors
/// Returns [`NoiseConnError::Handshake`] when the peer misbehaves or the relay goes away.
pub async fn perform_handshake(
    machine: BrontideMachine,
    inbound: mpsc::Receiver<Vec<u8>>,
    outbound: mpsc::Sender<Vec<u8>>,
) -> Result<(BrontideMachine, mpsc::Receiver<Vec<u8>>, BytesMut), NoiseConnError> {
    tokio::task::spawn_blocking(move || {
        let mut io = BlockingRelayIo {
            inbound,
            outbound,
            buffer: BytesMut::new(),
        };
        let mut machine = machine;
        machine
            .do_handshake(&mut io)
            .map_err(NoiseConnError::Handshake)?;
        Ok((machine, io.inbound, io.buffer))
    })
    .await
    .map_err(|e| NoiseConnError::Join(e.to_string()))?
}

/// Decrypt transport messages from the raw byte stream and forward the plaintext.
///
/// Ciphertext is buffered until a full header and then a full body are present, so messages
/// may be split across or packed into relay frames arbitrarily. Returns `Ok` when either side
/// of the pipe closes.
///
/// # Errors
/// Returns [`NoiseConnError::Noise`] when a MAC fails; the session cannot recover from that.
pub async fn reader_loop(
    mut opener: MessageOpener,
    mut inbound: mpsc::Receiver<Vec<u8>>,
    mut cipher_buf: BytesMut,
    tx: mpsc::Sender<Vec<u8>>,
) -> Result<(), NoiseConnError> {
    loop {
        while cipher_buf.len() < ENC_HEADER_SIZE {
            let Some(chunk) = inbound.recv().await else {
                debug!(target: "cln_rs::noise", "inbound closed");
                return Ok(());
            };
            cipher_buf.extend_from_slice(&chunk);
        }

        let mut header = [0u8; ENC_HEADER_SIZE];
        header.copy_from_slice(&cipher_buf[..ENC_HEADER_SIZE]);
        let body_len = opener.open_header(&header)?;

        let total = ENC_HEADER_SIZE + body_len;
        while cipher_buf.len() < total {
            let Some(chunk) = inbound.recv().await else {
                debug!(target: "cln_rs::noise", "inbound closed mid-message");
                return Ok(());
            };
            cipher_buf.extend_from_slice(&chunk);
        }

        let plaintext = opener.open_body(&cipher_buf[ENC_HEADER_SIZE..total])?;
        cipher_buf.advance(total);
        trace!(target: "cln_rs::noise", bytes = plaintext.len(), "decrypted message");

        if tx.send(plaintext).await.is_err() {
            return Ok(());
        }
    }
}

/// Encrypt outgoing messages and hand the ciphertext to the relay writer.
///
/// # Errors
/// Returns [`NoiseConnError::Noise`] when a message cannot be sealed.
pub async fn writer_loop(
    mut sealer: MessageSealer,
    mut rx: mpsc::Receiver<Vec<u8>>,
    outbound: mpsc::Sender<Vec<u8>>,
) -> Result<(), NoiseConnError> {
    while let Some(plaintext) = rx.recv().await {
        let frame = sealer.seal(&plaintext)?;
        trace!(target: "cln_rs::noise", bytes = frame.len(), "encrypted message");
        if outbound.send(frame).await.is_err() {
            break;
        }
    }
    Ok(())
}

struct BlockingRelayIo {
    inbound: mpsc::Receiver<Vec<u8>>,
    outbound: mpsc::Sender<Vec<u8>>,
    buffer: BytesMut,
}

impl Read for BlockingRelayIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.buffer.is_empty() {
            match self.inbound.blocking_recv() {
                Some(chunk) => self.buffer.extend_from_slice(&chunk),
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "relay closed during handshake",
                    ))
                }
            }
        }
        let n = self.buffer.len().min(buf.len());
        buf[..n].copy_from_slice(&self.buffer[..n]);
        self.buffer.advance(n);
        Ok(n)
    }
}

impl Write for BlockingRelayIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.outbound
            .blocking_send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "relay writer gone"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
