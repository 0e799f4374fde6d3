use std::time::{Duration, Instant};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufWriter},
    net::TcpStream,
    sync::mpsc,
    task::AbortHandle,
};

use crate::{wire, PeerId};

use super::{swarm::FrameTiming, PeerIo, PeerReader, PeerWriter, SessionMsg, SessionSender};

type PeerSender = mpsc::UnboundedSender<wire::Message>;
type PeerReceiver = mpsc::UnboundedReceiver<wire::Message>;

/// Peers in one cohort come up in no particular order; the dialing side keeps
/// retrying until the listener is there.
const DIAL_RETRY_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug)]
pub struct PeerProc {
    sender: PeerSender,
}

impl PeerProc {
    /// Inbound side. The listener already consumed the remote handshake;
    /// reply with ours and start pumping frames.
    pub fn accept(
        sender: SessionSender,
        peer_id: PeerId,
        local_id: PeerId,
        peer_io: PeerIo,
    ) -> Self {
        let (peer_sender, peer_receiver) = mpsc::unbounded_channel();
        tokio::spawn(accept(sender, peer_receiver, peer_id, local_id, peer_io));
        Self {
            sender: peer_sender,
        }
    }

    /// Outbound side: dial, exchange handshakes, and verify the remote is who
    /// the roster says it is.
    pub fn connect(
        sender: SessionSender,
        peer_id: PeerId,
        local_id: PeerId,
        host: String,
        port: u16,
    ) -> Self {
        let (peer_sender, peer_receiver) = mpsc::unbounded_channel();
        tokio::spawn(connect(
            sender,
            peer_receiver,
            peer_id,
            local_id,
            host,
            port,
        ));
        Self {
            sender: peer_sender,
        }
    }

    pub fn send(&self, message: wire::Message) {
        let _ = self.sender.send(message);
    }
}

async fn connect(
    sender: SessionSender,
    receiver: PeerReceiver,
    peer_id: PeerId,
    local_id: PeerId,
    host: String,
    port: u16,
) {
    let mut stream = loop {
        match TcpStream::connect((host.as_str(), port)).await {
            Ok(stream) => break stream,
            Err(error) => {
                if sender.is_closed() {
                    return;
                }
                tracing::debug!("dialing peer {peer_id} at {host}:{port} failed, retrying: {error}");
                tokio::time::sleep(DIAL_RETRY_INTERVAL).await;
            }
        }
    };

    if let Err(error) = wire::write_handshake_async(&mut stream, local_id).await {
        let _ = sender.send(SessionMsg::PeerFailure { peer_id, error });
        return;
    }

    let handshake = match wire::read_handshake_async(&mut stream).await {
        Ok(handshake) => handshake,
        Err(error) => {
            let _ = sender.send(SessionMsg::PeerFailure { peer_id, error });
            return;
        }
    };

    if handshake.peer_id != peer_id {
        let _ = sender.send(SessionMsg::PeerFailure {
            peer_id,
            error: wire::WireError::Handshake(format!(
                "expected peer {peer_id}, remote claims to be {}",
                handshake.peer_id
            )),
        });
        return;
    }

    let _ = sender.send(SessionMsg::PeerHandshake { peer_id });

    let (reader, writer) = stream.into_split();
    spawn_reader_writer(sender, receiver, peer_id, PeerIo::new(reader, writer));
}

async fn accept(
    sender: SessionSender,
    receiver: PeerReceiver,
    peer_id: PeerId,
    local_id: PeerId,
    mut peer_io: PeerIo,
) {
    if let Err(error) = wire::write_handshake_async(&mut peer_io.writer, local_id).await {
        let _ = sender.send(SessionMsg::PeerFailure { peer_id, error });
        return;
    }
    spawn_reader_writer(sender, receiver, peer_id, peer_io);
}

fn spawn_reader_writer(
    sender: SessionSender,
    receiver: PeerReceiver,
    peer_id: PeerId,
    peer_io: PeerIo,
) {
    let reader_handle =
        tokio::spawn(reader_task(sender.clone(), peer_id, peer_io.reader)).abort_handle();
    tokio::spawn(writer_task(
        sender,
        receiver,
        peer_id,
        peer_io.writer,
        reader_handle,
    ));
}

async fn reader_task(sender: SessionSender, peer_id: PeerId, mut reader: PeerReader) {
    loop {
        match read_timed_message(&mut reader).await {
            Ok((message, timing)) => {
                let _ = sender.send(SessionMsg::PeerMessage {
                    peer_id,
                    message,
                    timing,
                });
            }
            Err(error) => {
                let _ = sender.send(SessionMsg::PeerFailure { peer_id, error });
                return;
            }
        }
    }
}

/// Read one frame, clocking the body read so the choking controller can rank
/// neighbors by observed throughput. The byte count covers the whole frame,
/// length prefix included.
async fn read_timed_message(
    mut reader: impl AsyncRead + Unpin,
) -> Result<(wire::Message, FrameTiming), wire::WireError> {
    let length = wire::read_frame_length_async(&mut reader).await?;
    let started = Instant::now();
    let mut buf = vec![0u8; length as usize];
    reader.read_exact(&mut buf).await?;
    let timing = FrameTiming {
        bytes: length + 4,
        elapsed: started.elapsed(),
    };
    Ok((wire::decode_message(&buf)?, timing))
}

async fn writer_task(
    sender: SessionSender,
    mut receiver: PeerReceiver,
    peer_id: PeerId,
    writer: PeerWriter,
    // this task aborts the reader once the PeerSender is dropped and every
    // queued frame has been flushed
    reader_handle: AbortHandle,
) {
    let mut writer = BufWriter::new(writer);
    while let Some(message) = receiver.recv().await {
        let write_result = wire::write_message_async(&mut writer, &message).await;
        let flush_result = writer.flush().await.map_err(wire::WireError::from);
        if let Err(error) = write_result.and(flush_result) {
            tracing::error!("failed to write message to peer {peer_id}: {error}");
            let _ = sender.send(SessionMsg::PeerFailure { peer_id, error });
            break;
        }
    }
    reader_handle.abort();
}
