use std::{net::SocketAddr, time::Duration};

use tokio::{
    net::{TcpListener, TcpStream},
    task::AbortHandle,
};

use crate::wire;

use super::{PeerIo, SessionMsg, SessionSender};

pub struct ListenerProc {
    handle: AbortHandle,
}

impl Drop for ListenerProc {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl ListenerProc {
    pub fn spawn(sender: SessionSender, port: u16) -> Self {
        let handle = tokio::spawn(entry(sender, port)).abort_handle();
        Self { handle }
    }
}

async fn entry(sender: SessionSender, port: u16) {
    loop {
        if let Err(err) = run(sender.clone(), port).await {
            tracing::error!("failed to run listener on port {port}: {err}");
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

async fn run(sender: SessionSender, port: u16) -> std::io::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let _ = tokio::spawn(accept(sender.clone(), stream, addr));
            }
            Err(err) => {
                tracing::warn!("failed to accept connection: {err}");
            }
        }
    }
}

async fn accept(sender: SessionSender, mut stream: TcpStream, addr: SocketAddr) {
    let read_future = wire::read_handshake_async(&mut stream);
    let handshake = match tokio::time::timeout(Duration::from_secs(5), read_future).await {
        Ok(Ok(handshake)) => handshake,
        Ok(Err(err)) => {
            tracing::warn!("failed to read handshake from {addr}: {err}");
            return;
        }
        Err(_) => {
            tracing::warn!("timed out waiting for a handshake from {addr}");
            return;
        }
    };

    let (reader, writer) = stream.into_split();
    let _ = sender.send(SessionMsg::ListenerIncoming {
        peer_id: handshake.peer_id,
        peer_addr: addr,
        peer_io: PeerIo::new(reader, writer),
    });
}
