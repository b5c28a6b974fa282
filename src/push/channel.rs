//! An in-process [`PushTransport`], for embedding the engine next to its push source and for tests.

use anyhow::anyhow;
use async_trait::async_trait;
use futures::{StreamExt, stream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use super::{FrameStream, PushTransport, SubscribeHandshake};

/// Client side: every `subscribe` shows up as a [`ChannelConnection`] on the paired server.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    connections: UnboundedSender<ChannelConnection>,
}

/// Server side of a [`ChannelTransport`].
#[derive(Debug)]
pub struct ChannelTransportServer {
    connections: UnboundedReceiver<ChannelConnection>,
}

/// One accepted subscription. Dropping it closes the connection.
#[derive(Debug)]
pub struct ChannelConnection {
    pub handshake: SubscribeHandshake,
    frames: UnboundedSender<anyhow::Result<String>>,
}

impl ChannelTransport {
    pub fn new() -> (Self, ChannelTransportServer) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                connections: sender,
            },
            ChannelTransportServer {
                connections: receiver,
            },
        )
    }
}

impl ChannelTransportServer {
    /// Waits for the next subscription. `None` once every transport handle is dropped.
    pub async fn accept(&mut self) -> Option<ChannelConnection> {
        self.connections.recv().await
    }
}

impl ChannelConnection {
    /// Returns `false` if the subscriber went away.
    pub fn send(&self, frame: impl Into<String>) -> bool {
        self.frames.send(Ok(frame.into())).is_ok()
    }

    /// Drops the connection with a transport error.
    pub fn fail(self, reason: impl Into<String>) {
        let _ = self.frames.send(Err(anyhow!(reason.into())));
    }
}

#[async_trait]
impl PushTransport for ChannelTransport {
    async fn subscribe(&self, handshake: SubscribeHandshake) -> anyhow::Result<FrameStream> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.connections
            .send(ChannelConnection {
                handshake,
                frames: sender,
            })
            .map_err(|_| anyhow!("push server is gone"))?;

        Ok(stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|frame| (frame, receiver))
        })
        .boxed())
    }
}
