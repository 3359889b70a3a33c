// MIT License
//
// Copyright (c) 2025 Takatoshi Kondo
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::channel::{PacketChannel, PacketStreams};
use crate::codec::MqttCodec;
use crate::error::MqttError;
use crate::packet::Packet;

const OUTGOING_CAPACITY: usize = 256;

type Outgoing = (Packet, oneshot::Sender<Result<(), MqttError>>);

/// Packet channel over a TCP stream.
///
/// A reader task decodes inbound packets onto the receiver stream and a writer
/// task encodes packets queued by [`PacketChannel::send`]. Either task ending
/// closes the whole channel.
pub struct TcpChannel {
    peer_addr: Option<SocketAddr>,
    connected: Arc<AtomicBool>,
    streams: Arc<PacketStreams>,
    outgoing: mpsc::Sender<Outgoing>,
    shutdown: CancellationToken,
}

impl TcpChannel {
    pub fn new(stream: TcpStream, max_packet_size: usize) -> Arc<Self> {
        let peer_addr = stream.peer_addr().ok();
        let framed = Framed::new(stream, MqttCodec::new(max_packet_size));
        let (mut sink, mut source) = framed.split();

        let connected = Arc::new(AtomicBool::new(true));
        let streams = Arc::new(PacketStreams::new());
        let shutdown = CancellationToken::new();
        let (outgoing, mut outgoing_rx) = mpsc::channel::<Outgoing>(OUTGOING_CAPACITY);

        {
            let connected = connected.clone();
            let streams = streams.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        item = source.next() => match item {
                            Some(Ok(packet)) => {
                                trace!("Received {:?} from {peer_addr:?}", packet.packet_type());
                                streams.publish_inbound(packet);
                            }
                            Some(Err(e)) => {
                                debug!("Read error from {peer_addr:?}: {e}");
                                break;
                            }
                            None => {
                                trace!("{peer_addr:?} closed the connection");
                                break;
                            }
                        }
                    }
                }
                connected.store(false, Ordering::SeqCst);
                streams.complete();
                shutdown.cancel();
            });
        }

        {
            let connected = connected.clone();
            let streams = streams.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        next = outgoing_rx.recv() => {
                            let Some((packet, done)) = next else {
                                break;
                            };
                            let result = sink.send(packet.clone()).await;
                            let failed = result.is_err();
                            if !failed {
                                streams.publish_outbound(packet);
                            }
                            let _ = done.send(result);
                            if failed {
                                break;
                            }
                        }
                    }
                }
                connected.store(false, Ordering::SeqCst);
                let _ = sink.close().await;
                shutdown.cancel();
            });
        }

        Arc::new(Self {
            peer_addr,
            connected,
            streams,
            outgoing,
            shutdown,
        })
    }

    /// Open a TCP connection to `addr`
    pub async fn connect<A: ToSocketAddrs>(
        addr: A,
        connect_timeout: Duration,
        max_packet_size: usize,
    ) -> Result<Arc<Self>, MqttError> {
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| MqttError::Io("connect timed out".into()))??;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream, max_packet_size))
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }
}

#[async_trait]
impl PacketChannel for TcpChannel {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send(&self, packet: Packet) -> Result<(), MqttError> {
        if !self.is_connected() {
            return Err(MqttError::ChannelClosed);
        }
        let (done, result) = oneshot::channel();
        self.outgoing
            .send((packet, done))
            .await
            .map_err(|_| MqttError::ChannelClosed)?;
        result.await.map_err(|_| MqttError::ChannelClosed)?
    }

    fn receiver_stream(&self) -> broadcast::Receiver<Packet> {
        self.streams.subscribe_inbound()
    }

    fn sender_stream(&self) -> broadcast::Receiver<Packet> {
        self.streams.subscribe_outbound()
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.shutdown.cancel();
        self.streams.complete();
    }
}

impl Drop for TcpChannel {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
