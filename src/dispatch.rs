//! Packet dispatch: the single entry point from a connection into the core.
//!
//! The reader loop hands every decoded [`Packet`] to [`Dispatcher::dispatch`]
//! together with the peer address and a [`WriteBack`] for replies. Dispatch
//! never waits on a method: requests are spawned onto the runtime and answer
//! through the write-back when they complete.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::accounting::{CallAccounting, InfoReport, NetworkCounters};
use crate::engine::InvocationEngine;
use crate::error::Result;
use crate::protocol::{CmdType, ErrorCode, Packet, Payload, Request, Response};
use crate::service::BoxFuture;
use crate::writer::WriterHandle;

/// Where replies for one connection go.
pub trait WriteBack: Clone + Send + Sync + 'static {
    fn write(&self, packet: Packet) -> BoxFuture<'_, Result<()>>;
}

impl WriteBack for WriterHandle {
    fn write(&self, packet: Packet) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.send_packet(&packet).await })
    }
}

/// Routes packets to the engine or answers them directly.
pub struct Dispatcher {
    engine: Arc<InvocationEngine>,
    network: Arc<NetworkCounters>,
    process_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        engine: Arc<InvocationEngine>,
        network: Arc<NetworkCounters>,
        process_timeout: Duration,
    ) -> Self {
        Self {
            engine,
            network,
            process_timeout,
        }
    }

    pub fn engine(&self) -> &Arc<InvocationEngine> {
        &self.engine
    }

    fn accounting(&self) -> &Arc<CallAccounting> {
        self.engine.accounting()
    }

    /// Handle one inbound packet from `source`.
    ///
    /// Must be called from within a tokio runtime. Returns immediately.
    pub fn dispatch<W: WriteBack>(&self, packet: Packet, source: &str, reply: W) {
        match packet.command {
            CmdType::Request => self.dispatch_request(packet, source, reply),
            CmdType::Ping => {
                let pong = match Payload::decode(&packet) {
                    Ok(Payload::Ping(beat)) => Payload::Pong(beat).into_packet(packet.opaque),
                    Ok(_) => return,
                    Err(e) => {
                        tracing::debug!(opaque = packet.opaque, error = %e, "bad ping body");
                        return;
                    }
                };
                spawn_reply(reply, pong);
            }
            CmdType::Info => {
                let report = InfoReport {
                    network: self.network.snapshot(),
                    stat: self.accounting().last_report(),
                };
                let info = serde_json::to_value(&report)
                    .map_err(Into::into)
                    .and_then(|v| Payload::Info(v).into_packet(packet.opaque));
                spawn_reply(reply, info);
            }
            CmdType::Response | CmdType::Pong => {
                tracing::debug!(
                    opaque = packet.opaque,
                    command = ?packet.command,
                    source = %source,
                    "ignoring reply-type packet"
                );
            }
        }
    }

    fn dispatch_request<W: WriteBack>(&self, packet: Packet, source: &str, reply: W) {
        let opaque = packet.opaque;
        let mut request = match Request::decode(packet.payload()) {
            Ok(request) => request,
            Err(e) => {
                tracing::error!(opaque, source = %source, error = %e, "undecodable request");
                let resp = Response::failure(ErrorCode::Throwable, e.to_string());
                spawn_reply(reply, response_packet(opaque, &resp));
                return;
            }
        };
        request.timeout = self.process_timeout;
        request.source_address = source.to_string();

        let engine = Arc::clone(&self.engine);
        tokio::spawn(async move {
            let service = request.service_uri.clone();
            let method = request.method_name.clone();
            engine
                .invoke(request, move |resp| async move {
                    if !resp.is_success() {
                        tracing::error!(
                            opaque,
                            service = %service,
                            method = %method,
                            code = resp.error_code,
                            message = %resp.message,
                            "call failed"
                        );
                    }
                    let packet = response_packet(opaque, &resp)?;
                    reply.write(packet).await
                })
                .await;
        });
    }
}

fn response_packet(opaque: u32, resp: &Response) -> Result<Packet> {
    let body: Bytes = resp.encode()?;
    Ok(Packet::new(opaque, CmdType::Response, body))
}

fn spawn_reply<W: WriteBack>(reply: W, packet: Result<Packet>) {
    match packet {
        Ok(packet) => {
            tokio::spawn(async move {
                if let Err(e) = reply.write(packet).await {
                    tracing::debug!(error = %e, "reply not written");
                }
            });
        }
        Err(e) => tracing::error!(error = %e, "failed to encode reply"),
    }
}
