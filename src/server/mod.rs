//! # Telemetry Server
//!
//! Modbus TCP front end for the register map. One task per connection; each
//! request is answered from the latest published engine snapshot, so a tick
//! waiting on a slow irradiance source never holds up a client.

pub mod frame;
pub mod pdu;

pub use frame::{FrameError, MbapCodec, MbapHeader, RequestFrame, ResponseFrame};
pub use pdu::{ExceptionCode, FunctionCode, PduError, Request, Response};

use futures::{SinkExt, StreamExt};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::registers::RegisterMap;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerSettings {
    /// Unit identifier this device answers to
    pub unit_id: u8,
    /// Consecutive malformed frames tolerated before the connection is closed
    pub max_malformed_frames: u32,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            unit_id: 1,
            max_malformed_frames: 8,
        }
    }
}

/// Result of handling one request frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    /// None when the frame cannot be answered at all
    pub response: Option<ResponseFrame>,
    pub malformed: bool,
}

/// Turn one decoded frame into its response. Never touches the socket.
pub fn dispatch(registers: &RegisterMap, settings: &ServerSettings, frame: &RequestFrame) -> Outcome {
    let header = frame.header;
    if header.protocol_id != 0 {
        debug!(
            transaction_id = header.transaction_id,
            protocol_id = header.protocol_id,
            "dropping frame with foreign protocol id"
        );
        return Outcome {
            response: None,
            malformed: true,
        };
    }

    let reply = |response: Response| {
        Some(ResponseFrame {
            transaction_id: header.transaction_id,
            unit_id: header.unit_id,
            pdu: response.encode(),
        })
    };

    let request = match Request::parse(&frame.pdu) {
        Ok(request) => request,
        Err(e) => {
            debug!(transaction_id = header.transaction_id, error = %e, "rejected request");
            return Outcome {
                response: reply(Response::exception(e.function(), e.exception())),
                malformed: e.is_malformed(),
            };
        }
    };

    let function = request.function() as u8;
    if header.unit_id != settings.unit_id {
        debug!(unit_id = header.unit_id, "request for unknown unit");
        return Outcome {
            response: reply(Response::exception(
                function,
                ExceptionCode::GatewayTargetFailedToRespond,
            )),
            malformed: false,
        };
    }

    let result = match request {
        Request::ReadHoldingRegisters { start, quantity } => registers
            .read_registers(start, quantity)
            .map(Response::ReadHoldingRegisters),
        Request::WriteSingleRegister { address, value } => registers
            .write_registers(address, &[value])
            .map(|()| Response::WriteSingleRegister { address, value }),
        Request::WriteMultipleRegisters { start, values } => registers
            .write_registers(start, &values)
            .map(|()| Response::WriteMultipleRegisters {
                start,
                quantity: values.len() as u16,
            }),
    };

    let response = result.unwrap_or_else(|e| {
        debug!(transaction_id = header.transaction_id, error = %e, "register access refused");
        Response::exception(function, ExceptionCode::from(&e))
    });

    Outcome {
        response: reply(response),
        malformed: false,
    }
}

pub struct TelemetryServer {
    listener: TcpListener,
    registers: Arc<RegisterMap>,
    settings: ServerSettings,
}

impl TelemetryServer {
    /// Bind the listening socket. Failure here is fatal to the process.
    pub async fn bind(
        addr: SocketAddr,
        registers: Arc<RegisterMap>,
        settings: ServerSettings,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            registers,
            settings,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` fires, then wait for every open
    /// connection to finish its in-flight request.
    pub async fn serve(self, shutdown: CancellationToken) {
        let tracker = TaskTracker::new();

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    tracker.spawn(handle_connection(
                        stream,
                        peer,
                        self.registers.clone(),
                        self.settings,
                        shutdown.clone(),
                    ));
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }

        tracker.close();
        info!(open = tracker.len(), "telemetry server draining connections");
        tracker.wait().await;
        info!("telemetry server stopped");
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    registers: Arc<RegisterMap>,
    settings: ServerSettings,
    shutdown: CancellationToken,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(%peer, error = %e, "could not disable Nagle");
    }
    info!(%peer, "client connected");

    let mut framed = Framed::new(stream, MbapCodec);
    let mut malformed = 0u32;

    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = framed.next() => next,
        };

        let frame = match next {
            None => break,
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                warn!(%peer, error = %e, "unrecoverable framing error");
                break;
            }
        };

        let outcome = dispatch(&registers, &settings, &frame);
        if let Some(response) = outcome.response {
            if let Err(e) = framed.send(response).await {
                debug!(%peer, error = %e, "write failed");
                break;
            }
        }

        if outcome.malformed {
            malformed += 1;
            if malformed >= settings.max_malformed_frames {
                warn!(%peer, malformed, "too many malformed frames, closing connection");
                break;
            }
        } else {
            malformed = 0;
        }
    }

    info!(%peer, "client disconnected");
}
