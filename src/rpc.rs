//! Framed RPC connection to the host over a [`Pipe`].
//!
//! Wire format of every frame:
//!
//! ```text
//! [0..4]  opcode: u32 LE
//! [4..8]  length: u32 LE
//! [8..]   payload: `length` bytes of UTF-8 JSON
//! ```
//!
//! The connection is open only after the host answers the handshake with a
//! `DISPATCH`/`READY` frame.

use std::io;

use serde_json::Value;
use tracing::{debug, info, trace, warn};

use crate::constants::{CMD_DISPATCH, EVENT_READY, FRAME_HEADER_SIZE, MAX_MESSAGE_SIZE};
use crate::error::ErrorCode;
use crate::events::ErrorInfo;
use crate::pipe::Pipe;
use crate::serialization::{write_handshake, InboundMessage};
use crate::transport::{ConnectionListener, Transport};

const READ_CHUNK: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Opcode {
    Handshake = 0,
    Frame = 1,
    Close = 2,
    Ping = 3,
    Pong = 4,
}

impl Opcode {
    fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            0 => Opcode::Handshake,
            1 => Opcode::Frame,
            2 => Opcode::Close,
            3 => Opcode::Ping,
            4 => Opcode::Pong,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcState {
    Disconnected,
    SentHandshake,
    Connected,
}

pub struct RpcConnection<P: Pipe> {
    pipe: P,
    application_id: String,
    state: RpcState,
    last_error: ErrorInfo,
    inbox: Vec<u8>,
    outbox: Vec<u8>,
}

impl<P: Pipe> RpcConnection<P> {
    pub fn new(pipe: P, application_id: &str) -> Self {
        Self {
            pipe,
            application_id: application_id.to_owned(),
            state: RpcState::Disconnected,
            last_error: ErrorInfo::new(ErrorCode::Success.into(), ""),
            inbox: Vec::with_capacity(FRAME_HEADER_SIZE + MAX_MESSAGE_SIZE),
            outbox: Vec::with_capacity(FRAME_HEADER_SIZE + MAX_MESSAGE_SIZE),
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> RpcState {
        self.state
    }

    fn fail(&mut self, code: i32, message: &str, listener: &mut dyn ConnectionListener) {
        self.last_error = ErrorInfo::new(code, message);
        self.close(listener);
    }

    fn write_frame(&mut self, opcode: Opcode, payload: &[u8]) -> bool {
        if payload.len() > MAX_MESSAGE_SIZE {
            warn!(len = payload.len(), "refusing oversized frame");
            return false;
        }
        self.outbox.clear();
        self.outbox.extend_from_slice(&(opcode as u32).to_le_bytes());
        self.outbox
            .extend_from_slice(&(payload.len() as u32).to_le_bytes());
        self.outbox.extend_from_slice(payload);
        match self.pipe.write(&self.outbox) {
            Ok(()) => true,
            Err(err) => {
                debug!(%err, ?opcode, "frame write failed");
                false
            }
        }
    }

    fn send_handshake(&mut self, listener: &mut dyn ConnectionListener) {
        let mut payload = [0u8; 256];
        let sent = match write_handshake(&mut payload, &self.application_id) {
            Ok(len) => self.write_frame(Opcode::Handshake, &payload[..len]),
            Err(err) => {
                warn!(%err, "cannot encode handshake");
                false
            }
        };
        if sent {
            debug!("handshake sent");
            self.state = RpcState::SentHandshake;
        } else {
            self.close(listener);
        }
    }

    /// Splits one complete frame off the inbox, if buffered.
    fn buffered_frame(&mut self) -> Option<Result<(u32, Vec<u8>), u32>> {
        if self.inbox.len() < FRAME_HEADER_SIZE {
            return None;
        }
        let opcode = u32::from_le_bytes(self.inbox[0..4].try_into().ok()?);
        let length = u32::from_le_bytes(self.inbox[4..8].try_into().ok()?);
        if length as usize > MAX_MESSAGE_SIZE {
            return Some(Err(length));
        }
        let total = FRAME_HEADER_SIZE + length as usize;
        if self.inbox.len() < total {
            return None;
        }
        let payload = self.inbox[FRAME_HEADER_SIZE..total].to_vec();
        self.inbox.drain(..total);
        Some(Ok((opcode, payload)))
    }

    /// Pulls whatever the pipe has. `false` when nothing more is coming now.
    fn fill(&mut self, listener: &mut dyn ConnectionListener) -> bool {
        let mut chunk = [0u8; READ_CHUNK];
        match self.pipe.read(&mut chunk) {
            Ok(0) => {
                self.fail(ErrorCode::PipeClosed.into(), "Pipe closed", listener);
                false
            }
            Ok(n) => {
                self.inbox.extend_from_slice(&chunk[..n]);
                true
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => false,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => true,
            Err(err) => {
                debug!(%err, "pipe read failed");
                self.fail(ErrorCode::PipeClosed.into(), "Pipe closed", listener);
                false
            }
        }
    }

    fn handle_close_frame(&mut self, payload: &[u8], listener: &mut dyn ConnectionListener) {
        let body: Value = serde_json::from_slice(payload).unwrap_or(Value::Null);
        let code = body
            .get("code")
            .and_then(Value::as_i64)
            .and_then(|c| i32::try_from(c).ok())
            .unwrap_or(0);
        let message = body.get("message").and_then(Value::as_str).unwrap_or("");
        info!(code, message, "host closed the connection");
        self.fail(code, message, listener);
    }
}

impl<P: Pipe> Transport for RpcConnection<P> {
    fn open(&mut self, listener: &mut dyn ConnectionListener) {
        match self.state {
            RpcState::Connected => {}
            RpcState::SentHandshake => {
                if let Some(message) = self.read(listener) {
                    if message.cmd.as_deref() == Some(CMD_DISPATCH)
                        && message.evt.as_deref() == Some(EVENT_READY)
                    {
                        info!("connected to host");
                        self.state = RpcState::Connected;
                        listener.on_connect();
                    } else {
                        trace!(cmd = ?message.cmd, evt = ?message.evt, "unexpected frame before READY");
                    }
                }
            }
            RpcState::Disconnected => {
                if !self.pipe.is_open() && !self.pipe.open() {
                    return;
                }
                self.inbox.clear();
                self.send_handshake(listener);
            }
        }
    }

    fn is_open(&self) -> bool {
        self.state == RpcState::Connected
    }

    fn read(&mut self, listener: &mut dyn ConnectionListener) -> Option<InboundMessage> {
        loop {
            if !matches!(self.state, RpcState::Connected | RpcState::SentHandshake) {
                return None;
            }

            let (opcode, payload) = match self.buffered_frame() {
                Some(Ok(frame)) => frame,
                Some(Err(length)) => {
                    warn!(length, "frame exceeds maximum size");
                    self.fail(ErrorCode::ReadCorrupt.into(), "Partial data in frame", listener);
                    return None;
                }
                None => {
                    if self.fill(listener) {
                        continue;
                    }
                    return None;
                }
            };

            match Opcode::from_u32(opcode) {
                Some(Opcode::Frame) => match InboundMessage::parse(&payload) {
                    Some(message) => return Some(message),
                    None => warn!(len = payload.len(), "dropping frame with invalid JSON"),
                },
                Some(Opcode::Close) => {
                    self.handle_close_frame(&payload, listener);
                    return None;
                }
                Some(Opcode::Ping) => {
                    trace!("ping");
                    if !self.write_frame(Opcode::Pong, &payload) {
                        self.close(listener);
                        return None;
                    }
                }
                Some(Opcode::Pong) => {}
                Some(Opcode::Handshake) | None => {
                    warn!(opcode, "unexpected opcode");
                    self.fail(ErrorCode::ReadCorrupt.into(), "Bad ipc frame", listener);
                    return None;
                }
            }
        }
    }

    fn write(&mut self, frame: &[u8], listener: &mut dyn ConnectionListener) {
        if !self.write_frame(Opcode::Frame, frame) {
            self.close(listener);
        }
    }

    fn close(&mut self, listener: &mut dyn ConnectionListener) {
        if matches!(self.state, RpcState::Connected | RpcState::SentHandshake) {
            let ErrorInfo { code, message } = self.last_error;
            info!(code, message = %message, "disconnected");
            listener.on_disconnect(code, message.as_str());
        }
        self.pipe.close();
        self.inbox.clear();
        self.state = RpcState::Disconnected;
    }
}

impl<P: Pipe> Drop for RpcConnection<P> {
    fn drop(&mut self) {
        self.pipe.close();
    }
}
