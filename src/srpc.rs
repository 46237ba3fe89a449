//! SRPC endpoint (C2): the call/return state machine layered on the
//! item-coded stream of [`crate::wire`].
//!
//! One [`Endpoint`] owns one connection for its lifetime; the `caller`/
//! `callee` role is fixed per endpoint (a connection accepted by the
//! dispatch server is always a callee endpoint, one opened by
//! [`crate::pool`] is always a caller endpoint — the "role may alternate
//! between calls" language in the spec describes the logical RPC
//! direction flipping on one physical connection across its two
//! peer-facing endpoint objects, not a single `Endpoint` switching roles).

use std::fmt;
use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tracing::{debug, instrument, warn};

use crate::wire::{self, ItemCode};

/// The protocol version string exchanged during the handshake. Compared
/// byte-exactly; any mismatch is `version_skew`.
pub const PROTOCOL_VERSION: &str = "SRPC V1.4";

/// `intf_version`/`proc_id` wildcard, matching the original's `any = -1`.
pub const ANY: i32 = -1;

/// Which side of a call this endpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhichEnd {
    Caller,
    Callee,
}

/// The formal send/receive state machine (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Initial,
    Ready,
    DataOut,
    SeqOut,
    DataIn,
    SeqIn,
    Failed,
}

/// Transport-level failure reasons (spec §7), mirroring `SRPC::failure`
/// from the original (`SRPC.H`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    UnknownHost,
    UnknownInterface,
    VersionSkew,
    ProtocolViolation,
    BufferTooSmall,
    TransportFailure,
    InternalTrouble,
    InvalidParameter,
    PartnerWentAway,
    NotImplemented,
    ReadTimeout,
    Alerted,
    EnvironmentProblem,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureReason::UnknownHost => "unknown_host",
            FailureReason::UnknownInterface => "unknown_interface",
            FailureReason::VersionSkew => "version_skew",
            FailureReason::ProtocolViolation => "protocol_violation",
            FailureReason::BufferTooSmall => "buffer_too_small",
            FailureReason::TransportFailure => "transport_failure",
            FailureReason::InternalTrouble => "internal_trouble",
            FailureReason::InvalidParameter => "invalid_parameter",
            FailureReason::PartnerWentAway => "partner_went_away",
            FailureReason::NotImplemented => "not_implemented",
            FailureReason::ReadTimeout => "read_timeout",
            FailureReason::Alerted => "alerted",
            FailureReason::EnvironmentProblem => "environment_problem",
        };
        write!(f, "{s}")
    }
}

/// A terminal SRPC failure: reason plus a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub reason: FailureReason,
    pub msg: String,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.reason, self.msg)
    }
}

impl std::error::Error for Failure {}

impl Failure {
    pub fn new(reason: FailureReason, msg: impl Into<String>) -> Self {
        Failure { reason, msg: msg.into() }
    }
}

impl From<wire::Error> for Failure {
    fn from(e: wire::Error) -> Self {
        match e {
            wire::Error::Io(io_err) if io_err.kind() == io::ErrorKind::UnexpectedEof => {
                Failure::new(FailureReason::PartnerWentAway, "connection closed")
            }
            wire::Error::Io(io_err) => Failure::new(FailureReason::TransportFailure, io_err.to_string()),
            wire::Error::UnknownItemCode(b) => {
                Failure::new(FailureReason::ProtocolViolation, format!("unknown item code {b:#04x}"))
            }
            wire::Error::TooLong { declared, max } => Failure::new(
                FailureReason::ProtocolViolation,
                format!("length {declared} exceeds maximum {max}"),
            ),
            wire::Error::NotUtf8 => {
                Failure::new(FailureReason::ProtocolViolation, "field is not valid utf-8")
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, Failure>;

/// Per-endpoint tunables (spec §4.1).
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub send_buffer: usize,
    pub recv_buffer: usize,
    pub alertable: bool,
    pub read_timeout: Option<Duration>,
    pub max_bytes_field: usize,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        EndpointConfig {
            send_buffer: wire::DEFAULT_BUFFER_SIZE,
            recv_buffer: wire::DEFAULT_BUFFER_SIZE,
            alertable: false,
            read_timeout: None,
            max_bytes_field: wire::HARD_MAX_BYTES,
        }
    }
}

/// One SRPC connection endpoint.
pub struct Endpoint<S> {
    socket: S,
    role: WhichEnd,
    state: State,
    config: EndpointConfig,
    failure: Option<Failure>,
    alert: Notify,
    call_id: Option<(i32, i32)>,
    /// An item code already pulled off the wire by `await_call` while
    /// deciding whether a `start_call` was sent, but not yet consumed by
    /// the datum read it turned out to introduce.
    pending_code: Option<ItemCode>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Endpoint<S> {
    /// Wraps an already-connected socket and performs the version
    /// handshake (first item exchanged by both sides).
    #[instrument(skip(socket, config), name = "srpc.conn")]
    pub async fn handshake(mut socket: S, role: WhichEnd, config: EndpointConfig) -> Result<Self> {
        let mut send_buf = Vec::with_capacity(PROTOCOL_VERSION.len() + 8);
        wire::write_item_code(&mut send_buf, ItemCode::Hello).map_err(Failure::from)?;
        wire::write_text(&mut send_buf, PROTOCOL_VERSION).map_err(Failure::from)?;
        socket
            .write_all(&send_buf)
            .await
            .map_err(|e| Failure::new(FailureReason::TransportFailure, e.to_string()))?;

        let code = read_item_code_async(&mut socket).await?;
        if code != ItemCode::Hello {
            return Err(Failure::new(
                FailureReason::ProtocolViolation,
                "expected hello item for version handshake",
            ));
        }
        let peer_version = read_text_async(&mut socket, config.max_bytes_field).await?;
        if peer_version != PROTOCOL_VERSION {
            return Err(Failure::new(
                FailureReason::VersionSkew,
                format!("local {PROTOCOL_VERSION:?} != remote {peer_version:?}"),
            ));
        }

        debug!("srpc handshake complete");
        Ok(Endpoint {
            socket,
            role,
            state: State::Initial,
            config,
            failure: None,
            alert: Notify::new(),
            call_id: None,
            pending_code: None,
        })
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn role(&self) -> WhichEnd {
        self.role
    }

    /// `(proc_id, intf_version)` of the call in progress, if any.
    pub fn call_id(&self) -> Option<(i32, i32)> {
        self.call_id
    }

    /// A handle that, when notified, causes the next in-flight receive
    /// on an alertable endpoint to fail with `alerted`.
    pub fn alert_handle(&self) -> &Notify {
        &self.alert
    }

    fn fail(&mut self, failure: Failure) -> Failure {
        self.state = State::Failed;
        self.failure = Some(failure.clone());
        warn!(reason = %failure.reason, "srpc endpoint failed");
        failure
    }

    fn check_not_failed(&self) -> Result<()> {
        if let Some(f) = &self.failure {
            return Err(f.clone());
        }
        Ok(())
    }

    /// Returns the next item code, consuming a code already pulled off
    /// the wire by `await_call` if one is pending, else reading a fresh
    /// one from the socket. Only the fresh-read path performs I/O, so
    /// only it needs alert/timeout guarding.
    async fn take_item_code(&mut self) -> Result<ItemCode> {
        if let Some(code) = self.pending_code.take() {
            return Ok(code);
        }
        let socket = &mut self.socket;
        let recv = read_item_code_async(socket);
        if self.config.alertable {
            tokio::select! {
                res = recv => res,
                _ = self.alert.notified() => {
                    Err(Failure::new(FailureReason::Alerted, "receive was alerted"))
                }
            }
        } else if let Some(timeout) = self.config.read_timeout {
            match tokio::time::timeout(timeout, recv).await {
                Ok(res) => res,
                Err(_) => Err(Failure::new(FailureReason::ReadTimeout, "recv timed out")),
            }
        } else {
            recv.await
        }
    }

    async fn guarded_recv_code(&mut self, expect: ItemCode) -> Result<()> {
        self.check_not_failed()?;
        let code = match self.take_item_code().await {
            Ok(code) => code,
            Err(f) => return Err(self.fail(f)),
        };
        self.expect_code(code, expect)
    }

    fn expect_code(&mut self, code: ItemCode, expect: ItemCode) -> Result<()> {
        if code != expect {
            return Err(self.fail(Failure::new(
                FailureReason::ProtocolViolation,
                format!("expected {expect:?}, got {code:?}"),
            )));
        }
        Ok(())
    }

    // -- call identification ------------------------------------------------

    /// Caller side: begins a new call, advancing `Initial -> Ready`.
    #[instrument(skip(self), name = "srpc.call", fields(proc_id))]
    pub async fn start_call(&mut self, proc_id: i32, intf_version: i32) -> Result<()> {
        self.check_not_failed()?;
        if self.state != State::Initial {
            return Err(self.fail(Failure::new(
                FailureReason::ProtocolViolation,
                "start_call outside Initial state",
            )));
        }
        let mut buf = Vec::new();
        wire::write_item_code(&mut buf, ItemCode::StartCall).map_err(Failure::from)?;
        wire::write_i32(&mut buf, proc_id).map_err(Failure::from)?;
        wire::write_i32(&mut buf, intf_version).map_err(Failure::from)?;
        self.write_all(&buf).await?;
        self.call_id = Some((proc_id, intf_version));
        self.state = State::Ready;
        Ok(())
    }

    /// Callee side: consumes a `start_call` item if present, or treats
    /// the next item as data with both ids wildcarded — see spec §9's
    /// note on this asymmetry with the caller side.
    pub async fn await_call(&mut self) -> Result<(i32, i32)> {
        self.check_not_failed()?;
        if self.state != State::Initial {
            return Err(self.fail(Failure::new(
                FailureReason::ProtocolViolation,
                "await_call outside Initial state",
            )));
        }
        let code = match self.take_item_code().await {
            Ok(code) => code,
            Err(f) => return Err(self.fail(f)),
        };
        let ids = if code == ItemCode::StartCall {
            let proc_id = self.read_i32_raw().await?;
            let intf_version = self.read_i32_raw().await?;
            (proc_id, intf_version)
        } else {
            // Not a start_call: this is the first datum of the call
            // itself, with both ids wildcarded. Put the code back so
            // the caller's first recv_* picks it up.
            self.pending_code = Some(code);
            (ANY, ANY)
        };
        self.call_id = Some(ids);
        self.state = State::Ready;
        Ok(ids)
    }

    async fn read_i32_raw(&mut self) -> Result<i32> {
        let mut buf = [0u8; 4];
        self.socket.read_exact(&mut buf).await.map_err(|e| {
            self.fail(Failure::new(FailureReason::TransportFailure, e.to_string()))
        })?;
        Ok(i32::from_be_bytes(buf))
    }

    // -- data transfer --------------------------------------------------

    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.socket
            .write_all(buf)
            .await
            .map_err(|e| self.fail(Failure::new(FailureReason::TransportFailure, e.to_string())))
    }

    fn enter_data_out(&mut self) -> Result<()> {
        match self.state {
            State::Ready | State::DataOut => {
                self.state = State::DataOut;
                Ok(())
            }
            _ => Err(self.fail(Failure::new(
                FailureReason::ProtocolViolation,
                "send outside Ready/DataOut",
            ))),
        }
    }

    fn enter_data_in(&mut self) -> Result<()> {
        match self.state {
            State::Ready | State::DataIn => {
                self.state = State::DataIn;
                Ok(())
            }
            _ => Err(self.fail(Failure::new(
                FailureReason::ProtocolViolation,
                "recv outside Ready/DataIn",
            ))),
        }
    }

    pub async fn send_int32(&mut self, v: i32) -> Result<()> {
        self.enter_data_out()?;
        let mut buf = Vec::new();
        wire::write_item_code(&mut buf, ItemCode::Int32).map_err(Failure::from)?;
        wire::write_i32(&mut buf, v).map_err(Failure::from)?;
        self.write_all(&buf).await
    }

    pub async fn recv_int32(&mut self) -> Result<i32> {
        self.enter_data_in()?;
        self.guarded_recv_code(ItemCode::Int32).await?;
        self.read_i32_raw().await
    }

    pub async fn send_int64(&mut self, v: i64) -> Result<()> {
        self.enter_data_out()?;
        let mut buf = Vec::new();
        wire::write_item_code(&mut buf, ItemCode::Int64).map_err(Failure::from)?;
        wire::write_i64(&mut buf, v).map_err(Failure::from)?;
        self.write_all(&buf).await
    }

    pub async fn recv_int64(&mut self) -> Result<i64> {
        self.enter_data_in()?;
        self.guarded_recv_code(ItemCode::Int64).await?;
        let mut buf = [0u8; 8];
        self.socket.read_exact(&mut buf).await.map_err(|e| {
            self.fail(Failure::new(FailureReason::TransportFailure, e.to_string()))
        })?;
        Ok(i64::from_be_bytes(buf))
    }

    pub async fn send_bool(&mut self, v: bool) -> Result<()> {
        self.enter_data_out()?;
        let code = if v { ItemCode::BoolTrue } else { ItemCode::BoolFalse };
        let mut buf = Vec::new();
        wire::write_item_code(&mut buf, code).map_err(Failure::from)?;
        self.write_all(&buf).await
    }

    pub async fn recv_bool(&mut self) -> Result<bool> {
        self.enter_data_in()?;
        self.check_not_failed()?;
        let code = match self.take_item_code().await {
            Ok(code) => code,
            Err(f) => return Err(self.fail(f)),
        };
        match code {
            ItemCode::BoolTrue => Ok(true),
            ItemCode::BoolFalse => Ok(false),
            other => Err(self.fail(Failure::new(
                FailureReason::ProtocolViolation,
                format!("expected bool item, got {other:?}"),
            ))),
        }
    }

    pub async fn send_text(&mut self, s: &str) -> Result<()> {
        self.enter_data_out()?;
        let mut buf = Vec::new();
        wire::write_item_code(&mut buf, ItemCode::Text).map_err(Failure::from)?;
        wire::write_text(&mut buf, s).map_err(Failure::from)?;
        self.write_all(&buf).await
    }

    pub async fn recv_text(&mut self) -> Result<String> {
        self.enter_data_in()?;
        self.guarded_recv_code(ItemCode::Text).await?;
        read_text_async(&mut self.socket, self.config.max_bytes_field).await
    }

    pub async fn send_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.enter_data_out()?;
        let mut buf = Vec::new();
        wire::write_item_code(&mut buf, ItemCode::Bytes).map_err(Failure::from)?;
        wire::write_bytes(&mut buf, data).map_err(Failure::from)?;
        self.write_all(&buf).await
    }

    pub async fn recv_bytes(&mut self) -> Result<Vec<u8>> {
        self.enter_data_in()?;
        self.guarded_recv_code(ItemCode::Bytes).await?;
        read_bytes_async(&mut self.socket, self.config.max_bytes_field).await
    }

    /// Enters the coroutine-like "in sequence" sub-state; only sequence
    /// element sends are legal until [`Endpoint::send_seq_end`].
    pub async fn send_seq_start(&mut self) -> Result<()> {
        if self.state != State::DataOut {
            return Err(self.fail(Failure::new(
                FailureReason::ProtocolViolation,
                "send_seq_start outside DataOut",
            )));
        }
        let mut buf = Vec::new();
        wire::write_item_code(&mut buf, ItemCode::SeqStart).map_err(Failure::from)?;
        self.write_all(&buf).await?;
        self.state = State::SeqOut;
        Ok(())
    }

    pub async fn send_seq_end(&mut self) -> Result<()> {
        if self.state != State::SeqOut {
            return Err(self.fail(Failure::new(
                FailureReason::ProtocolViolation,
                "send_seq_end outside SeqOut",
            )));
        }
        let mut buf = Vec::new();
        wire::write_item_code(&mut buf, ItemCode::SeqEnd).map_err(Failure::from)?;
        self.write_all(&buf).await?;
        self.state = State::DataOut;
        Ok(())
    }

    pub async fn recv_seq_start(&mut self) -> Result<()> {
        if self.state != State::DataIn {
            return Err(self.fail(Failure::new(
                FailureReason::ProtocolViolation,
                "recv_seq_start outside DataIn",
            )));
        }
        self.guarded_recv_code(ItemCode::SeqStart).await?;
        self.state = State::SeqIn;
        Ok(())
    }

    pub async fn recv_seq_end(&mut self) -> Result<()> {
        if self.state != State::SeqIn {
            return Err(self.fail(Failure::new(
                FailureReason::ProtocolViolation,
                "recv_seq_end outside SeqIn",
            )));
        }
        self.guarded_recv_code(ItemCode::SeqEnd).await?;
        self.state = State::DataIn;
        Ok(())
    }

    /// Ends the sender's half of the call. For the callee this requires
    /// a round-trip `end_ack` before returning, so that a caller-side
    /// unmarshal error surfaces before the callee releases its lock.
    pub async fn send_end(&mut self) -> Result<()> {
        if !matches!(self.state, State::Ready | State::DataOut) {
            return Err(self.fail(Failure::new(
                FailureReason::ProtocolViolation,
                "send_end outside Ready/DataOut",
            )));
        }
        let mut buf = Vec::new();
        wire::write_item_code(&mut buf, ItemCode::End).map_err(Failure::from)?;
        self.write_all(&buf).await?;

        match self.role {
            WhichEnd::Caller => {
                self.state = State::Ready;
            }
            WhichEnd::Callee => {
                self.guarded_recv_code(ItemCode::EndAck).await?;
                self.state = State::Initial;
            }
        }
        Ok(())
    }

    pub async fn recv_end(&mut self) -> Result<()> {
        if !matches!(self.state, State::Ready | State::DataIn) {
            return Err(self.fail(Failure::new(
                FailureReason::ProtocolViolation,
                "recv_end outside Ready/DataIn",
            )));
        }
        self.guarded_recv_code(ItemCode::End).await?;

        if self.role == WhichEnd::Caller {
            let mut buf = Vec::new();
            wire::write_item_code(&mut buf, ItemCode::EndAck).map_err(Failure::from)?;
            self.write_all(&buf).await?;
            self.state = State::Initial;
        } else {
            self.state = State::Ready;
        }
        Ok(())
    }

    /// Marshals a failure item then transitions to `Failed`. Unless
    /// `remote_only`, the error is also returned to the local caller.
    pub async fn send_failure(&mut self, reason: FailureReason, msg: &str, remote_only: bool) -> Result<()> {
        let mut buf = Vec::new();
        wire::write_item_code(&mut buf, ItemCode::Failure).map_err(Failure::from)?;
        wire::write_i32(&mut buf, reason as i32).map_err(Failure::from)?;
        wire::write_text(&mut buf, msg).map_err(Failure::from)?;
        let _ = self.socket.write_all(&buf).await;

        let failure = Failure::new(reason, msg);
        self.state = State::Failed;
        self.failure = Some(failure.clone());
        if remote_only {
            Ok(())
        } else {
            Err(failure)
        }
    }
}

async fn read_item_code_async<S: AsyncRead + Unpin>(socket: &mut S) -> Result<ItemCode> {
    let mut byte = [0u8; 1];
    socket
        .read_exact(&mut byte)
        .await
        .map_err(|e| Failure::new(FailureReason::TransportFailure, e.to_string()))?;
    num_traits::FromPrimitive::from_u8(byte[0])
        .ok_or_else(|| Failure::new(FailureReason::ProtocolViolation, format!("unknown item code {:#04x}", byte[0])))
}

async fn read_bytes_async<S: AsyncRead + Unpin>(socket: &mut S, max: usize) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    socket
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| Failure::new(FailureReason::TransportFailure, e.to_string()))?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max {
        return Err(Failure::new(
            FailureReason::ProtocolViolation,
            format!("length {len} exceeds maximum {max}"),
        ));
    }
    let mut data = vec![0u8; len];
    socket
        .read_exact(&mut data)
        .await
        .map_err(|e| Failure::new(FailureReason::TransportFailure, e.to_string()))?;
    Ok(data)
}

async fn read_text_async<S: AsyncRead + Unpin>(socket: &mut S, max: usize) -> Result<String> {
    let bytes = read_bytes_async(socket, max).await?;
    String::from_utf8(bytes).map_err(|_| Failure::new(FailureReason::ProtocolViolation, "field is not valid utf-8"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    async fn handshake_pair() -> (Endpoint<impl AsyncRead + AsyncWrite + Unpin>, Endpoint<impl AsyncRead + AsyncWrite + Unpin>) {
        let (client_sock, server_sock) = duplex(64 * 1024);
        let client = Endpoint::handshake(client_sock, WhichEnd::Caller, EndpointConfig::default());
        let server = Endpoint::handshake(server_sock, WhichEnd::Callee, EndpointConfig::default());
        let (client, server) = tokio::join!(client, server);
        (client.unwrap(), server.unwrap())
    }

    #[tokio::test]
    async fn handshake_then_call_roundtrips_int32() {
        let (mut client, mut server) = handshake_pair().await;

        let call = async {
            client.start_call(7, ANY).await.unwrap();
            client.send_int32(42).await.unwrap();
            client.send_end().await.unwrap();
            client.recv_end().await.unwrap();
        };
        let serve = async {
            let (proc_id, _) = server.await_call().await.unwrap();
            assert_eq!(proc_id, 7);
            let v = server.recv_int32().await.unwrap();
            assert_eq!(v, 42);
            server.recv_end().await.unwrap();
            server.send_end().await.unwrap();
        };
        tokio::join!(call, serve);

        assert_eq!(client.state(), State::Initial);
        assert_eq!(server.state(), State::Initial);
    }

    #[tokio::test]
    async fn mismatched_item_code_is_protocol_violation() {
        let (mut client, mut server) = handshake_pair().await;
        client.start_call(1, ANY).await.unwrap();
        client.send_text("not an int").await.unwrap();
        client.send_end().await.unwrap();

        let (_, _) = server.await_call().await.unwrap();
        let err = server.recv_int32().await.unwrap_err();
        assert_eq!(err.reason, FailureReason::ProtocolViolation);
        assert_eq!(server.state(), State::Failed);
    }

    #[tokio::test]
    async fn sequence_bracket_transitions() {
        let (mut client, mut server) = handshake_pair().await;
        client.start_call(1, ANY).await.unwrap();
        client.send_int32(3).await.unwrap();
        client.send_seq_start().await.unwrap();
        client.send_int32(1).await.unwrap();
        client.send_int32(2).await.unwrap();
        client.send_seq_end().await.unwrap();
        client.send_end().await.unwrap();

        server.await_call().await.unwrap();
        assert_eq!(server.recv_int32().await.unwrap(), 3);
        server.recv_seq_start().await.unwrap();
        assert_eq!(server.recv_int32().await.unwrap(), 1);
        assert_eq!(server.recv_int32().await.unwrap(), 2);
        server.recv_seq_end().await.unwrap();
        server.recv_end().await.unwrap();
    }
}
