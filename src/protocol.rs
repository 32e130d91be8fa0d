use log::{info, trace, warn};
use std::fmt::Display;
use std::time::Duration;
use thiserror::Error;

use crate::device_ids::{self, UsbId};
use crate::wire::{self, WireError};

/// Timeout for every bulk transfer in the handshake.
const IO_TIMEOUT: Duration = Duration::from_millis(5000);

/// The device answers each phase with one block of this size.
const ACK_LEN: usize = 512;

/// Something that can produce an exclusive bulk pipe to the target device.
///
/// Device selection, reset policy, and interface choice are the
/// implementation's configuration; the sequencer only asks it to open.
pub trait Transport {
    type Pipe: Pipe;

    fn open(&mut self) -> Result<Self::Pipe, TransportError>;
}

/// An open, claimed bulk pipe. The sequencer owns the pipe for exactly one
/// run and closes it on every exit path.
pub trait Pipe {
    /// Write `data` to the given endpoint. A write that moves fewer bytes
    /// than requested must be reported as [TransportError::ShortTransfer].
    fn bulk_write(
        &mut self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    /// Read up to `buf.len()` bytes from the given endpoint.
    fn bulk_read(
        &mut self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    /// Release the interface and dispose of the pipe's resources. Idempotent.
    fn close(&mut self) -> Result<(), TransportError>;
}

/// Failures the transport can report.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TransportError {
    #[error("no device with ID {id} present")]
    DeviceNotFound { id: UsbId },

    #[error("USB I/O failed")]
    Usb(#[from] rusb::Error),

    #[error("short transfer: moved {actual} of {expected} bytes")]
    ShortTransfer { expected: usize, actual: usize },
}

/// All errors that can end an unlock run.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("cannot encode unlock request")]
    Wire(#[from] WireError),

    #[error("failed to open USB device")]
    Open(#[source] TransportError),

    #[error("USB transaction error while {step}")]
    Transfer {
        source: TransportError,
        step: Step,
    },
}

/// The transfers of the handshake, in the only order the firmware accepts.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Step {
    PasswordHeader1,
    PasswordBlock1,
    Ack1,
    PasswordHeader2,
    PasswordBlock2,
    Ack2,
    Relink,
    Ack3,
}

impl Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            Step::PasswordHeader1 => "sending password header 1",
            Step::PasswordBlock1 => "sending password block 1",
            Step::Ack1 => "reading acknowledgement 1",
            Step::PasswordHeader2 => "sending password header 2",
            Step::PasswordBlock2 => "sending password block 2",
            Step::Ack2 => "reading acknowledgement 2",
            Step::Relink => "sending relink command",
            Step::Ack3 => "reading acknowledgement 3",
        };
        f.write_str(name)
    }
}

/// Direction of a completed transfer, as reported to the [EventSink].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    Out,
    In,
}

/// Observer for completed transfers. The sequencer reports every step here
/// instead of holding any process-wide state of its own.
pub trait EventSink {
    fn transfer(&mut self, step: Step, direction: Direction, bytes: usize);
}

/// Default sink: forwards transfer events to the `log` crate.
pub struct LogSink;

impl EventSink for LogSink {
    fn transfer(&mut self, step: Step, direction: Direction, bytes: usize) {
        let arrow = match direction {
            Direction::Out => "host->device",
            Direction::In => "device->host",
        };
        info!("{arrow}: {step} done ({bytes} bytes)");
    }
}

/// Progress of a single unlock attempt. One session covers exactly one run;
/// nothing persists across runs.
#[derive(Debug, Default)]
pub struct UnlockSession {
    last: Option<Step>,
}

impl UnlockSession {
    /// The most recently completed transfer, if any.
    pub fn last_completed(&self) -> Option<Step> {
        self.last
    }

    fn advance(&mut self, step: Step) {
        self.last = Some(step);
    }
}

/// Run the whole unlock handshake, logging transfer events via [LogSink].
pub fn run_unlock<T: Transport>(password: &str, transport: &mut T) -> Result<(), Error> {
    run_unlock_with(password, transport, &mut LogSink)
}

/// Run the whole unlock handshake against `transport`, reporting each
/// completed transfer to `sink`.
///
/// The device wants the password twice, under two different sub-command
/// selectors, before it accepts the relink command. Reordering or merging the
/// phases is not an option: firmware behavior for any other ordering is
/// unverified, and a mis-sequenced transfer hangs the device silently.
pub fn run_unlock_with<T: Transport>(
    password: &str,
    transport: &mut T,
    sink: &mut dyn EventSink,
) -> Result<(), Error> {
    let payload = wire::password_payload(password)?;
    let header1 = wire::password_header(wire::PHASE_ONE_PARAM, payload.len() as u32)?;
    let header2 = wire::password_header(wire::PHASE_TWO_PARAM, payload.len() as u32)?;
    let relink = wire::relink_command();

    let mut pipe = transport.open().map_err(Error::Open)?;

    let result = handshake(
        &mut pipe,
        &header1.encode(),
        &header2.encode(),
        &payload,
        &relink.encode(),
        sink,
    );

    // Close runs even when the handshake failed; a close failure is logged
    // rather than replacing the handshake error.
    if let Err(e) = pipe.close() {
        warn!("failed to release USB interface: {e}");
    }

    result
}

fn handshake<P: Pipe>(
    pipe: &mut P,
    header1: &[u8],
    header2: &[u8],
    payload: &[u8],
    relink: &[u8],
    sink: &mut dyn EventSink,
) -> Result<(), Error> {
    let mut session = UnlockSession::default();

    send(pipe, &mut session, sink, Step::PasswordHeader1, header1)?;
    send(pipe, &mut session, sink, Step::PasswordBlock1, payload)?;
    recv_ack(pipe, &mut session, sink, Step::Ack1)?;

    send(pipe, &mut session, sink, Step::PasswordHeader2, header2)?;
    send(pipe, &mut session, sink, Step::PasswordBlock2, payload)?;
    recv_ack(pipe, &mut session, sink, Step::Ack2)?;

    send(pipe, &mut session, sink, Step::Relink, relink)?;
    recv_ack(pipe, &mut session, sink, Step::Ack3)?;

    debug_assert_eq!(session.last_completed(), Some(Step::Ack3));
    Ok(())
}

fn send<P: Pipe>(
    pipe: &mut P,
    session: &mut UnlockSession,
    sink: &mut dyn EventSink,
    step: Step,
    data: &[u8],
) -> Result<(), Error> {
    trace!("host->device ({} bytes): {:02x?}", data.len(), data);

    let sent = pipe
        .bulk_write(device_ids::ENDPOINT_OUT, data, IO_TIMEOUT)
        .map_err(|source| Error::Transfer { source, step })?;

    sink.transfer(step, Direction::Out, sent);
    session.advance(step);
    Ok(())
}

fn recv_ack<P: Pipe>(
    pipe: &mut P,
    session: &mut UnlockSession,
    sink: &mut dyn EventSink,
    step: Step,
) -> Result<(), Error> {
    let mut ack = [0u8; ACK_LEN];
    let got = pipe
        .bulk_read(device_ids::ENDPOINT_IN, &mut ack, IO_TIMEOUT)
        .map_err(|source| Error::Transfer { source, step })?;

    // The acknowledgement content carries nothing we act on; keep it in the
    // trace log for protocol debugging.
    trace!("device->host ({got} bytes): {:02x?}", &ack[..got]);

    sink.transfer(step, Direction::In, got);
    session.advance(step);
    Ok(())
}
