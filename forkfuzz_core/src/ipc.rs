use crate::input::Input;
use crate::sys;
use bincode::config::Configuration;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};

/// Upper bound on a single frame, guarding against a corrupt length prefix.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

const LEN_PREFIX: usize = 4;

/// Messages a worker sends to the supervisor.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum WorkerMessage<I> {
    /// Asks for the next iteration id.
    Claim,
    /// Announces the input about to be deployed. `data` is `None` when the
    /// generator faulted before producing anything.
    Running {
        sample_id: u64,
        suite: u32,
        generator: String,
        data: Option<I>,
    },
    /// The iteration completed; `fault` carries the unrescued error, if any.
    Finished {
        sample_id: u64,
        fault: Option<String>,
    },
}

/// Messages the supervisor sends to a worker.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorMessage {
    Grant { sample_id: u64 },
    Stop,
}

fn codec() -> Configuration {
    bincode::config::standard()
}

fn invalid_data(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// Writes one length-prefixed frame. Prefix and payload go out in a single
/// write so small frames stay atomic on a pipe.
pub fn write_frame<T: Serialize, W: Write>(writer: &mut W, message: &T) -> io::Result<()> {
    let payload = bincode::serde::encode_to_vec(message, codec())
        .map_err(|e| invalid_data(format!("failed to encode frame: {e}")))?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(invalid_data(format!(
            "frame of {} bytes exceeds limit of {MAX_FRAME_LEN}",
            payload.len()
        )));
    }
    let mut frame = Vec::with_capacity(LEN_PREFIX + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    writer.write_all(&frame)?;
    writer.flush()
}

/// Reads one frame. `Ok(None)` means the peer closed the channel cleanly
/// between frames.
pub fn read_frame<T: DeserializeOwned, R: Read>(reader: &mut R) -> io::Result<Option<T>> {
    let mut prefix = [0u8; LEN_PREFIX];
    let mut filled = 0;
    while filled < LEN_PREFIX {
        match reader.read(&mut prefix[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "channel closed inside a frame header",
                ));
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    let len = u32::from_le_bytes(prefix) as usize;
    if len > MAX_FRAME_LEN {
        return Err(invalid_data(format!(
            "frame length {len} exceeds limit of {MAX_FRAME_LEN}"
        )));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    let (message, _consumed) = bincode::serde::decode_from_slice(&payload, codec())
        .map_err(|e| invalid_data(format!("failed to decode frame: {e}")))?;
    Ok(Some(message))
}

/// Supervisor side of one worker's channel.
#[derive(Debug)]
pub struct SupervisorEnd {
    from_worker: File,
    to_worker: File,
}

impl SupervisorEnd {
    pub fn send(&mut self, message: &SupervisorMessage) -> io::Result<()> {
        write_frame(&mut self.to_worker, message)
    }

    pub fn recv<I: Input>(&mut self) -> io::Result<Option<WorkerMessage<I>>> {
        read_frame(&mut self.from_worker)
    }

    /// Descriptor to poll for incoming worker messages.
    pub fn poll_fd(&self) -> RawFd {
        self.from_worker.as_raw_fd()
    }
}

/// Worker side of the channel.
#[derive(Debug)]
pub struct WorkerEnd {
    from_supervisor: File,
    to_supervisor: File,
}

impl WorkerEnd {
    pub fn send<I: Input>(&mut self, message: &WorkerMessage<I>) -> io::Result<()> {
        write_frame(&mut self.to_supervisor, message)
    }

    pub fn recv(&mut self) -> io::Result<Option<SupervisorMessage>> {
        read_frame(&mut self.from_supervisor)
    }
}

/// Creates the pair of pipes connecting a supervisor to one worker.
pub fn channel() -> io::Result<(SupervisorEnd, WorkerEnd)> {
    let (from_worker, to_supervisor) = sys::pipe()?;
    let (from_supervisor, to_worker) = sys::pipe()?;
    Ok((
        SupervisorEnd {
            from_worker,
            to_worker,
        },
        WorkerEnd {
            from_supervisor,
            to_supervisor,
        },
    ))
}
