//! Local TCP tunnel to a private machine's Ollama service.
//!
//! One authenticated SSH session carries every forwarded connection as
//! its own direct-tcpip channel. The session runs in non-blocking mode
//! so channels multiplex fairly: no read on one connection can hold the
//! session lock while another connection has data to move. Each
//! accepted connection is pumped by its own thread, and a failure there
//! never affects other connections or the accept loop.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use ssh2::Channel;
use thiserror::Error;
use tracing::{info, warn};

use crate::connectivity::{ConnectivityKind, LOOPBACK_HOST};
use crate::machine::{Machine, OLLAMA_DEFAULT_PORT};
use crate::ssh::{SshClient, SshError};

const IDLE_BACKOFF: Duration = Duration::from_millis(5);
const CHANNEL_OPEN_RETRY: Duration = Duration::from_millis(10);
const BUFFER_SIZE: usize = 16 * 1024;
const LIBSSH2_ERROR_EAGAIN: i32 = -37;

/// Errors raised while setting up or running a tunnel.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Raised before any network action when the machine's connectivity
    /// is not private.
    #[error(
        "tunneling requires private connectivity, but machine {name} was created as {connectivity}"
    )]
    ConnectivityNotSupported {
        /// Machine name.
        name: String,
        /// Connectivity the machine was created with.
        connectivity: ConnectivityKind,
    },
    /// Raised when the machine has no address or key pair.
    #[error("machine {name} has no address or key pair for SSH")]
    MissingSshTarget {
        /// Machine name.
        name: String,
    },
    /// Raised when the SSH session cannot be established.
    #[error("ssh connection failed: {0}")]
    Ssh(#[from] SshError),
    /// Raised when the local listener cannot be bound.
    #[error("failed to listen on 127.0.0.1:{port}: {message}")]
    Listen {
        /// Local port that could not be bound.
        port: u16,
        /// Underlying error message.
        message: String,
    },
    /// Raised when accepting a local connection fails fatally.
    #[error("accept failed: {message}")]
    Accept {
        /// Underlying error message.
        message: String,
    },
}

/// A local listener forwarding connections to one machine's Ollama
/// port.
pub struct Tunnel {
    machine: Machine,
    local_port: u16,
    remote_port: u16,
}

impl Tunnel {
    /// Prepares a tunnel for the machine, rejecting any connectivity
    /// other than private before any network action is taken.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::ConnectivityNotSupported`] for non-private
    /// machines.
    pub fn new(machine: Machine) -> Result<Self, TunnelError> {
        if machine.connectivity != ConnectivityKind::Private {
            return Err(TunnelError::ConnectivityNotSupported {
                name: machine.instance.name.clone(),
                connectivity: machine.connectivity,
            });
        }
        Ok(Self {
            machine,
            local_port: OLLAMA_DEFAULT_PORT,
            remote_port: OLLAMA_DEFAULT_PORT,
        })
    }

    /// Overrides the local listening port.
    #[must_use]
    pub const fn with_local_port(mut self, port: u16) -> Self {
        self.local_port = port;
        self
    }

    /// Overrides the remote service port.
    #[must_use]
    pub const fn with_remote_port(mut self, port: u16) -> Self {
        self.remote_port = port;
        self
    }

    /// Runs the tunnel until the process is terminated or accepting
    /// fails fatally.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError`] when the SSH session, the listener, or
    /// the accept loop fails.
    pub fn serve(&self) -> Result<(), TunnelError> {
        let target =
            self.machine
                .ssh_target()
                .ok_or_else(|| TunnelError::MissingSshTarget {
                    name: self.machine.instance.name.clone(),
                })?;
        let client = SshClient::connect(&target)?;

        let remote_host = if self.machine.ollama.host.is_empty() {
            LOOPBACK_HOST.to_owned()
        } else {
            self.machine.ollama.host.clone()
        };

        let listener = TcpListener::bind(("127.0.0.1", self.local_port)).map_err(|err| {
            TunnelError::Listen {
                port: self.local_port,
                message: err.to_string(),
            }
        })?;

        // Channel opens and reads must not block while holding the
        // session; switch after authentication so multiplexing stays
        // fair across connections.
        client.session().set_blocking(false);

        info!(
            local_port = self.local_port,
            remote_port = self.remote_port,
            "tunnel available"
        );

        loop {
            let (stream, peer) = listener.accept().map_err(|err| TunnelError::Accept {
                message: err.to_string(),
            })?;

            match open_channel(&client, &remote_host, self.remote_port) {
                Ok(channel) => {
                    thread::spawn(move || {
                        if let Err(err) = forward(channel, &stream) {
                            warn!(error = %err, "forwarded connection closed with error");
                        }
                    });
                }
                Err(err) => {
                    // One failed connection never stops the listener.
                    warn!(peer = %peer, error = %err, "failed to open forwarding channel");
                }
            }
        }
    }
}

fn open_channel(client: &SshClient, host: &str, port: u16) -> Result<Channel, SshError> {
    loop {
        match client.session().channel_direct_tcpip(host, port, None) {
            Ok(channel) => return Ok(channel),
            Err(err) if is_would_block(&err) => thread::sleep(CHANNEL_OPEN_RETRY),
            Err(err) => {
                return Err(SshError::Channel {
                    host: host.to_owned(),
                    port,
                    message: err.to_string(),
                });
            }
        }
    }
}

fn is_would_block(err: &ssh2::Error) -> bool {
    matches!(err.code(), ssh2::ErrorCode::Session(LIBSSH2_ERROR_EAGAIN))
}

/// One direction of a forwarded connection: a buffer between a
/// non-blocking reader and a non-blocking writer.
struct Pipe {
    buffer: Vec<u8>,
    start: usize,
    end: usize,
    read_closed: bool,
}

impl Pipe {
    fn new() -> Self {
        Self {
            buffer: vec![0; BUFFER_SIZE],
            start: 0,
            end: 0,
            read_closed: false,
        }
    }

    /// Moves bytes reader-to-writer without blocking; returns whether
    /// any progress was made.
    fn shuttle(
        &mut self,
        reader: &mut impl Read,
        writer: &mut impl Write,
    ) -> io::Result<bool> {
        let mut progressed = false;

        if !self.read_closed && self.end < self.buffer.len() {
            match reader.read(&mut self.buffer[self.end..]) {
                Ok(0) => {
                    self.read_closed = true;
                    progressed = true;
                }
                Ok(count) => {
                    self.end += count;
                    progressed = true;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => return Err(err),
            }
        }

        if self.start < self.end {
            match writer.write(&self.buffer[self.start..self.end]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "peer stopped accepting data",
                    ));
                }
                Ok(count) => {
                    self.start += count;
                    progressed = true;
                    if self.start == self.end {
                        self.start = 0;
                        self.end = 0;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => return Err(err),
            }
        }

        Ok(progressed)
    }

    fn drained(&self) -> bool {
        self.read_closed && self.start == self.end
    }
}

/// Splices one local connection with one channel. Both directions are
/// pumped independently with their own buffers, so a stall on one side
/// never blocks the other.
fn forward(mut channel: Channel, stream: &TcpStream) -> io::Result<()> {
    stream.set_nonblocking(true)?;

    let mut outbound = Pipe::new(); // local -> channel
    let mut inbound = Pipe::new(); // channel -> local
    let mut sent_eof = false;
    let mut local_shutdown = false;

    loop {
        let mut progressed = false;
        progressed |= outbound.shuttle(&mut &*stream, &mut channel)?;
        progressed |= inbound.shuttle(&mut channel, &mut &*stream)?;

        if outbound.drained() && !sent_eof {
            match channel.send_eof() {
                Ok(()) => sent_eof = true,
                Err(err) if is_would_block(&err) => {}
                Err(err) => return Err(io::Error::other(err.to_string())),
            }
        }
        if inbound.drained() && !local_shutdown {
            stream.shutdown(Shutdown::Write).ok();
            local_shutdown = true;
        }
        if outbound.drained() && inbound.drained() {
            break;
        }
        if !progressed {
            thread::sleep(IDLE_BACKOFF);
        }
    }

    channel.close().ok();
    Ok(())
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;

    use crate::connectivity::ConnectivityKind;
    use crate::machine::OllamaEndpoint;
    use crate::provider::{MachineState, ProviderMachine};
    use crate::ssh::KeyPairFiles;

    use super::*;

    fn machine(connectivity: ConnectivityKind) -> Machine {
        Machine {
            instance: ProviderMachine {
                id: String::from("m-1"),
                name: String::from("demo"),
                ip: Some(String::from("198.51.100.7")),
                region: String::new(),
                state: MachineState::Running,
            },
            ollama: OllamaEndpoint {
                host: String::from("localhost"),
                port: OLLAMA_DEFAULT_PORT,
            },
            provider_name: String::from("noop"),
            credentials_name: String::from("acct1"),
            connectivity,
            key_pair: Some(KeyPairFiles {
                private_key_path: Utf8PathBuf::from("/tmp/keys/demo"),
                public_key_path: Utf8PathBuf::from("/tmp/keys/demo.pub"),
            }),
        }
    }

    #[test]
    fn rejects_public_machines_before_any_network_action() {
        let result = Tunnel::new(machine(ConnectivityKind::Public));
        assert!(matches!(
            result,
            Err(TunnelError::ConnectivityNotSupported {
                ref name,
                connectivity: ConnectivityKind::Public,
            }) if name == "demo"
        ));
    }

    #[test]
    fn rejects_tailscale_machines() {
        let result = Tunnel::new(machine(ConnectivityKind::Tailscale));
        assert!(matches!(
            result,
            Err(TunnelError::ConnectivityNotSupported { .. })
        ));
    }

    #[test]
    fn accepts_private_machines_with_default_ports() {
        let tunnel =
            Tunnel::new(machine(ConnectivityKind::Private)).unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(tunnel.local_port, OLLAMA_DEFAULT_PORT);
        assert_eq!(tunnel.remote_port, OLLAMA_DEFAULT_PORT);

        let custom = Tunnel::new(machine(ConnectivityKind::Private))
            .unwrap_or_else(|err| panic!("{err}"))
            .with_local_port(8080)
            .with_remote_port(9090);
        assert_eq!(custom.local_port, 8080);
        assert_eq!(custom.remote_port, 9090);
    }

    #[test]
    fn pipe_moves_bytes_and_tracks_eof() {
        let mut pipe = Pipe::new();
        let mut source: &[u8] = b"hello";
        let mut sink = Vec::new();

        let progressed = pipe
            .shuttle(&mut source, &mut sink)
            .unwrap_or_else(|err| panic!("{err}"));
        assert!(progressed);
        assert_eq!(sink, b"hello");
        assert!(!pipe.drained());

        // The source is exhausted; the next shuttle observes EOF.
        pipe.shuttle(&mut source, &mut sink)
            .unwrap_or_else(|err| panic!("{err}"));
        assert!(pipe.drained());
    }
}
