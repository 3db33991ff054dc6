use std::io;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::codec::{self, DecodeError, TYPE_AUTH, TYPE_EXEC_COMMAND};

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("connection to {endpoint} timed out after {after:?}")]
    Timeout { endpoint: String, after: Duration },
    #[error("connection to {endpoint} was refused (is the server running with RCON enabled?)")]
    Refused { endpoint: String },
    #[error("failed to resolve {endpoint}: {source}")]
    AddressResolution {
        endpoint: String,
        #[source]
        source: io::Error,
    },
    #[error("authentication rejected by {endpoint}: {detail} (wrong RCON password?)")]
    AuthFailed { endpoint: String, detail: String },
    #[error("malformed response from {endpoint}: {source}")]
    Protocol {
        endpoint: String,
        #[source]
        source: DecodeError,
    },
    #[error("socket error talking to {endpoint}: {source}")]
    Io {
        endpoint: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Encode(#[from] codec::EncodeError),
}

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("RCON session is not connected")]
    NotConnected,
    #[error("no response to the command within {after:?}")]
    Timeout { after: Duration },
    #[error("RCON connection lost: {detail}")]
    ConnectionLost { detail: String },
    #[error(transparent)]
    Encode(#[from] codec::EncodeError),
}

/// One authenticated remote-console connection.
///
/// A session is constructed already authenticated by [`RconSession::connect`]
/// and is single-use: any socket error, timeout, or explicit
/// [`RconSession::disconnect`] is terminal, after which a fresh session must
/// be built. Commands run strictly one at a time; `&mut self` on
/// [`RconSession::execute`] makes pipelining unrepresentable.
#[derive(Debug)]
pub struct RconSession {
    stream: TcpStream,
    endpoint: String,
    next_request_id: i32,
    connected: bool,
}

impl RconSession {
    /// Opens a TCP connection and performs the AUTH handshake.
    ///
    /// Failure modes are reported distinctly (refused vs timed out vs
    /// unresolvable vs rejected credentials) so callers can give useful
    /// guidance. Authentication succeeds iff the response echoes our request
    /// id; the protocol's `-1` failure id is caught by the same predicate.
    /// The target server answers AUTH with exactly one packet, so a single
    /// read suffices here.
    ///
    /// The password is never logged.
    pub async fn connect(
        host: &str,
        port: u16,
        password: &str,
        io_timeout: Duration,
    ) -> Result<Self, ConnectError> {
        let endpoint = format!("{host}:{port}");

        let addr = {
            let mut addrs = tokio::net::lookup_host(&endpoint).await.map_err(|source| {
                ConnectError::AddressResolution {
                    endpoint: endpoint.clone(),
                    source,
                }
            })?;
            addrs.next().ok_or_else(|| ConnectError::AddressResolution {
                endpoint: endpoint.clone(),
                source: io::Error::new(
                    io::ErrorKind::NotFound,
                    "hostname resolved to no addresses",
                ),
            })?
        };

        let stream = match timeout(io_timeout, TcpStream::connect(addr)).await {
            Err(_) => {
                return Err(ConnectError::Timeout {
                    endpoint,
                    after: io_timeout,
                });
            }
            Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
                return Err(ConnectError::Refused { endpoint });
            }
            Ok(Err(source)) => return Err(ConnectError::Io { endpoint, source }),
            Ok(Ok(s)) => s,
        };

        let mut session = Self {
            stream,
            endpoint,
            next_request_id: 1,
            connected: false,
        };

        let request_id = session.take_request_id();
        tracing::debug!(endpoint = %session.endpoint, "sending RCON AUTH request");
        let frame = codec::encode(request_id, TYPE_AUTH, password)?;

        session.send(&frame, io_timeout).await.map_err(|e| match e {
            SendFailure::Timeout => ConnectError::Timeout {
                endpoint: session.endpoint.clone(),
                after: io_timeout,
            },
            SendFailure::Io(source) => ConnectError::Io {
                endpoint: session.endpoint.clone(),
                source,
            },
        })?;

        let response = match timeout(io_timeout, codec::decode(&mut session.stream)).await {
            Err(_) => {
                return Err(ConnectError::AuthFailed {
                    endpoint: session.endpoint,
                    detail: format!("no response to the AUTH request within {io_timeout:?}"),
                });
            }
            Ok(Err(source)) => {
                return Err(ConnectError::Protocol {
                    endpoint: session.endpoint,
                    source,
                });
            }
            Ok(Ok(p)) => p,
        };

        if response.request_id != request_id {
            return Err(ConnectError::AuthFailed {
                endpoint: session.endpoint,
                detail: format!(
                    "response id {} did not match request id {request_id}",
                    response.request_id
                ),
            });
        }

        session.connected = true;
        tracing::info!(endpoint = %session.endpoint, "RCON session authenticated");
        Ok(session)
    }

    /// Sends one command and returns the decoded response body verbatim; the
    /// caller interprets domain replies (player tables and the like).
    ///
    /// Any failure other than a rejected command body tears the session down:
    /// after a timeout the wire may hold a late response that would correlate
    /// with the wrong request, and after a socket error the frame boundary is
    /// unknown.
    pub async fn execute(
        &mut self,
        command: &str,
        io_timeout: Duration,
    ) -> Result<String, ExecError> {
        if !self.connected {
            return Err(ExecError::NotConnected);
        }

        let request_id = self.take_request_id();
        let frame = codec::encode(request_id, TYPE_EXEC_COMMAND, command)?;

        if let Err(e) = self.send(&frame, io_timeout).await {
            self.connected = false;
            return Err(match e {
                SendFailure::Timeout => ExecError::Timeout { after: io_timeout },
                SendFailure::Io(source) => ExecError::ConnectionLost {
                    detail: source.to_string(),
                },
            });
        }

        let response = match timeout(io_timeout, codec::decode(&mut self.stream)).await {
            Err(_) => {
                self.connected = false;
                return Err(ExecError::Timeout { after: io_timeout });
            }
            Ok(Err(source)) => {
                self.connected = false;
                return Err(ExecError::ConnectionLost {
                    detail: source.to_string(),
                });
            }
            Ok(Ok(p)) => p,
        };

        if response.request_id != request_id {
            self.connected = false;
            return Err(ExecError::ConnectionLost {
                detail: format!(
                    "response id {} did not match request id {request_id}",
                    response.request_id
                ),
            });
        }

        Ok(response.body)
    }

    /// Idempotent teardown. Returns whether a live connection was actually
    /// closed, so the caller can emit its disconnect notification exactly
    /// once.
    pub async fn disconnect(&mut self) -> bool {
        let was_connected = self.connected;
        self.connected = false;
        let _ = self.stream.shutdown().await;
        if was_connected {
            tracing::info!(endpoint = %self.endpoint, "RCON session closed");
        }
        was_connected
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn take_request_id(&mut self) -> i32 {
        let id = self.next_request_id;
        // The target server does not require unique ids, but monotonic ids
        // keep response correlation unambiguous on our side.
        self.next_request_id = self.next_request_id.wrapping_add(1).max(1);
        id
    }

    // Each call scopes its own deadline around the write; nothing about the
    // socket's configuration is mutated, so a long-deadline call never leaks
    // into the next one.
    async fn send(&mut self, frame: &[u8], io_timeout: Duration) -> Result<(), SendFailure> {
        match timeout(io_timeout, self.stream.write_all(frame)).await {
            Err(_) => Err(SendFailure::Timeout),
            Ok(Err(e)) => Err(SendFailure::Io(e)),
            Ok(Ok(())) => Ok(()),
        }
    }
}

enum SendFailure {
    Timeout,
    Io(io::Error),
}
