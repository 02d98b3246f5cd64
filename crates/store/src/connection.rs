use crate::error::StoreError;
use crate::metrics::{COMMANDS_SENT, CONNECT_FAILURES};
use crate::resp::{decode, Command, Reply};
use bytes::BytesMut;
use cregion_types::config::ServerConfig;
use metrics::counter;
use std::io::ErrorKind;
use std::time::Duration;
use tokio::io::Interest;
use tokio::net::TcpStream;
use tracing::{debug, info_span, warn, Instrument};

const READ_CHUNK: usize = 16 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ConnectionState {
    Connected,
    /// The connection failed.  Nothing more is sent on it and every command
    /// addressed to it counts as not acknowledged.
    Disconnecting,
}

/// Result of running a connection's I/O until its in-flight commands are
/// answered.
#[derive(Debug, Default)]
pub(crate) struct DriveOutcome {
    /// Replies, in the order the commands were queued.
    pub replies: Vec<Reply>,
    /// Set if the connection failed before every reply arrived.
    pub error: Option<StoreError>,
}

/// A pipelined connection to one replica server.
///
/// Commands are encoded into an output buffer as they are queued.  [`drive`]
/// then waits for socket readiness, writes from the output cursor when the
/// socket is writable and decodes replies when it is readable.
///
/// [`drive`]: Connection::drive
pub(crate) struct Connection {
    address: String,
    state: ConnectionState,
    stream: TcpStream,
    write_buf: BytesMut,
    write_cursor: usize,
    read_buf: BytesMut,
    in_flight: usize,
}

impl Connection {
    pub(crate) async fn connect(
        server: &ServerConfig,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let address = server.address();
        let span = info_span!("replica_connect", address = address.as_str());
        let result = async {
            let stream = match tokio::time::timeout(timeout, TcpStream::connect(&address)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(error)) => {
                    return Err(StoreError::Connect {
                        server: address.clone(),
                        message: error.to_string(),
                    })
                }
                Err(_) => {
                    return Err(StoreError::Connect {
                        server: address.clone(),
                        message: format!("no connection after {timeout:?}"),
                    })
                }
            };
            stream
                .set_nodelay(true)
                .map_err(|e| StoreError::io(&address, e))?;

            let mut connection = Self {
                address: address.clone(),
                state: ConnectionState::Connected,
                stream,
                write_buf: BytesMut::new(),
                write_cursor: 0,
                read_buf: BytesMut::with_capacity(READ_CHUNK),
                in_flight: 0,
            };
            if let Some(password) = &server.password {
                connection.authenticate(password, timeout).await?;
            }
            debug!("connected");
            Ok::<Self, StoreError>(connection)
        }
        .instrument(span)
        .await;

        if result.is_err() {
            counter!(CONNECT_FAILURES).increment(1);
        }
        result
    }

    async fn authenticate(&mut self, password: &str, timeout: Duration) -> Result<(), StoreError> {
        self.enqueue(&Command::auth(password));
        let outcome = tokio::time::timeout(timeout, self.drive())
            .await
            .map_err(|_| StoreError::Timeout { pending: 1 })?;
        match (outcome.replies.into_iter().next(), outcome.error) {
            (Some(Reply::Status(_)), _) => Ok(()),
            (Some(Reply::Error(message)), _) => Err(StoreError::Server {
                server: self.address.clone(),
                message,
            }),
            (_, Some(error)) => Err(error),
            (Some(reply), None) => Err(StoreError::Protocol(format!(
                "unexpected reply to AUTH: {reply:?}"
            ))),
            (None, None) => Err(StoreError::Disconnected {
                server: self.address.clone(),
            }),
        }
    }

    pub(crate) fn address(&self) -> &str {
        &self.address
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Queues `command` for sending.  Nothing is written until [`drive`] runs.
    ///
    /// [`drive`]: Connection::drive
    pub(crate) fn enqueue(&mut self, command: &Command) {
        command.encode(&mut self.write_buf);
        self.in_flight += 1;
        counter!(COMMANDS_SENT).increment(1);
    }

    /// Stops using the connection.  Buffered output and pending replies are
    /// discarded.
    pub(crate) fn mark_disconnecting(&mut self) {
        if self.state == ConnectionState::Connected {
            warn!(address = self.address.as_str(), "replica connection lost");
        }
        self.state = ConnectionState::Disconnecting;
        self.write_buf.clear();
        self.write_cursor = 0;
        self.read_buf.clear();
        self.in_flight = 0;
    }

    fn fail(&mut self, mut outcome: DriveOutcome, error: StoreError) -> DriveOutcome {
        debug!(
            address = self.address.as_str(),
            "replica connection failed: {error}"
        );
        self.mark_disconnecting();
        outcome.error = Some(error);
        outcome
    }

    /// Runs readiness-driven I/O until every in-flight command has a reply or
    /// the connection fails.
    pub(crate) async fn drive(&mut self) -> DriveOutcome {
        let mut outcome = DriveOutcome {
            replies: Vec::with_capacity(self.in_flight),
            error: None,
        };
        if !self.is_connected() {
            let error = StoreError::Disconnected {
                server: self.address.clone(),
            };
            return self.fail(outcome, error);
        }

        while outcome.replies.len() < self.in_flight {
            let pending_output = self.write_cursor < self.write_buf.len();
            let interest = if pending_output {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };

            let ready = match self.stream.ready(interest).await {
                Ok(ready) => ready,
                Err(error) => {
                    let error = StoreError::io(&self.address, error);
                    return self.fail(outcome, error);
                }
            };

            if ready.is_writable() && pending_output {
                match self.stream.try_write(&self.write_buf[self.write_cursor..]) {
                    Ok(n) => {
                        self.write_cursor += n;
                        if self.write_cursor == self.write_buf.len() {
                            self.write_buf.clear();
                            self.write_cursor = 0;
                        }
                    }
                    Err(error) if error.kind() == ErrorKind::WouldBlock => {}
                    Err(error) => {
                        let error = StoreError::io(&self.address, error);
                        return self.fail(outcome, error);
                    }
                }
            }

            if ready.is_readable() {
                self.read_buf.reserve(READ_CHUNK);
                match self.stream.try_read_buf(&mut self.read_buf) {
                    Ok(0) => {
                        let error = StoreError::Disconnected {
                            server: self.address.clone(),
                        };
                        return self.fail(outcome, error);
                    }
                    Ok(_) => loop {
                        match decode(&mut self.read_buf) {
                            Ok(Some(reply)) => outcome.replies.push(reply),
                            Ok(None) => break,
                            Err(error) => return self.fail(outcome, error),
                        }
                    },
                    Err(error) if error.kind() == ErrorKind::WouldBlock => {}
                    Err(error) => {
                        let error = StoreError::io(&self.address, error);
                        return self.fail(outcome, error);
                    }
                }
            }
        }

        self.in_flight -= outcome.replies.len().min(self.in_flight);
        outcome
    }
}
