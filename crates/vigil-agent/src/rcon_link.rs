use std::time::Duration;

use futures_util::future::BoxFuture;
use vigil_rcon::{ConnectError, ExecError, RconSession};

#[derive(Debug, Clone)]
pub struct RconEndpoint {
    pub host: String,
    pub port: u16,
    pub password: String,
}

/// A live control channel. Object-safe so the lifecycle can hold whatever
/// the connector produced.
pub trait RconControl: Send {
    fn execute(
        &mut self,
        command: String,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<String, ExecError>>;

    /// Idempotent; resolves to whether a live connection was torn down.
    fn disconnect(&mut self) -> BoxFuture<'_, bool>;
}

/// Builds control channels on demand. The lifecycle owns one of these
/// instead of constructing sockets itself, which keeps session replacement
/// explicit: disconnect the old channel, then connect a new one, never both.
pub trait RconConnector: Send + Sync {
    fn connect(
        &self,
        endpoint: RconEndpoint,
        timeout: Duration,
    ) -> BoxFuture<'static, Result<Box<dyn RconControl>, ConnectError>>;
}

#[derive(Debug, Default, Clone)]
pub struct TcpRconConnector;

impl RconConnector for TcpRconConnector {
    fn connect(
        &self,
        endpoint: RconEndpoint,
        timeout: Duration,
    ) -> BoxFuture<'static, Result<Box<dyn RconControl>, ConnectError>> {
        Box::pin(async move {
            let session =
                RconSession::connect(&endpoint.host, endpoint.port, &endpoint.password, timeout)
                    .await?;
            Ok(Box::new(session) as Box<dyn RconControl>)
        })
    }
}

impl RconControl for RconSession {
    fn execute(
        &mut self,
        command: String,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<String, ExecError>> {
        Box::pin(async move { RconSession::execute(self, &command, timeout).await })
    }

    fn disconnect(&mut self) -> BoxFuture<'_, bool> {
        Box::pin(RconSession::disconnect(self))
    }
}
