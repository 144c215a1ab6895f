use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{debug, warn};

use dagstep_core::error::{DagstepError, Result};
use dagstep_core::traits::{OutputSink, SshSession, SshTransport, Tunnel};
use dagstep_core::types::{SshError, SshHost};

/// Map a transport error onto the shared taxonomy.
pub fn classify(host: &SshHost, err: SshError) -> DagstepError {
    let operation = format!("ssh {}@{}", host.user, host.host_port());
    match err {
        SshError::AuthFailed { .. } => DagstepError::InvalidCredentials {
            operation,
            message: err.to_string(),
        },
        SshError::HostKeyMismatch(target) => DagstepError::PermissionDenied {
            operation,
            target: format!("host key of {target}"),
        },
        SshError::Unreachable(e) => DagstepError::network(operation, e),
        SshError::Channel(message) => DagstepError::failed(operation, message),
    }
}

/// Dials one hop with a handshake deadline.
pub struct Dialer<'a> {
    pub transport: &'a dyn SshTransport,
    pub timeout: Duration,
}

impl Dialer<'_> {
    pub async fn connect(&self, host: &SshHost) -> Result<Box<dyn SshSession>> {
        debug!(host = %host.host_port(), user = %host.user, "Connecting");
        self.deadline(host, self.transport.connect(host)).await
    }

    pub async fn connect_over(
        &self,
        tunnel: Box<dyn Tunnel>,
        host: &SshHost,
    ) -> Result<Box<dyn SshSession>> {
        debug!(host = %host.host_port(), user = %host.user, "Connecting through tunnel");
        self.deadline(host, self.transport.connect_over(tunnel, host)).await
    }

    /// Reach `target` through an authenticated `jump` session. `jump` is
    /// closed if any later hop fails.
    pub async fn hop(
        &self,
        mut jump: Box<dyn SshSession>,
        jump_host: &SshHost,
        target: &SshHost,
    ) -> Result<Box<dyn SshSession>> {
        let tunnel = match jump.open_tunnel(&target.host, target.port).await {
            Ok(tunnel) => tunnel,
            Err(e) => {
                close_quietly(jump, jump_host).await;
                return Err(classify(jump_host, e));
            }
        };
        match self.connect_over(tunnel, target).await {
            Ok(session) => Ok(Box::new(ChainedSession {
                target: session,
                bastion: Some(jump),
            })),
            Err(e) => {
                close_quietly(jump, jump_host).await;
                Err(e)
            }
        }
    }

    async fn deadline(
        &self,
        host: &SshHost,
        fut: BoxFuture<'_, std::result::Result<Box<dyn SshSession>, SshError>>,
    ) -> Result<Box<dyn SshSession>> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(res) => res.map_err(|e| classify(host, e)),
            Err(_) => Err(DagstepError::Timeout {
                operation: format!("ssh connect {}", host.host_port()),
                timeout_secs: self.timeout.as_secs(),
            }),
        }
    }
}

pub async fn close_quietly(mut session: Box<dyn SshSession>, host: &SshHost) {
    if let Err(e) = session.close().await {
        warn!(host = %host.host_port(), error = %e, "Failed to close ssh session");
    }
}

/// Target session reached through a bastion. Closing it closes both.
pub struct ChainedSession {
    target: Box<dyn SshSession>,
    bastion: Option<Box<dyn SshSession>>,
}

impl SshSession for ChainedSession {
    fn open_tunnel<'a>(
        &'a mut self,
        host: &'a str,
        port: u16,
    ) -> BoxFuture<'a, std::result::Result<Box<dyn Tunnel>, SshError>> {
        self.target.open_tunnel(host, port)
    }

    fn exec<'a>(
        &'a mut self,
        command: &'a str,
        stdout: &'a mut OutputSink,
        stderr: &'a mut OutputSink,
    ) -> BoxFuture<'a, std::result::Result<i32, SshError>> {
        self.target.exec(command, stdout, stderr)
    }

    fn close(&mut self) -> BoxFuture<'_, std::result::Result<(), SshError>> {
        Box::pin(async move {
            let target = self.target.close().await;
            let bastion = match self.bastion.take() {
                Some(mut bastion) => bastion.close().await,
                None => Ok(()),
            };
            target.and(bastion)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagstep_core::ErrorKind;
    use dagstep_test_utils::MockSshTransport;

    fn host(name: &str, port: u16) -> SshHost {
        SshHost {
            host: name.into(),
            port,
            user: "deploy".into(),
            ..SshHost::default()
        }
    }

    #[tokio::test]
    async fn test_chained_close_closes_bastion() {
        let transport = MockSshTransport::new();
        let dialer = Dialer {
            transport: &transport,
            timeout: Duration::from_secs(5),
        };
        let jump = host("jump", 2222);
        let target = host("db", 22);

        let first = dialer.connect(&jump).await.unwrap();
        let mut session = dialer.hop(first, &jump, &target).await.unwrap();
        session.close().await.unwrap();
        session.close().await.unwrap();

        assert_eq!(
            transport.events(),
            vec![
                "connect deploy@jump:2222",
                "tunnel db:22",
                "connect_over deploy@db:22",
                "close db:22",
                "close jump:2222",
                "close db:22",
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_hop_closes_bastion() {
        let transport = MockSshTransport::new().rejecting("db");
        let dialer = Dialer {
            transport: &transport,
            timeout: Duration::from_secs(5),
        };
        let jump = host("jump", 22);
        let first = dialer.connect(&jump).await.unwrap();
        let err = dialer.hop(first, &jump, &host("db", 22)).await.err().unwrap();

        assert_eq!(err.kind(), ErrorKind::InvalidCredentials);
        assert_eq!(transport.events().last().unwrap(), "close jump:22");
    }

    #[test]
    fn test_classify() {
        let h = host("h", 22);
        assert_eq!(
            classify(&h, SshError::HostKeyMismatch("h:22".into())).kind(),
            ErrorKind::PermissionDenied
        );
        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert_eq!(classify(&h, SshError::Unreachable(refused)).kind(), ErrorKind::Network);
        assert_eq!(
            classify(&h, SshError::Channel("eof".into())).kind(),
            ErrorKind::OperationFailed
        );
    }
}
