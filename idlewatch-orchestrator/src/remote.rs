use anyhow::{Context, Result};
use async_trait::async_trait;
use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// An authenticated command session on one worker.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Run `command` and return its stdout. A non-zero exit status is not an
    /// error; callers judge the output.
    async fn exec(&self, command: &str) -> Result<String>;

    /// Start `command` without waiting for it to finish or reading its output.
    async fn fire(&self, command: &str) -> Result<()>;
}

#[async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn connect(
        &self,
        host: &str,
        username: &str,
        password: &str,
    ) -> Result<Box<dyn RemoteSession>>;
}

/// Password-authenticated SSH via libssh2. Host keys are not verified: the
/// fleet is recycled constantly and has no stable known_hosts.
pub struct SshConnector {
    port: u16,
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl SshConnector {
    pub fn new(connect_timeout: Duration, command_timeout: Duration) -> Self {
        Self {
            port: 22,
            connect_timeout,
            command_timeout,
        }
    }
}

#[async_trait]
impl RemoteConnector for SshConnector {
    async fn connect(
        &self,
        host: &str,
        username: &str,
        password: &str,
    ) -> Result<Box<dyn RemoteSession>> {
        let clean_host = strip_cidr(host).to_string();
        let port = self.port;
        let connect_timeout = self.connect_timeout;
        let timeout_ms = self.command_timeout.as_millis().min(u32::MAX as u128) as u32;
        let username = username.to_string();
        let password = password.to_string();

        let session = tokio::task::spawn_blocking(move || -> Result<ssh2::Session> {
            let addr = (clean_host.as_str(), port)
                .to_socket_addrs()
                .with_context(|| format!("resolve {}", clean_host))?
                .next()
                .ok_or_else(|| anyhow::anyhow!("no address for {}", clean_host))?;
            let tcp = TcpStream::connect_timeout(&addr, connect_timeout)
                .with_context(|| format!("connect {}", addr))?;

            let mut session = ssh2::Session::new()?;
            session.set_timeout(timeout_ms);
            session.set_tcp_stream(tcp);
            session.handshake()?;
            session.userauth_password(&username, &password)?;
            if !session.authenticated() {
                anyhow::bail!("authentication rejected for {}", username);
            }
            Ok(session)
        })
        .await
        .context("ssh connect task")??;

        Ok(Box::new(SshSession {
            session: Arc::new(Mutex::new(session)),
        }))
    }
}

// "10.1.2.3/32" -> "10.1.2.3"
fn strip_cidr(host: &str) -> &str {
    host.split('/').next().unwrap_or(host).trim()
}

struct SshSession {
    session: Arc<Mutex<ssh2::Session>>,
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn exec(&self, command: &str) -> Result<String> {
        let session = self.session.clone();
        let command = command.to_string();
        tokio::task::spawn_blocking(move || -> Result<String> {
            let session = session
                .lock()
                .map_err(|_| anyhow::anyhow!("ssh session lock poisoned"))?;
            let mut channel = session.channel_session()?;
            channel.exec(&command)?;
            let mut stdout = Vec::new();
            channel.read_to_end(&mut stdout)?;
            channel.wait_close()?;
            Ok(String::from_utf8_lossy(&stdout).into_owned())
        })
        .await
        .context("ssh exec task")?
    }

    async fn fire(&self, command: &str) -> Result<()> {
        let session = self.session.clone();
        let command = command.to_string();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let session = session
                .lock()
                .map_err(|_| anyhow::anyhow!("ssh session lock poisoned"))?;
            let mut channel = session.channel_session()?;
            channel.exec(&command)?;
            let _ = channel.send_eof();
            Ok(())
        })
        .await
        .context("ssh fire task")?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cidr_suffix_is_dropped() {
        assert_eq!(strip_cidr("10.1.2.3/32"), "10.1.2.3");
        assert_eq!(strip_cidr("10.1.2.3"), "10.1.2.3");
        assert_eq!(strip_cidr(" 10.1.2.3 "), "10.1.2.3");
    }

    #[tokio::test]
    async fn refused_tcp_connect_is_an_error() {
        let connector = SshConnector {
            port: 1,
            connect_timeout: Duration::from_millis(500),
            command_timeout: Duration::from_secs(1),
        };
        assert!(connector.connect("127.0.0.1/32", "root", "secret").await.is_err());
    }
}
