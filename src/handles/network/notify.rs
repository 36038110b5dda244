use std::io::Write;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Fire-and-forget text message to a listener on the backup host.
#[derive(Debug, Clone)]
pub struct Notifier {
    timeout: Duration,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

impl Notifier {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Returns whether the message was delivered. Nothing here is fatal.
    pub fn send(&self, host: Option<&str>, port: Option<u16>, message: &str) -> bool {
        let (Some(host), Some(port)) = (host.filter(|h| !h.is_empty()), port) else {
            log::debug!("Notification skipped, no host or port configured");
            return false;
        };
        if message.is_empty() {
            log::debug!("Notification skipped, empty message");
            return false;
        }

        match self.deliver(host, port, message) {
            Ok(addr) => {
                log::info!("Notification sent to {} bytes={}", addr, message.len() + 1);
                true
            }
            Err(e) => {
                log::warn!("Notification to {}:{} failed: {}", host, port, e);
                false
            }
        }
    }

    fn deliver(&self, host: &str, port: u16, message: &str) -> std::io::Result<SocketAddr> {
        let addr = (host, port).to_socket_addrs()?.next().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, format!("no address for {}", host))
        })?;
        let mut stream = TcpStream::connect_timeout(&addr, self.timeout)?;
        stream.set_write_timeout(Some(self.timeout))?;
        stream.write_all(message.as_bytes())?;
        stream.write_all(b"\n")?;
        stream.flush()?;
        Ok(addr)
    }
}
