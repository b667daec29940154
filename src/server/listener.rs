use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Mutex;

use tokio::net::TcpListener;

use crate::error::Result;

/// A bound server socket. The tokio half goes to the server; a duplicate
/// handle stays here so the port can be re-checked while serving and the
/// socket released at teardown.
#[derive(Debug)]
pub struct BoundListener {
    addr: SocketAddr,
    socket: Mutex<Option<StdTcpListener>>,
}

impl BoundListener {
    pub fn bind(addr: SocketAddr) -> Result<(Self, TcpListener)> {
        let socket = StdTcpListener::bind(addr)?;
        socket.set_nonblocking(true)?;
        let kept = socket.try_clone()?;
        let addr = kept.local_addr()?;
        let listener = TcpListener::from_std(socket)?;
        Ok((
            Self {
                addr,
                socket: Mutex::new(Some(kept)),
            },
            listener,
        ))
    }

    /// Address recorded at bind time.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Port the socket is bound to right now, `None` once closed.
    pub fn current_port(&self) -> Option<u16> {
        self.socket
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .and_then(|s| s.local_addr().ok())
            .map(|a| a.port())
    }

    pub fn close(&self) {
        let socket = self
            .socket
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if socket.is_some() {
            tracing::debug!(addr = %self.addr, "Released listener socket");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_ephemeral_port() {
        let (bound, listener) = BoundListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let port = bound.local_addr().port();
        assert_ne!(port, 0);
        assert_eq!(listener.local_addr().unwrap().port(), port);
        assert_eq!(bound.current_port(), Some(port));

        bound.close();
        assert_eq!(bound.current_port(), None);
    }
}
