//! Socket creation with [`SocketTunables`].
//!
//! # Responsibilities
//! - Resolve and bind listening sockets, classifying bind failures
//! - Apply per-connection options to accepted and outbound streams
//! - Open outbound connections under the configured connect timeout

use std::io;
use std::net::SocketAddr;

use socket2::SockRef;
use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream};

use crate::config::SocketTunables;
use crate::error::{BindError, TransportError};

/// Resolve `host:port` to the first socket address.
pub async fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    lookup_host((host, port)).await?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("{} did not resolve to any address", host),
        )
    })
}

fn new_socket(addr: &SocketAddr) -> io::Result<TcpSocket> {
    if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
}

fn apply_buffers(socket: &TcpSocket, tunables: &SocketTunables) -> io::Result<()> {
    if tunables.send_buffer_bytes > 0 {
        socket.set_send_buffer_size(tunables.send_buffer_bytes)?;
    }
    if tunables.recv_buffer_bytes > 0 {
        socket.set_recv_buffer_size(tunables.recv_buffer_bytes)?;
    }
    Ok(())
}

/// Bind and listen on `host:port`.
pub async fn bind_listener(
    host: &str,
    port: u16,
    tunables: &SocketTunables,
) -> Result<TcpListener, BindError> {
    let addr = resolve(host, port).await.map_err(|e| BindError::InvalidAddress {
        host: host.to_string(),
        port,
        reason: e.to_string(),
    })?;

    let socket = new_socket(&addr).map_err(|e| BindError::Io(e.to_string()))?;
    let options = || -> io::Result<()> {
        #[cfg(unix)]
        socket.set_reuseaddr(true)?;
        socket.set_keepalive(tunables.keep_alive)?;
        apply_buffers(&socket, tunables)
    };
    options().map_err(|e| BindError::Io(e.to_string()))?;

    socket.bind(addr).map_err(|e| BindError::from_io(addr, &e))?;

    tracing::debug!(
        address = %addr,
        backlog = tunables.backlog,
        tcp_no_delay = tunables.tcp_no_delay,
        keep_alive = tunables.keep_alive,
        send_buffer = tunables.send_buffer_bytes,
        recv_buffer = tunables.recv_buffer_bytes,
        "Listening socket configured"
    );

    socket
        .listen(tunables.backlog)
        .map_err(|e| BindError::from_io(addr, &e))
}

/// Apply per-connection options to an accepted or freshly connected stream.
pub fn configure_stream(stream: &TcpStream, tunables: &SocketTunables) -> io::Result<()> {
    stream.set_nodelay(tunables.tcp_no_delay)?;

    let sock = SockRef::from(stream);
    sock.set_keepalive(tunables.keep_alive)?;
    if tunables.send_buffer_bytes > 0 {
        sock.set_send_buffer_size(tunables.send_buffer_bytes as usize)?;
    }
    if tunables.recv_buffer_bytes > 0 {
        sock.set_recv_buffer_size(tunables.recv_buffer_bytes as usize)?;
    }
    Ok(())
}

/// Open an outbound TCP connection honoring the connect timeout.
pub async fn connect(
    host: &str,
    port: u16,
    tunables: &SocketTunables,
) -> Result<TcpStream, TransportError> {
    let endpoint = format!("{}:{}", host, port);
    let wrap = |source: io::Error| TransportError::Connect {
        endpoint: endpoint.clone(),
        source,
    };

    let attempt = async {
        let addr = resolve(host, port).await?;
        let socket = new_socket(&addr)?;
        socket.set_keepalive(tunables.keep_alive)?;
        apply_buffers(&socket, tunables)?;
        socket.connect(addr).await
    };

    let stream = match tokio::time::timeout(tunables.connect_timeout(), attempt).await {
        Ok(result) => result.map_err(wrap)?,
        Err(_) => {
            return Err(wrap(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect timed out after {:?}", tunables.connect_timeout()),
            )))
        }
    };

    stream.set_nodelay(tunables.tcp_no_delay).map_err(wrap)?;
    tracing::trace!(endpoint = %endpoint, "Outbound connection established");
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn binds_ephemeral_port_and_reports_in_use() {
        let tunables = SocketTunables::default();
        let first = bind_listener("127.0.0.1", 0, &tunables).await.unwrap();
        let port = first.local_addr().unwrap().port();

        let second = bind_listener("127.0.0.1", port, &tunables).await;
        assert!(matches!(second, Err(BindError::AddressInUse { .. })));
    }

    #[tokio::test]
    async fn unresolvable_host_is_invalid_address() {
        let result = bind_listener("no-such-host.invalid", 8080, &SocketTunables::default()).await;
        assert!(matches!(result, Err(BindError::InvalidAddress { port: 8080, .. })));
    }

    #[tokio::test]
    async fn connect_applies_options() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let tunables = SocketTunables {
            tcp_no_delay: true,
            ..SocketTunables::default()
        };

        let stream = connect("127.0.0.1", addr.port(), &tunables).await.unwrap();
        assert!(stream.nodelay().unwrap());

        let (accepted, _) = listener.accept().await.unwrap();
        configure_stream(&accepted, &tunables).unwrap();
        assert!(accepted.nodelay().unwrap());
    }

    #[tokio::test]
    async fn connect_refused_is_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = connect("127.0.0.1", port, &SocketTunables::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
    }
}
