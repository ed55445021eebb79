//! Duplex byte transport: TCP, Unix-domain socket, or TLS over TCP.
use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf},
    net::TcpStream,
};

use crate::{
    Result,
    connection::Config,
    postgres::frontend::SslRequest,
};

mod buffered;
pub mod tls;

pub use buffered::BufferedSocket;
pub use tls::{SslMode, TlsError};

/// The underlying duplex stream of one connection.
pub enum Socket {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl Socket {
    /// Open a socket to the configured endpoint, negotiating TLS when
    /// the ssl mode asks for it.
    ///
    /// Unix-domain transport skips SSL entirely.
    pub async fn connect(config: &Config) -> Result<Socket> {
        #[cfg(unix)]
        if let Some(path) = config.socket.as_deref() {
            let unix = tokio::net::UnixStream::connect(path).await?;
            tracing::debug!(path = %path.display(), "connected over unix socket");
            return Ok(Socket::Unix(unix));
        }

        let tcp = TcpStream::connect((config.host.as_str(), config.port)).await?;
        tcp.set_nodelay(true)?;

        if !config.ssl_mode.starts_ssl() {
            return Ok(Socket::Tcp(tcp));
        }

        match ssl_negotiate(tcp, config).await? {
            Ok(tls) => Ok(Socket::Tls(Box::new(tls))),
            Err(tcp) if config.ssl_mode.requires_ssl() => {
                drop(tcp);
                Err(TlsError::Refused.into())
            },
            Err(tcp) => {
                tracing::debug!("server declined TLS, continuing in cleartext");
                Ok(Socket::Tcp(tcp))
            },
        }
    }
}

/// Send an `SSLRequest` and, on `'S'`, run the TLS handshake.
///
/// Returns the plain stream back when the server answers `'N'`.
async fn ssl_negotiate(
    mut tcp: TcpStream,
    config: &Config,
) -> Result<Result<tokio_rustls::client::TlsStream<TcpStream>, TcpStream>> {
    let mut request = bytes::BytesMut::with_capacity(8);
    SslRequest.encode(&mut request);
    tcp.write_all(&request).await?;

    match tcp.read_u8().await? {
        b'S' => Ok(Ok(tls::handshake(tcp, config).await?)),
        b'N' => Ok(Err(tcp)),
        other => Err(crate::postgres::ProtocolError::new(format!(
            "unexpected SSLRequest reply {:?}",
            other as char,
        ))
        .into()),
    }
}

macro_rules! poll_delegate {
    ($self:ident.$fn:ident($($arg:ident),*)) => {
        match $self.get_mut() {
            Socket::Tcp(s) => Pin::new(s).$fn($($arg),*),
            #[cfg(unix)]
            Socket::Unix(s) => Pin::new(s).$fn($($arg),*),
            Socket::Tls(s) => Pin::new(s.as_mut()).$fn($($arg),*),
        }
    };
}

impl AsyncRead for Socket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        poll_delegate!(self.poll_read(cx, buf))
    }
}

impl AsyncWrite for Socket {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        poll_delegate!(self.poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        poll_delegate!(self.poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        poll_delegate!(self.poll_shutdown(cx))
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Socket::Tcp(_) => f.write_str("Socket::Tcp"),
            #[cfg(unix)]
            Socket::Unix(_) => f.write_str("Socket::Unix"),
            Socket::Tls(_) => f.write_str("Socket::Tls"),
        }
    }
}
