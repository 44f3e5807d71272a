use rustls::{ClientConfig, pki_types::ServerName};
use std::{io, sync::Arc};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpStream, ToSocketAddrs},
};
use tokio_rustls::{TlsConnector as RustlsConnector, client::TlsStream};

/// Opens a fresh byte stream to the server on every (re)connect.
pub trait Connector: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    fn connect(&self) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

/// Plain TCP, for tests and trusted networks.
#[derive(Clone, Debug)]
pub struct TcpConnector<A> {
    addr: A,
}

impl<A> TcpConnector<A> {
    pub const fn new(addr: A) -> Self {
        Self { addr }
    }
}

impl<A> Connector for TcpConnector<A>
where
    A: ToSocketAddrs + Clone + Send + Sync + 'static,
{
    type Stream = TcpStream;

    async fn connect(&self) -> io::Result<TcpStream> {
        let stream = TcpStream::connect(self.addr.clone()).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// TLS over TCP, presenting the client certificate held by `config`.
#[derive(Clone)]
pub struct TlsConnector<A> {
    addr: A,
    server_name: ServerName<'static>,
    inner: RustlsConnector,
}

impl<A> TlsConnector<A> {
    pub fn new(addr: A, server_name: ServerName<'static>, config: Arc<ClientConfig>) -> Self {
        Self {
            addr,
            server_name,
            inner: RustlsConnector::from(config),
        }
    }
}

impl<A> Connector for TlsConnector<A>
where
    A: ToSocketAddrs + Clone + Send + Sync + 'static,
{
    type Stream = TlsStream<TcpStream>;

    async fn connect(&self) -> io::Result<Self::Stream> {
        let tcp = TcpStream::connect(self.addr.clone()).await?;
        tcp.set_nodelay(true)?;
        self.inner.connect(self.server_name.clone(), tcp).await
    }
}
