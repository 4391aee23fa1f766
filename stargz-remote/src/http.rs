//! Hyper connector speaking plain TCP or openssl TLS.
//!
//! Registries terminate TLS almost everywhere, but hosts matched by the
//! insecure list may downgrade to http and skip certificate verification.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use anyhow::{format_err, Error};
use futures::future::FutureExt;
use hyper::client::connect::{Connected, Connection, HttpConnector};
use hyper::service::Service;
use hyper::{Body, Client, Uri};
use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_openssl::SslStream;

pub enum MaybeTlsStream<S> {
    Normal(S),
    Secured(SslStream<S>),
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for MaybeTlsStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Normal(s) => Pin::new(s).poll_read(cx, buf),
            MaybeTlsStream::Secured(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for MaybeTlsStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            MaybeTlsStream::Normal(s) => Pin::new(s).poll_write(cx, buf),
            MaybeTlsStream::Secured(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Normal(s) => Pin::new(s).poll_flush(cx),
            MaybeTlsStream::Secured(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Normal(s) => Pin::new(s).poll_shutdown(cx),
            MaybeTlsStream::Secured(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

impl Connection for MaybeTlsStream<TcpStream> {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

#[derive(Clone)]
pub struct HttpsConnector {
    connector: HttpConnector,
    ssl_connector: Arc<SslConnector>,
}

impl HttpsConnector {
    pub fn new(insecure_tls: bool) -> Result<Self, Error> {
        let mut builder = SslConnector::builder(SslMethod::tls())?;
        if insecure_tls {
            builder.set_verify(SslVerifyMode::NONE);
        }
        let mut connector = HttpConnector::new();
        connector.enforce_http(false);
        Ok(Self {
            connector,
            ssl_connector: Arc::new(builder.build()),
        })
    }

    async fn secure_stream(
        tcp_stream: TcpStream,
        ssl_connector: &SslConnector,
        host: &str,
    ) -> Result<MaybeTlsStream<TcpStream>, Error> {
        let config = ssl_connector.configure()?;
        let mut conn: SslStream<TcpStream> = SslStream::new(config.into_ssl(host)?, tcp_stream)?;
        Pin::new(&mut conn).connect().await?;
        Ok(MaybeTlsStream::Secured(conn))
    }
}

impl Service<Uri> for HttpsConnector {
    type Response = MaybeTlsStream<TcpStream>;
    type Error = Error;
    #[allow(clippy::type_complexity)]
    type Future =
        Pin<Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, ctx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.connector.poll_ready(ctx).map_err(|err| err.into())
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let mut connector = self.connector.clone();
        let ssl_connector = Arc::clone(&self.ssl_connector);
        let is_https = dst.scheme() == Some(&http::uri::Scheme::HTTPS);
        let host = match dst.host() {
            Some(host) => host.to_owned(),
            None => {
                return futures::future::err(format_err!("missing host in URL")).boxed();
            }
        };

        async move {
            let dst_str = dst.to_string();
            let tcp_stream = connector
                .call(dst)
                .await
                .map_err(|err| format_err!("error connecting to {} - {}", dst_str, err))?;

            if is_https {
                Self::secure_stream(tcp_stream, &ssl_connector, &host).await
            } else {
                Ok(MaybeTlsStream::Normal(tcp_stream))
            }
        }
        .boxed()
    }
}

/// A ready hyper client over the connector above.
pub fn build_client(insecure_tls: bool) -> Result<Client<HttpsConnector, Body>, Error> {
    Ok(Client::builder().build(HttpsConnector::new(insecure_tls)?))
}
