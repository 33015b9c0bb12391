//! Wraps a TCP stream in TLS for `tcp+tls://` servers.
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::{
    CertificateDer, PrivateKeyDer, ServerName,
};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::config::TlsOptions;
use crate::error::{Error, Result};

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| {
        Error::config(format!("opening {}: {e}", path.display()))
    })?;
    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| Error::config(format!("reading {}: {e}", path.display())))
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|e| {
        Error::config(format!("opening {}: {e}", path.display()))
    })?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| Error::config(format!("reading {}: {e}", path.display())))?
        .ok_or_else(|| {
            Error::config(format!("no private key found in {}", path.display()))
        })
}

/// Builds the client-side TLS configuration.
pub(crate) fn client_config(options: &TlsOptions) -> Result<ClientConfig> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(ca_file) = &options.ca_file {
        for cert in load_certs(ca_file)? {
            roots.add(cert).map_err(|e| {
                Error::config(format!("bad CA in {}: {e}", ca_file.display()))
            })?;
        }
    }

    let builder = ClientConfig::builder().with_root_certificates(roots);

    match (&options.client_cert, &options.client_key) {
        (Some(cert), Some(key)) => builder
            .with_client_auth_cert(load_certs(cert)?, load_key(key)?)
            .map_err(|e| Error::config(format!("client identity: {e}"))),
        (None, None) => Ok(builder.with_no_client_auth()),
        _ => Err(Error::config(
            "client_cert and client_key must be given together",
        )),
    }
}

/// Runs the TLS handshake over an established TCP connection.
pub(crate) async fn wrap(
    tcp: TcpStream,
    host: &str,
    options: &TlsOptions,
) -> Result<TlsStream<TcpStream>> {
    let name = options.server_name.as_deref().unwrap_or(host).to_owned();
    let server_name = ServerName::try_from(name.clone()).map_err(|e| {
        Error::config(format!("{name:?} is not a valid TLS server name: {e}"))
    })?;

    let connector = TlsConnector::from(Arc::new(client_config(options)?));
    let stream = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| {
            Error::Connection(format!("TLS handshake with {name}: {e}"))
        })?;
    debug!(server_name = %name, "TLS established");

    Ok(stream)
}
