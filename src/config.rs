//! Connection configuration: server URL, identity, timeouts and TLS.
use std::env;
use std::fmt;
use std::fs;
use std::path::{is_separator, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::states::Role;

pub const DEFAULT_PORT: u16 = 7419;
pub const DEFAULT_URL: &str = "tcp://localhost:7419";
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);
pub const MIN_WID_LEN: usize = 8;

/// A parsed `scheme://[:password@]host:port` server address.
///
/// `tcp` is plaintext and `tcp+tls` is TLS-wrapped. IPv6 literals go in
/// brackets. Everything up to the *last* `@` is credentials, so passwords may
/// contain `@`. A password starting with a path separator names a file whose
/// (trimmed) contents are the password.
#[derive(Clone, PartialEq, Eq)]
pub struct ServerUrl {
    pub tls: bool,
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
}

impl ServerUrl {
    pub fn parse(url: &str) -> Result<Self> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| Error::config(format!("{url:?} lacks a scheme")))?;
        let tls = match scheme {
            "tcp" => false,
            "tcp+tls" => true,
            _ => {
                return Err(Error::config(format!(
                    "unsupported scheme {scheme:?}, expected tcp or tcp+tls"
                )))
            },
        };

        let rest = rest.trim_end_matches('/');
        let (userinfo, hostport) = match rest.rsplit_once('@') {
            Some((u, h)) => (Some(u), h),
            None => (None, rest),
        };

        let password = match userinfo.map(|u| u.split_once(':')) {
            None => None,
            Some(Some((_, p))) if !p.is_empty() => Some(resolve_password(p)?),
            Some(Some(_)) => None,
            Some(None) => {
                return Err(Error::config(
                    "credentials must be given as :password@",
                ))
            },
        };

        let (host, port) = split_host_port(hostport)?;

        Ok(Self {
            tls,
            host,
            port,
            password,
        })
    }

    /// `host:port`, bracketing IPv6 literals, as accepted by `TcpStream`.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

fn resolve_password(p: &str) -> Result<String> {
    if !p.starts_with(is_separator) {
        return Ok(p.to_owned());
    }
    let contents = fs::read_to_string(p).map_err(|e| {
        Error::config(format!("reading password file {p}: {e}"))
    })?;
    Ok(contents.trim().to_owned())
}

fn split_host_port(hostport: &str) -> Result<(String, u16)> {
    let bad = || Error::config(format!("malformed host/port {hostport:?}"));

    let (host, port) = if let Some(v6) = hostport.strip_prefix('[') {
        let (host, after) = v6.split_once(']').ok_or_else(bad)?;
        match after {
            "" => (host, None),
            _ => (host, Some(after.strip_prefix(':').ok_or_else(bad)?)),
        }
    } else {
        match hostport.split_once(':') {
            // Unbracketed IPv6 is ambiguous with a port.
            Some((_, p)) if p.contains(':') => return Err(bad()),
            Some((h, p)) => (h, Some(p)),
            None => (hostport, None),
        }
    };

    if host.is_empty() {
        return Err(bad());
    }
    let port = match port {
        Some(p) => p.parse().map_err(|_| bad())?,
        None => DEFAULT_PORT,
    };

    Ok((host.to_owned(), port))
}

impl FromStr for ServerUrl {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

// Both impls keep the password out of logs.
impl fmt::Display for ServerUrl {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let scheme = if self.tls { "tcp+tls" } else { "tcp" };
        let creds = if self.password.is_some() { ":***@" } else { "" };
        write!(f, "{scheme}://{creds}{}", self.authority())
    }
}

impl fmt::Debug for ServerUrl {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ServerUrl({self})")
    }
}

/// Extra trust and identity for `tcp+tls` connections. The Mozilla root set
/// is always trusted.
#[derive(Clone, Debug, Default)]
pub struct TlsOptions {
    /// PEM bundle of additional CAs, e.g. a private one.
    pub ca_file: Option<PathBuf>,
    /// PEM certificate chain presented for mutual TLS.
    pub client_cert: Option<PathBuf>,
    /// PEM private key matching `client_cert`.
    pub client_key: Option<PathBuf>,
    /// Name to verify the server certificate against, if not the URL host.
    pub server_name: Option<String>,
}

/// Everything needed to open (and reopen) a connection.
#[derive(Clone, Debug)]
pub struct ClientOptions {
    pub url: ServerUrl,
    pub role: Role,
    /// Worker id; only sent by consumers. Generated when not given.
    pub wid: Option<String>,
    /// Shown against the worker in the server's UI.
    pub labels: Vec<String>,
    /// Bound on every socket read, and on connecting.
    pub read_timeout: Duration,
    pub tls: TlsOptions,
}

impl ClientOptions {
    pub fn new(url: ServerUrl, role: Role) -> Self {
        Self {
            url,
            role,
            wid: None,
            labels: vec!["rust".to_owned()],
            read_timeout: DEFAULT_READ_TIMEOUT,
            tls: TlsOptions::default(),
        }
    }

    /// Reads the URL from the variable named by `FAKTORY_PROVIDER` (itself
    /// defaulting to `FAKTORY_URL`), or falls back to the local default.
    pub fn from_env(role: Role) -> Result<Self> {
        let var = env::var("FAKTORY_PROVIDER")
            .unwrap_or_else(|_| "FAKTORY_URL".to_owned());
        let url = env::var(&var).unwrap_or_else(|_| DEFAULT_URL.to_owned());
        Ok(Self::new(ServerUrl::parse(&url)?, role))
    }

    pub fn with_wid(mut self, wid: impl Into<String>) -> Self {
        self.wid = Some(wid.into());
        self
    }

    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels = labels.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_tls(mut self, tls: TlsOptions) -> Self {
        self.tls = tls;
        self
    }

    /// Checks the options and fills in a worker id for consumers.
    pub(crate) fn resolve(mut self) -> Result<Self> {
        if self.read_timeout.is_zero() {
            return Err(Error::config("read timeout must be non-zero"));
        }
        if let Some(wid) = &self.wid {
            if wid.len() < MIN_WID_LEN {
                return Err(Error::config(format!(
                    "worker id {wid:?} is shorter than {MIN_WID_LEN} characters"
                )));
            }
        } else if self.role.is_worker() {
            self.wid = Some(crate::types::job::new_jid());
        }
        Ok(self)
    }
}
