//! TLS wrapping for accepted connections (`tls` feature)
//!
//! Each accepted `TcpStream` is adopted by esp-tls and negotiated in server
//! mode. The resulting stream is exposed through `std::io` so the command
//! handler does not care which transport it talks to.

use std::io;
use std::net::TcpStream;

use anyhow::{anyhow, Result};
use embedded_svc::io::{Read as _, Write as _};
use esp_idf_svc::tls::{EspTls, ServerConfig, X509};

use crate::config::TlsConfig;

/// Certificate and key, NUL-terminated as esp-tls expects
pub struct TlsAcceptor {
    cert: Vec<u8>,
    key: Vec<u8>,
}

fn nul_terminated(pem: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(pem.len() + 1);
    bytes.extend_from_slice(pem.as_bytes());
    bytes.push(0);
    bytes
}

impl TlsAcceptor {
    pub fn from_config(config: &TlsConfig) -> Result<Self> {
        let cert = config
            .cert_pem
            .as_deref()
            .ok_or_else(|| anyhow!("TLS certificate missing"))?;
        let key = config
            .key_pem
            .as_deref()
            .ok_or_else(|| anyhow!("TLS key missing"))?;
        Ok(Self {
            cert: nul_terminated(cert),
            key: nul_terminated(key),
        })
    }

    /// Run the server handshake on a freshly accepted connection
    pub fn accept(&self, stream: TcpStream) -> Result<TlsStream> {
        let mut tls = EspTls::adopt(stream)?;
        let config = ServerConfig {
            server_cert: Some(X509::pem_until_nul(&self.cert)),
            server_key: Some(X509::pem_until_nul(&self.key)),
            ..Default::default()
        };
        tls.negotiate_server(&config)?;
        Ok(TlsStream(tls))
    }
}

pub struct TlsStream(EspTls<TcpStream>);

impl io::Read for TlsStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf).map_err(|e| io::Error::other(format!("{e:?}")))
    }
}

impl io::Write for TlsStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf).map_err(|e| io::Error::other(format!("{e:?}")))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush().map_err(|e| io::Error::other(format!("{e:?}")))
    }
}
