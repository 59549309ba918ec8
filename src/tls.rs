//! Staging of PEM credentials as paths consumable by the protocol engine.
//!
//! Credentials arrive as in-memory PEM blobs but the engine, like the C
//! library whose surface it mirrors, consumes certificate material by path.
//! Each staged blob is written to an anonymous temporary file (unlinked
//! before anything can observe it) and exposed through the process's own
//! descriptor table as `/proc/self/fd/<fd>`. Closing the file releases the
//! contents; nothing ever lands in a user-visible directory.

use openssl::nid::Nid;
use openssl::x509::X509;
use std::fmt;
use std::fs::File;
use std::io::Write;
use std::os::fd::AsRawFd;
use thiserror::Error;

use crate::configuration::SslOptions;

/// Errors raised while staging credentials.
#[derive(Debug, Error)]
pub enum Error {
    /// The anonymous backing file could not be created or written.
    #[error("unable to create temp file: {0}")]
    Create(#[source] std::io::Error),
    /// The client certificate could not be parsed.
    #[error("unable to parse client certificate: {0}")]
    Certificate(#[source] openssl::error::ErrorStack),
    /// The client certificate carries no common name to derive a user from.
    #[error("client certificate has no common name")]
    MissingCommonName,
}

/// One staged PEM blob, reachable at a stable path until cleared or dropped.
pub struct StagedFile {
    file: File,
    path: String,
}

impl StagedFile {
    /// Write `pem` to an anonymous file and expose its path.
    pub fn create(pem: &[u8]) -> Result<Self, Error> {
        let mut file = tempfile::tempfile().map_err(Error::Create)?;
        file.write_all(pem).map_err(Error::Create)?;
        file.flush().map_err(Error::Create)?;

        let path = format!("/proc/self/fd/{}", file.as_raw_fd());

        Ok(Self { file, path })
    }

    /// The path at which the staged contents are readable.
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl fmt::Debug for StagedFile {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("StagedFile")
            .field("fd", &self.file.as_raw_fd())
            .field("path", &self.path)
            .finish()
    }
}

/// Paths of the staged credential set, handed to the protocol engine.
#[derive(Debug, Clone)]
pub struct MaterialPaths {
    /// Client certificate path.
    pub certificate: String,
    /// Client private key path.
    pub private_key: String,
    /// Trusted-CA bundle path, when one was supplied.
    pub ca_bundle: Option<String>,
}

/// The three credential slots of one connection. Slots survive reconnect
/// cycles and are released on [`TlsMaterial::clear`] or drop.
#[derive(Debug, Default)]
pub struct TlsMaterial {
    certificate: Option<StagedFile>,
    private_key: Option<StagedFile>,
    ca_bundle: Option<StagedFile>,
}

impl TlsMaterial {
    /// Stage the certificate, private key, and first trusted CA (if any)
    /// from `options`, replacing any previously staged set.
    pub fn stage(&mut self, options: &SslOptions) -> Result<(), Error> {
        self.clear();

        self.certificate = Some(StagedFile::create(options.certificate_pem_data.as_bytes())?);
        self.private_key = Some(StagedFile::create(options.private_key_pem_data.as_bytes())?);

        if let Some(ca) = options.trusted_certificates_pem_data.first() {
            self.ca_bundle = Some(StagedFile::create(ca.as_bytes())?);
        }

        Ok(())
    }

    /// Paths of the staged set; `None` until a certificate and key have
    /// been staged.
    pub fn paths(&self) -> Option<MaterialPaths> {
        Some(MaterialPaths {
            certificate: self.certificate.as_ref()?.path().to_owned(),
            private_key: self.private_key.as_ref()?.path().to_owned(),
            ca_bundle: self.ca_bundle.as_ref().map(|ca| ca.path().to_owned()),
        })
    }

    /// Release all staged files.
    pub fn clear(&mut self) {
        self.certificate = None;
        self.private_key = None;
        self.ca_bundle = None;
    }
}

/// Extract the subject common name from a PEM-encoded X.509 certificate,
/// used to derive the connection role when no user name is configured.
pub fn certificate_common_name(pem: &[u8]) -> Result<String, Error> {
    let certificate = X509::from_pem(pem).map_err(Error::Certificate)?;

    let entry = certificate
        .subject_name()
        .entries_by_nid(Nid::COMMONNAME)
        .next()
        .ok_or(Error::MissingCommonName)?;

    let name = entry.data().as_utf8().map_err(Error::Certificate)?;

    Ok(name.to_string())
}
