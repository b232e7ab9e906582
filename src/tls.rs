use std::fmt;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use std::time::SystemTime;

use rustls::client::{ServerCertVerified, ServerCertVerifier, WebPkiVerifier};
use rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore, ServerName, SupportedCipherSuite};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio_rustls::TlsConnector;

use crate::diagnostics::Diagnostics;
use crate::error::{Error, Result};

/// TLS protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(try_from = "String")]
pub enum TlsVersion {
    /// TLS 1.0 (accepted in configuration, raised to 1.2)
    Tls10,
    /// TLS 1.1 (accepted in configuration, raised to 1.2)
    Tls11,
    /// TLS 1.2
    Tls12,
    /// TLS 1.3
    Tls13,
}

impl TlsVersion {
    /// Get the version as written in configuration
    pub fn as_str(&self) -> &'static str {
        match self {
            TlsVersion::Tls10 => "1.0",
            TlsVersion::Tls11 => "1.1",
            TlsVersion::Tls12 => "1.2",
            TlsVersion::Tls13 => "1.3",
        }
    }
}

impl FromStr for TlsVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim().to_ascii_lowercase();
        let bare = trimmed
            .trim_start_matches("tlsv")
            .trim_start_matches("tls")
            .trim_start_matches(['_', ' ']);
        match bare {
            "1" | "1.0" | "1_0" => Ok(TlsVersion::Tls10),
            "1.1" | "1_1" => Ok(TlsVersion::Tls11),
            "1.2" | "1_2" => Ok(TlsVersion::Tls12),
            "1.3" | "1_3" => Ok(TlsVersion::Tls13),
            _ => Err(Error::config(format!("Unknown TLS version '{}'", s))),
        }
    }
}

impl TryFrom<String> for TlsVersion {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TLS {}", self.as_str())
    }
}

/// A caller-owned rustls configuration used as the base of the built one.
///
/// The configuration is deep-cloned on every build, so mutating the caller's
/// copy afterwards never reaches a built client.
#[derive(Clone)]
pub struct BaseConfig(pub Arc<ClientConfig>);

impl fmt::Debug for BaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BaseConfig(..)")
    }
}

/// TLS configuration for HTTP requests
///
/// Certificates, trust roots, protocol bounds, cipher restriction and pinned
/// fingerprints. Built into a [`TlsContext`] with [`TlsConfig::build`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// PEM file with trust roots replacing the system roots
    pub ca_cert: Option<PathBuf>,
    /// Also trust the system roots when `ca_cert` is set
    pub merge_native_roots: bool,
    /// PEM client certificate chain
    pub client_cert: Option<PathBuf>,
    /// PEM client private key (PKCS#8, RSA or EC)
    pub client_key: Option<PathBuf>,
    /// SHA-256 fingerprints of acceptable peer certificates
    pub pinned_fingerprints: Vec<String>,
    /// Run standard chain validation in addition to the pin check
    pub verify_chain_with_pins: bool,
    /// Server name sent in the handshake instead of the target host
    pub sni: Option<String>,
    /// Lowest protocol version (default 1.2)
    pub min_version: Option<TlsVersion>,
    /// Highest protocol version (default 1.3)
    pub max_version: Option<TlsVersion>,
    /// Allowed cipher suites by IANA name
    pub ciphers: Vec<String>,
    /// Disable certificate verification
    pub insecure: bool,
    /// Do not print the warning that comes with `insecure`
    pub suppress_insecure_warning: bool,
    #[serde(skip)]
    base: Option<BaseConfig>,
}

impl TlsConfig {
    /// Create a new TLS configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a TLS builder
    pub fn builder() -> TlsBuilder {
        TlsBuilder::new()
    }

    /// Check if a client certificate is configured
    pub fn has_client_cert(&self) -> bool {
        self.client_cert.is_some() || self.client_key.is_some()
    }

    /// Check if certificate verification is enabled
    pub fn is_verify_enabled(&self) -> bool {
        !self.insecure
    }

    /// Check if certificate pinning is enabled
    pub fn is_pinned(&self) -> bool {
        !self.pinned_fingerprints.is_empty()
    }

    /// Assemble the rustls configuration.
    ///
    /// Fails with a configuration error for inconsistent options and with a
    /// TLS error when a certificate, key or CA file cannot be loaded.
    pub fn build(&self, diagnostics: &Diagnostics) -> Result<TlsContext> {
        let client_auth = self.load_client_auth()?;
        let pins = self
            .pinned_fingerprints
            .iter()
            .map(|fp| normalize_fingerprint(fp))
            .collect::<Result<Vec<_>>>()?;

        let mut config = match &self.base {
            Some(BaseConfig(base)) => {
                if client_auth.is_some() {
                    return Err(Error::config(
                        "client certificate cannot be combined with a preconfigured TLS config",
                    ));
                }
                ClientConfig::clone(base)
            }
            None => self.fresh_config(client_auth, &pins)?,
        };

        if let Some(verifier) = self.custom_verifier(&pins, diagnostics)? {
            config.dangerous().set_certificate_verifier(verifier);
        }
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        let sni = self
            .sni
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        if let Some(name) = &sni {
            ServerName::try_from(name.as_str())
                .map_err(|_| Error::config(format!("Invalid SNI server name '{}'", name)))?;
        }

        tracing::debug!(
            pinned = pins.len(),
            insecure = self.insecure,
            sni = sni.as_deref().unwrap_or("<target host>"),
            "built TLS configuration"
        );
        Ok(TlsContext {
            config: Arc::new(config),
            sni,
        })
    }

    fn fresh_config(
        &self,
        client_auth: Option<(Vec<Certificate>, PrivateKey)>,
        pins: &[String],
    ) -> Result<ClientConfig> {
        let versions = self.protocol_versions()?;
        let suites = self.cipher_suites()?;
        let builder = ClientConfig::builder()
            .with_cipher_suites(&suites)
            .with_safe_default_kx_groups()
            .with_protocol_versions(&versions)
            .map_err(|e| Error::config(format!("Unusable TLS version/cipher combination: {}", e)))?;

        // Pinned and insecure modes replace this verifier after the build.
        let roots = if pins.is_empty() && !self.insecure {
            self.root_store()?
        } else {
            RootCertStore::empty()
        };
        let builder = builder.with_root_certificates(roots);

        match client_auth {
            Some((certs, key)) => builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| Error::config(format!("Client certificate does not match its key: {}", e))),
            None => Ok(builder.with_no_client_auth()),
        }
    }

    fn custom_verifier(
        &self,
        pins: &[String],
        diagnostics: &Diagnostics,
    ) -> Result<Option<Arc<dyn ServerCertVerifier>>> {
        if !pins.is_empty() {
            if self.insecure {
                diagnostics.warn(
                    "both certificate pinning and insecure mode are set; pinned fingerprints are enforced",
                );
            }
            let chain = if self.verify_chain_with_pins {
                Some(WebPkiVerifier::new(self.root_store()?, None))
            } else {
                None
            };
            return Ok(Some(Arc::new(PinningVerifier {
                pins: pins.to_vec(),
                chain,
            })));
        }
        if self.insecure {
            if !self.suppress_insecure_warning {
                diagnostics.warn(
                    "TLS certificate verification is disabled; the connection is not authenticated",
                );
            }
            return Ok(Some(Arc::new(InsecureVerifier)));
        }
        Ok(None)
    }

    fn protocol_versions(&self) -> Result<Vec<&'static rustls::SupportedProtocolVersion>> {
        let mut min = self.min_version.unwrap_or(TlsVersion::Tls12);
        let max = self.max_version.unwrap_or(TlsVersion::Tls13);
        if min < TlsVersion::Tls12 {
            tracing::warn!(requested = %min, "minimum TLS version raised to TLS 1.2");
            min = TlsVersion::Tls12;
        }
        if max < TlsVersion::Tls12 {
            return Err(Error::config(format!(
                "Maximum TLS version {} is below the supported floor TLS 1.2",
                max
            )));
        }
        if min > max {
            return Err(Error::config(format!(
                "Minimum TLS version {} is above maximum {}",
                min, max
            )));
        }
        let mut versions = Vec::new();
        if min <= TlsVersion::Tls12 {
            versions.push(&rustls::version::TLS12);
        }
        if max >= TlsVersion::Tls13 {
            versions.push(&rustls::version::TLS13);
        }
        Ok(versions)
    }

    fn cipher_suites(&self) -> Result<Vec<SupportedCipherSuite>> {
        if self.ciphers.is_empty() {
            return Ok(rustls::DEFAULT_CIPHER_SUITES.to_vec());
        }
        self.ciphers
            .iter()
            .map(|name| {
                let wanted = cipher_key(name);
                rustls::ALL_CIPHER_SUITES
                    .iter()
                    .copied()
                    .find(|suite| cipher_key(&format!("{:?}", suite.suite())) == wanted)
                    .ok_or_else(|| Error::config(format!("Unknown cipher suite '{}'", name)))
            })
            .collect()
    }

    fn root_store(&self) -> Result<RootCertStore> {
        let mut store = RootCertStore::empty();
        match &self.ca_cert {
            Some(path) => {
                for cert in load_certs(path)? {
                    store.add(&cert).map_err(|e| {
                        Error::tls(format!("Invalid CA certificate in {}: {}", path.display(), e))
                    })?;
                }
                if self.merge_native_roots {
                    add_native_roots(&mut store);
                }
            }
            None => add_native_roots(&mut store),
        }
        Ok(store)
    }

    fn load_client_auth(&self) -> Result<Option<(Vec<Certificate>, PrivateKey)>> {
        match (&self.client_cert, &self.client_key) {
            (Some(cert), Some(key)) => Ok(Some((load_certs(cert)?, load_private_key(key)?))),
            (Some(_), None) => Err(Error::config("client certificate given without a private key")),
            (None, Some(_)) => Err(Error::config("client private key given without a certificate")),
            (None, None) => Ok(None),
        }
    }
}

/// TLS configuration builder
#[derive(Debug, Default)]
pub struct TlsBuilder {
    config: TlsConfig,
}

impl TlsBuilder {
    /// Create a new TLS builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Disable certificate verification
    pub fn insecure(mut self, insecure: bool) -> Self {
        self.config.insecure = insecure;
        self
    }

    /// Silence the insecure-mode warning
    pub fn suppress_insecure_warning(mut self) -> Self {
        self.config.suppress_insecure_warning = true;
        self
    }

    /// Set CA certificate path
    pub fn ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.ca_cert = Some(path.into());
        self
    }

    /// Trust the system roots alongside the CA file
    pub fn merge_native_roots(mut self) -> Self {
        self.config.merge_native_roots = true;
        self
    }

    /// Set client certificate and key paths
    pub fn client_cert(mut self, cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        self.config.client_cert = Some(cert_path.into());
        self.config.client_key = Some(key_path.into());
        self
    }

    /// Pin a SHA-256 certificate fingerprint
    pub fn pin(mut self, fingerprint: &str) -> Self {
        self.config.pinned_fingerprints.push(fingerprint.to_string());
        self
    }

    /// Also run chain validation when pins are set
    pub fn verify_chain_with_pins(mut self) -> Self {
        self.config.verify_chain_with_pins = true;
        self
    }

    /// Override the server name sent in the handshake
    pub fn sni(mut self, name: &str) -> Self {
        self.config.sni = Some(name.to_string());
        self
    }

    /// Set the lowest allowed version
    pub fn min_version(mut self, version: TlsVersion) -> Self {
        self.config.min_version = Some(version);
        self
    }

    /// Set the highest allowed version
    pub fn max_version(mut self, version: TlsVersion) -> Self {
        self.config.max_version = Some(version);
        self
    }

    /// Add a cipher suite
    pub fn cipher_suite(mut self, suite: &str) -> Self {
        self.config.ciphers.push(suite.to_string());
        self
    }

    /// Start from a caller-owned rustls configuration
    pub fn base_config(mut self, config: Arc<ClientConfig>) -> Self {
        self.config.base = Some(BaseConfig(config));
        self
    }

    /// Build the TLS configuration
    pub fn build(self) -> TlsConfig {
        self.config
    }
}

/// A built TLS configuration, immutable and shareable across connections
#[derive(Clone)]
pub struct TlsContext {
    config: Arc<ClientConfig>,
    sni: Option<String>,
}

impl TlsContext {
    /// Advertise these ALPN protocols, in preference order
    pub fn with_alpn(mut self, protocols: &[&[u8]]) -> Self {
        let config = Arc::make_mut(&mut self.config);
        config.alpn_protocols = protocols.iter().map(|p| p.to_vec()).collect();
        self
    }

    /// Get the rustls configuration
    pub fn config(&self) -> &Arc<ClientConfig> {
        &self.config
    }

    /// Get the SNI override
    pub fn sni(&self) -> Option<&str> {
        self.sni.as_deref()
    }

    /// Server name for a handshake with `host`, honouring the SNI override
    pub fn server_name(&self, host: &str) -> Result<ServerName> {
        let name = self.sni.as_deref().unwrap_or(host);
        let name = name.trim_start_matches('[').trim_end_matches(']');
        ServerName::try_from(name).map_err(|_| Error::tls(format!("Invalid server name '{}'", name)))
    }

    /// Create a connector for this configuration
    pub fn connector(&self) -> TlsConnector {
        TlsConnector::from(Arc::clone(&self.config))
    }
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsContext")
            .field("alpn", &self.config.alpn_protocols.len())
            .field("sni", &self.sni)
            .finish()
    }
}

/// Accepts a peer when any certificate it presents matches a pinned digest
struct PinningVerifier {
    pins: Vec<String>,
    chain: Option<WebPkiVerifier>,
}

impl ServerCertVerifier for PinningVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &Certificate,
        intermediates: &[Certificate],
        server_name: &ServerName,
        scts: &mut dyn Iterator<Item = &[u8]>,
        ocsp_response: &[u8],
        now: SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let presented = std::iter::once(end_entity).chain(intermediates.iter());
        let mut candidates = 0usize;
        let mut matched = false;
        for cert in presented {
            candidates += 1;
            let digest = fingerprint(&cert.0);
            if self.pins.iter().any(|pin| pin == &digest) {
                matched = true;
                break;
            }
        }
        if candidates == 0 || !matched {
            tracing::warn!(candidates, "certificate pin verification failed");
            return Err(rustls::Error::General(format!(
                "certificate pin mismatch: none of {} presented certificates matches a pinned fingerprint",
                candidates
            )));
        }
        match &self.chain {
            Some(chain) => chain.verify_server_cert(
                end_entity,
                intermediates,
                server_name,
                scts,
                ocsp_response,
                now,
            ),
            None => Ok(ServerCertVerified::assertion()),
        }
    }
}

/// Accepts any certificate
struct InsecureVerifier;

impl ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

/// Lowercase hex SHA-256 of a DER certificate
pub fn fingerprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

/// Normalize a pinned fingerprint: optional `sha256:` prefix, `:` separators
/// and case are ignored. Anything but 64 hex digits is a configuration error.
pub fn normalize_fingerprint(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    let without_prefix = trimmed
        .get(..7)
        .filter(|p| p.eq_ignore_ascii_case("sha256:"))
        .map(|_| &trimmed[7..])
        .unwrap_or(trimmed);
    let hex: String = without_prefix
        .chars()
        .filter(|c| *c != ':' && !c.is_whitespace())
        .collect::<String>()
        .to_ascii_lowercase();
    if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::config(format!(
            "Invalid SHA-256 fingerprint '{}'",
            raw
        )));
    }
    Ok(hex)
}

fn cipher_key(name: &str) -> String {
    let upper = name.trim().to_ascii_uppercase().replace('-', "_");
    match upper.strip_prefix("TLS13_") {
        Some(rest) => format!("TLS_{}", rest),
        None => upper,
    }
}

static NATIVE_ROOTS: OnceLock<Vec<Certificate>> = OnceLock::new();

/// System trust roots, loaded once per process
pub fn native_roots() -> &'static [Certificate] {
    NATIVE_ROOTS.get_or_init(|| match rustls_native_certs::load_native_certs() {
        Ok(certs) => {
            tracing::debug!(count = certs.len(), "loaded native root certificates");
            certs
                .into_iter()
                .map(|cert| Certificate(cert.as_ref().to_vec()))
                .collect()
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to load native root certificates");
            Vec::new()
        }
    })
}

fn add_native_roots(store: &mut RootCertStore) {
    let ders: Vec<&[u8]> = native_roots().iter().map(|c| c.0.as_slice()).collect();
    let (added, skipped) = store.add_parsable_certificates(&ders);
    if skipped > 0 {
        tracing::debug!(added, skipped, "skipped unparsable native root certificates");
    }
}

fn open(path: &Path, what: &str) -> Result<BufReader<std::fs::File>> {
    std::fs::File::open(path)
        .map(BufReader::new)
        .map_err(|e| Error::tls(format!("Failed to read {} {}: {}", what, path.display(), e)))
}

/// Load every certificate from a PEM file
pub fn load_certs(path: &Path) -> Result<Vec<Certificate>> {
    let mut reader = open(path, "certificate file")?;
    let certs = rustls_pemfile::certs(&mut reader)
        .map_err(|e| Error::tls(format!("Invalid PEM in {}: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(Error::tls(format!("No certificates found in {}", path.display())));
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

/// Load the first private key (PKCS#8, PKCS#1 RSA or SEC1 EC) from a PEM file
pub fn load_private_key(path: &Path) -> Result<PrivateKey> {
    let mut reader = open(path, "private key file")?;
    let items = rustls_pemfile::read_all(&mut reader)
        .map_err(|e| Error::tls(format!("Invalid PEM in {}: {}", path.display(), e)))?;
    items
        .into_iter()
        .find_map(|item| match item {
            rustls_pemfile::Item::PKCS8Key(key)
            | rustls_pemfile::Item::RSAKey(key)
            | rustls_pemfile::Item::ECKey(key) => Some(PrivateKey(key)),
            _ => None,
        })
        .ok_or_else(|| Error::tls(format!("No private key found in {}", path.display())))
}
