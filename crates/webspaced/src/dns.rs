//! DNS TXT lookups for domain ownership verification.

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use log::debug;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("TXT lookup for {domain} failed: {message}")]
pub struct DnsError {
    pub domain: String,
    pub message: String,
}

/// Resolves TXT records. A domain without TXT records yields an empty list.
#[async_trait]
pub trait TxtResolver: Send + Sync {
    async fn lookup_txt(&self, domain: &str) -> Result<Vec<String>, DnsError>;
}

/// Resolver using the system's DNS configuration.
pub struct SystemResolver {
    resolver: TokioAsyncResolver,
}

impl SystemResolver {
    pub fn from_system_conf() -> Result<Self, DnsError> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf().map_err(|e| DnsError {
            domain: String::new(),
            message: e.to_string(),
        })?;
        Ok(Self { resolver })
    }
}

fn is_no_records(err: &ResolveError) -> bool {
    matches!(err.kind(), ResolveErrorKind::NoRecordsFound { .. })
}

#[async_trait]
impl TxtResolver for SystemResolver {
    async fn lookup_txt(&self, domain: &str) -> Result<Vec<String>, DnsError> {
        let lookup = match self.resolver.txt_lookup(domain).await {
            Ok(lookup) => lookup,
            Err(e) if is_no_records(&e) => {
                debug!("No TXT records for {}", domain);
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(DnsError {
                    domain: domain.to_string(),
                    message: e.to_string(),
                });
            }
        };

        // A single TXT record may be split into several character strings.
        Ok(lookup
            .iter()
            .map(|txt| {
                txt.txt_data()
                    .iter()
                    .map(|chunk| String::from_utf8_lossy(chunk))
                    .collect::<String>()
            })
            .collect())
    }
}
