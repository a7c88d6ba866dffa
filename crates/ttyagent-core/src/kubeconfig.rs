//! Kubeconfig parsing and file-credential inlining.
//!
//! Client kubeconfigs frequently reference credentials by path
//! (`certificate-authority`, `client-certificate`, `client-key`). Those
//! paths exist on the machine that wrote the kubeconfig, not inside the
//! gateway container, so they are read and inlined as base64 `*-data`
//! fields before the config is handed to the Kubernetes client.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use kube::config::Kubeconfig;
use secrecy::SecretString;

#[derive(Debug, thiserror::Error)]
pub enum KubeconfigError {
    #[error("kubeconfig parse error: {0}")]
    Parse(#[from] kube::config::KubeconfigError),
    #[error("failed to read credential file {path}: {source}")]
    Credential {
        path: String,
        source: std::io::Error,
    },
}

/// Parses a kubeconfig blob and inlines any file-based credentials.
pub fn parse_and_inline(text: &str) -> Result<Kubeconfig, KubeconfigError> {
    let mut kubeconfig = Kubeconfig::from_yaml(text)?;
    inline_file_credentials(&mut kubeconfig)?;
    Ok(kubeconfig)
}

/// Replaces `certificate-authority`, `client-certificate` and
/// `client-key` path references with their base64-encoded `*-data`
/// counterparts. Entries that already carry inline data are left alone.
pub fn inline_file_credentials(kubeconfig: &mut Kubeconfig) -> Result<(), KubeconfigError> {
    for named in &mut kubeconfig.clusters {
        let Some(cluster) = named.cluster.as_mut() else {
            continue;
        };
        if cluster.certificate_authority_data.is_none() {
            if let Some(path) = cluster.certificate_authority.take() {
                cluster.certificate_authority_data = Some(read_base64(&path)?);
            }
        }
    }
    for named in &mut kubeconfig.auth_infos {
        let Some(auth) = named.auth_info.as_mut() else {
            continue;
        };
        if auth.client_certificate_data.is_none() {
            if let Some(path) = auth.client_certificate.take() {
                auth.client_certificate_data = Some(read_base64(&path)?);
            }
        }
        if auth.client_key_data.is_none() {
            if let Some(path) = auth.client_key.take() {
                auth.client_key_data = Some(SecretString::from(read_base64(&path)?));
            }
        }
    }
    Ok(())
}

fn read_base64(path: &str) -> Result<String, KubeconfigError> {
    let bytes = std::fs::read(path).map_err(|source| KubeconfigError::Credential {
        path: path.to_string(),
        source,
    })?;
    Ok(BASE64.encode(bytes))
}
