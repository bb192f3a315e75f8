use crate::secret_string::SecretString;
use anyhow::{Context, Result, bail};
use clap::Parser;
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use std::collections::BTreeMap;
use tracing::info;

/// Command-line surface of the controller.
#[derive(Debug, Parser)]
#[command(version, about = "Clones workload container images into a backup registry")]
pub struct Args {
    /// Name of the cluster secret holding the backup registry credentials
    #[arg(long, default_value = "image-cloner-creds")]
    pub docker_creds_secret: String,

    /// Namespace the credentials secret lives in
    #[arg(long, default_value = "default")]
    pub namespace: String,
}

/// Credentials for the backup registry. The username doubles as the mirror
/// prefix that rewritten image references start with.
#[derive(Debug, Clone)]
pub struct RegistryCredentials {
    pub username: String,
    pub password: SecretString,
}

/// One-shot read of the credentials secret. Runs once at start-up; the
/// credentials are immutable for the lifetime of the process.
pub async fn fetch_registry_credentials(
    client: &Client,
    namespace: &str,
    secret_name: &str,
) -> Result<RegistryCredentials> {
    info!(
        "Reading registry credentials from secret {}/{}",
        namespace, secret_name
    );
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let secret = secrets.get(secret_name).await.with_context(|| {
        format!(
            "Failed to fetch docker credentials secret {}/{}",
            namespace, secret_name
        )
    })?;
    credentials_from_secret(&secret)
}

fn credentials_from_secret(secret: &Secret) -> Result<RegistryCredentials> {
    let data = secret
        .data
        .as_ref()
        .context("Credentials secret carries no data fields")?;

    let username = string_field(data, "username")?;
    let password = string_field(data, "password")?;
    if username.is_empty() {
        bail!("Credentials secret field username is empty");
    }

    Ok(RegistryCredentials {
        username,
        password: SecretString::new(password),
    })
}

fn string_field(data: &BTreeMap<String, ByteString>, field: &str) -> Result<String> {
    let bytes = data
        .get(field)
        .with_context(|| format!("Credentials secret is missing field {}", field))?;
    String::from_utf8(bytes.0.clone())
        .with_context(|| format!("Credentials secret field {} is not valid UTF-8", field))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["kube-image-cloner"]);
        assert_eq!(args.docker_creds_secret, "image-cloner-creds");
        assert_eq!(args.namespace, "default");
    }

    #[test]
    fn test_args_overrides() {
        let args = Args::parse_from([
            "kube-image-cloner",
            "--docker-creds-secret",
            "backup-creds",
            "--namespace",
            "infra",
        ]);
        assert_eq!(args.docker_creds_secret, "backup-creds");
        assert_eq!(args.namespace, "infra");
    }

    fn secret_with(fields: &[(&str, &[u8])]) -> Secret {
        Secret {
            data: Some(
                fields
                    .iter()
                    .map(|(key, value)| (key.to_string(), ByteString(value.to_vec())))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn test_credentials_from_secret() {
        let secret = secret_with(&[("username", b"acme"), ("password", b"hunter2")]);
        let credentials = credentials_from_secret(&secret).expect("should extract credentials");
        assert_eq!(credentials.username, "acme");
        assert_eq!(credentials.password.expose_secret(), "hunter2");
    }

    #[test]
    fn test_credentials_missing_field() {
        let secret = secret_with(&[("username", b"acme")]);
        let err = credentials_from_secret(&secret).expect_err("password is required");
        assert!(err.to_string().contains("password"));
    }

    #[test]
    fn test_credentials_empty_username() {
        let secret = secret_with(&[("username", b""), ("password", b"hunter2")]);
        assert!(credentials_from_secret(&secret).is_err());
    }

    #[test]
    fn test_credentials_without_data() {
        assert!(credentials_from_secret(&Secret::default()).is_err());
    }

    #[test]
    fn test_credentials_invalid_utf8() {
        let secret = secret_with(&[("username", &[0xff, 0xfe]), ("password", b"hunter2")]);
        assert!(credentials_from_secret(&secret).is_err());
    }
}
