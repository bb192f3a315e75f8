use crate::config::RegistryCredentials;
use crate::image_reference::{ImageReference, ParseError};
use crate::secret_string::SecretString;
use anyhow::{Context, Result};
use regex::Regex;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, LOCATION, WWW_AUTHENTICATE};
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;
use std::future::Future;
use thiserror::Error;
use tracing::{debug, info};

static MANIFEST_ACCEPT: &str = "application/vnd.oci.image.manifest.v1+json, \
     application/vnd.oci.image.index.v1+json, \
     application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.docker.distribution.manifest.list.v2+json";

#[derive(Debug, Error)]
pub enum CloneError {
    #[error("invalid image reference: {0}")]
    Reference(#[from] ParseError),
    #[error("registry request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to decode manifest JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("registry {registry} returned status {status} for {url}")]
    UnexpectedStatus {
        registry: String,
        status: StatusCode,
        url: String,
    },
    #[error("manifest is missing field {field}")]
    MalformedManifest { field: &'static str },
    #[error("registry {registry} did not return an upload location")]
    MissingUploadLocation { registry: String },
    #[error("registry {registry} denied access and offered no usable auth challenge")]
    Unauthorized { registry: String },
}

/// Copies images into the backup registry and classifies references that
/// already live there.
pub trait ImageCloner {
    /// True iff the reference already points into the mirror. Must be cheap,
    /// it runs on every container of every delivered event.
    fn is_mirrored(&self, image: &str) -> bool;

    /// Copy the image at `source` to `destination`, authenticating against the
    /// destination registry with the configured credentials. Copying to the
    /// same destination twice is a replace.
    fn clone_image(
        &self,
        source: &str,
        destination: &str,
    ) -> impl Future<Output = Result<(), CloneError>> + Send;
}

/// A reference lives in the mirror iff it starts with the mirror prefix
/// followed by a slash. The predicate chain and the cloner share this rule.
pub fn is_mirror_reference(prefix: &str, image: &str) -> bool {
    image
        .strip_prefix(prefix)
        .is_some_and(|rest| rest.starts_with('/'))
}

/// Destination reference for a source image: the mirror prefix, a slash, and
/// the source with every slash flattened to a dash.
pub fn mirror_reference(prefix: &str, source: &str) -> String {
    format!("{}/{}", prefix, source.replace('/', "-"))
}

/// Default [`ImageCloner`] backed by the OCI distribution HTTP API. Source
/// pulls are anonymous with a bearer-challenge fallback; destination pushes
/// authenticate with the backup registry credentials.
pub struct RegistryCloner {
    http: Client,
    mirror_prefix: String,
    username: String,
    password: SecretString,
}

struct Manifest {
    media_type: String,
    payload: Vec<u8>,
    json: Value,
}

#[derive(Clone, Copy)]
enum Auth {
    Anonymous,
    Credentials,
}

struct BearerChallenge {
    realm: String,
    service: Option<String>,
    scope: Option<String>,
}

impl RegistryCloner {
    pub fn new(credentials: RegistryCredentials) -> Result<Self> {
        // System certificates are loaded automatically with rustls-tls-native-roots
        let http = Client::builder()
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http,
            mirror_prefix: credentials.username.clone(),
            username: credentials.username,
            password: credentials.password,
        })
    }

    async fn fetch_manifest(
        &self,
        image: &ImageReference,
        reference: &str,
    ) -> Result<Manifest, CloneError> {
        let url = format!(
            "https://{}/v2/{}/manifests/{}",
            image.registry, image.repository, reference
        );
        debug!("fetching manifest from URL {}", url);

        let request = self.http.get(&url).header(ACCEPT, MANIFEST_ACCEPT);
        let response = self.send(request, &image.registry, Auth::Anonymous).await?;
        let response = expect_success(response, &image.registry)?;

        let media_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("application/vnd.docker.distribution.manifest.v2+json")
            .to_string();
        let payload = response.bytes().await?.to_vec();
        let json = serde_json::from_slice(&payload)?;

        Ok(Manifest {
            media_type,
            payload,
            json,
        })
    }

    async fn push_manifest(
        &self,
        image: &ImageReference,
        reference: &str,
        manifest: &Manifest,
    ) -> Result<(), CloneError> {
        let url = format!(
            "https://{}/v2/{}/manifests/{}",
            image.registry, image.repository, reference
        );
        debug!("pushing manifest to URL {}", url);

        let request = self
            .http
            .put(&url)
            .header(CONTENT_TYPE, manifest.media_type.clone())
            .body(manifest.payload.clone());
        let response = self
            .send(request, &image.registry, Auth::Credentials)
            .await?;
        expect_success(response, &image.registry)?;
        Ok(())
    }

    async fn copy_blobs(
        &self,
        source: &ImageReference,
        destination: &ImageReference,
        manifest: &Manifest,
    ) -> Result<(), CloneError> {
        for digest in blob_digests(manifest)? {
            if self.blob_exists(destination, &digest).await? {
                debug!(
                    "blob {} already present in {}",
                    digest, destination.repository
                );
                continue;
            }
            let data = self.pull_blob(source, &digest).await?;
            self.push_blob(destination, &digest, data).await?;
        }
        Ok(())
    }

    async fn blob_exists(
        &self,
        image: &ImageReference,
        digest: &str,
    ) -> Result<bool, CloneError> {
        let url = format!(
            "https://{}/v2/{}/blobs/{}",
            image.registry, image.repository, digest
        );
        let request = self.http.head(&url);
        let response = self
            .send(request, &image.registry, Auth::Credentials)
            .await?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(CloneError::UnexpectedStatus {
                registry: image.registry.clone(),
                status,
                url,
            }),
        }
    }

    async fn pull_blob(
        &self,
        image: &ImageReference,
        digest: &str,
    ) -> Result<Vec<u8>, CloneError> {
        let url = format!(
            "https://{}/v2/{}/blobs/{}",
            image.registry, image.repository, digest
        );
        debug!("pulling blob from URL {}", url);
        let request = self.http.get(&url);
        let response = self.send(request, &image.registry, Auth::Anonymous).await?;
        let response = expect_success(response, &image.registry)?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn push_blob(
        &self,
        image: &ImageReference,
        digest: &str,
        data: Vec<u8>,
    ) -> Result<(), CloneError> {
        let url = format!(
            "https://{}/v2/{}/blobs/uploads/",
            image.registry, image.repository
        );
        let request = self.http.post(&url);
        let response = self
            .send(request, &image.registry, Auth::Credentials)
            .await?;
        let response = expect_success(response, &image.registry)?;

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| CloneError::MissingUploadLocation {
                registry: image.registry.clone(),
            })?;
        let upload_url = if location.starts_with("http") {
            location.to_string()
        } else {
            format!("https://{}{}", image.registry, location)
        };
        let separator = if upload_url.contains('?') { '&' } else { '?' };
        let upload_url = format!("{}{}digest={}", upload_url, separator, digest);

        debug!("uploading blob {} to URL {}", digest, upload_url);
        let request = self
            .http
            .put(&upload_url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(data);
        let response = self
            .send(request, &image.registry, Auth::Credentials)
            .await?;
        expect_success(response, &image.registry)?;
        Ok(())
    }

    fn apply_auth(&self, request: reqwest::RequestBuilder, auth: Auth) -> reqwest::RequestBuilder {
        match auth {
            Auth::Anonymous => request,
            Auth::Credentials => {
                request.basic_auth(&self.username, Some(self.password.expose_secret()))
            }
        }
    }

    /// Sends a registry request, answering the bearer challenge when the
    /// registry rejects the first attempt.
    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        registry: &str,
        auth: Auth,
    ) -> Result<Response, CloneError> {
        let retry = request.try_clone();
        let response = self.apply_auth(request, auth).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_bearer_challenge);
        let (Some(retry), Some(challenge)) = (retry, challenge) else {
            return Err(CloneError::Unauthorized {
                registry: registry.to_string(),
            });
        };

        let token = self.fetch_bearer_token(&challenge, auth).await?;
        Ok(retry
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .send()
            .await?)
    }

    async fn fetch_bearer_token(
        &self,
        challenge: &BearerChallenge,
        auth: Auth,
    ) -> Result<String, CloneError> {
        let mut query: Vec<(&str, &str)> = Vec::new();
        if let Some(service) = &challenge.service {
            query.push(("service", service));
        }
        if let Some(scope) = &challenge.scope {
            query.push(("scope", scope));
        }

        let request = self.http.get(&challenge.realm).query(&query);
        let response = self
            .apply_auth(request, auth)
            .send()
            .await?
            .error_for_status()?;
        let body: Value = response.json().await?;

        body.get("token")
            .or_else(|| body.get("access_token"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| CloneError::Unauthorized {
                registry: challenge.realm.clone(),
            })
    }
}

impl ImageCloner for RegistryCloner {
    fn is_mirrored(&self, image: &str) -> bool {
        is_mirror_reference(&self.mirror_prefix, image)
    }

    async fn clone_image(&self, source: &str, destination: &str) -> Result<(), CloneError> {
        let source = ImageReference::parse(source)?;
        let destination = ImageReference::parse(destination)?;
        info!("starting cloning process for image {}", source);

        let manifest = self
            .fetch_manifest(&source, source.manifest_reference())
            .await?;

        if let Some(children) = index_manifest_digests(&manifest)? {
            // Per-platform manifests must land before the index that references them
            for digest in children {
                let child = self.fetch_manifest(&source, &digest).await?;
                self.copy_blobs(&source, &destination, &child).await?;
                self.push_manifest(&destination, &digest, &child).await?;
            }
        } else {
            self.copy_blobs(&source, &destination, &manifest).await?;
        }

        self.push_manifest(&destination, destination.manifest_reference(), &manifest)
            .await?;
        info!("finished cloning image {} to {}", source, destination);
        Ok(())
    }
}

fn expect_success(response: Response, registry: &str) -> Result<Response, CloneError> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(CloneError::UnexpectedStatus {
            registry: registry.to_string(),
            status: response.status(),
            url: response.url().to_string(),
        })
    }
}

fn blob_digests(manifest: &Manifest) -> Result<Vec<String>, CloneError> {
    let config = manifest
        .json
        .get("config")
        .and_then(|config| config.get("digest"))
        .and_then(Value::as_str)
        .ok_or(CloneError::MalformedManifest {
            field: "config.digest",
        })?;

    let mut digests = vec![config.to_string()];
    let layers = manifest
        .json
        .get("layers")
        .and_then(Value::as_array)
        .ok_or(CloneError::MalformedManifest { field: "layers" })?;
    for layer in layers {
        let digest = layer
            .get("digest")
            .and_then(Value::as_str)
            .ok_or(CloneError::MalformedManifest {
                field: "layers.digest",
            })?;
        digests.push(digest.to_string());
    }
    Ok(digests)
}

/// Digests of the per-platform manifests when `manifest` is an index or
/// manifest list, `None` for a plain image manifest.
fn index_manifest_digests(manifest: &Manifest) -> Result<Option<Vec<String>>, CloneError> {
    if !manifest.media_type.contains("index") && !manifest.media_type.contains("list") {
        return Ok(None);
    }

    let entries = manifest
        .json
        .get("manifests")
        .and_then(Value::as_array)
        .ok_or(CloneError::MalformedManifest { field: "manifests" })?;
    let digests = entries
        .iter()
        .map(|entry| {
            entry
                .get("digest")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or(CloneError::MalformedManifest {
                    field: "manifests.digest",
                })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Some(digests))
}

fn parse_bearer_challenge(header: &str) -> Option<BearerChallenge> {
    let header = header.strip_prefix("Bearer ")?;
    let re = Regex::new(r#"(\w+)="([^"]*)""#).expect("static challenge regex");

    let mut realm = None;
    let mut service = None;
    let mut scope = None;
    for caps in re.captures_iter(header) {
        match &caps[1] {
            "realm" => realm = Some(caps[2].to_string()),
            "service" => service = Some(caps[2].to_string()),
            "scope" => scope = Some(caps[2].to_string()),
            _ => {}
        }
    }

    Some(BearerChallenge {
        realm: realm?,
        service,
        scope,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_is_mirror_reference_requires_prefix_and_slash() {
        assert!(is_mirror_reference("acme", "acme/nginx:1.25"));
        assert!(!is_mirror_reference("acme", "nginx:1.25"));
        assert!(!is_mirror_reference("acme", "acmecorp/nginx:1.25"));
        assert!(!is_mirror_reference("acme", "acme"));
    }

    #[test]
    fn test_mirror_reference_flattens_slashes() {
        assert_eq!(
            mirror_reference("acme", "quay.io/library/nginx:1.25"),
            "acme/quay.io-library-nginx:1.25"
        );
        assert_eq!(mirror_reference("acme", "nginx:1.25"), "acme/nginx:1.25");
    }

    #[test]
    fn test_mirror_reference_output_is_mirrored() {
        for source in ["nginx:1.25", "quay.io/library/nginx:1.25", "redis"] {
            let destination = mirror_reference("acme", source);
            assert!(is_mirror_reference("acme", &destination));
        }
    }

    fn manifest_from(media_type: &str, json: Value) -> Manifest {
        Manifest {
            media_type: media_type.to_string(),
            payload: json.to_string().into_bytes(),
            json,
        }
    }

    #[test]
    fn test_blob_digests_collects_config_and_layers() {
        let manifest = manifest_from(
            "application/vnd.oci.image.manifest.v1+json",
            json!({
                "config": {"digest": "sha256:cfg"},
                "layers": [{"digest": "sha256:l1"}, {"digest": "sha256:l2"}],
            }),
        );
        let digests = blob_digests(&manifest).expect("should collect digests");
        assert_eq!(digests, vec!["sha256:cfg", "sha256:l1", "sha256:l2"]);
    }

    #[test]
    fn test_blob_digests_rejects_missing_config() {
        let manifest = manifest_from(
            "application/vnd.oci.image.manifest.v1+json",
            json!({"layers": []}),
        );
        assert!(matches!(
            blob_digests(&manifest),
            Err(CloneError::MalformedManifest {
                field: "config.digest"
            })
        ));
    }

    #[test]
    fn test_index_manifest_digests() {
        let manifest = manifest_from(
            "application/vnd.oci.image.index.v1+json",
            json!({"manifests": [{"digest": "sha256:amd64"}, {"digest": "sha256:arm64"}]}),
        );
        let digests = index_manifest_digests(&manifest)
            .expect("should parse")
            .expect("should detect index");
        assert_eq!(digests, vec!["sha256:amd64", "sha256:arm64"]);

        let plain = manifest_from(
            "application/vnd.docker.distribution.manifest.v2+json",
            json!({"config": {}, "layers": []}),
        );
        assert!(index_manifest_digests(&plain).expect("should parse").is_none());
    }

    #[test]
    fn test_parse_bearer_challenge() {
        let challenge = parse_bearer_challenge(
            r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/nginx:pull""#,
        )
        .expect("should parse challenge");
        assert_eq!(challenge.realm, "https://auth.docker.io/token");
        assert_eq!(challenge.service.as_deref(), Some("registry.docker.io"));
        assert_eq!(
            challenge.scope.as_deref(),
            Some("repository:library/nginx:pull")
        );

        assert!(parse_bearer_challenge("Basic realm=\"x\"").is_none());
    }
}
