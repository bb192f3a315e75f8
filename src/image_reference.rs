use std::fmt;

/// Registry assumed for image references that do not name one, mirroring the
/// normalization container runtimes apply.
pub static DEFAULT_REGISTRY: &str = "registry-1.docker.io";
static DEFAULT_TAG: &str = "latest";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub reference: Reference,
}

/// A manifest is addressed either by tag or by content digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    Tag(String),
    Digest(String),
}

#[derive(Debug)]
pub enum ParseError {
    MissingRepository,
    InvalidFormat(String),
}

impl std::error::Error for ParseError {}
impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::MissingRepository => write!(f, "repository is missing"),
            ParseError::InvalidFormat(image) => write!(f, "invalid image format: {}", image),
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reference {
            Reference::Tag(tag) => write!(f, "{}/{}:{}", self.registry, self.repository, tag),
            Reference::Digest(digest) => {
                write!(f, "{}/{}@{}", self.registry, self.repository, digest)
            }
        }
    }
}

impl ImageReference {
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        if s.is_empty() {
            return Err(ParseError::InvalidFormat(s.to_string()));
        }

        // Digest references pin a manifest by content address
        let (name, reference) = if let Some((name, digest)) = s.split_once('@') {
            if digest.is_empty() {
                return Err(ParseError::InvalidFormat(s.to_string()));
            }
            (name, Reference::Digest(digest.to_string()))
        } else if let Some(pos) = s.rfind(':') {
            // A colon after the last slash separates the tag
            let last_slash = s.rfind('/').unwrap_or(0);
            if pos > last_slash {
                (&s[..pos], Reference::Tag(s[pos + 1..].to_string()))
            } else {
                (s, Reference::Tag(DEFAULT_TAG.to_string()))
            }
        } else {
            (s, Reference::Tag(DEFAULT_TAG.to_string()))
        };

        if name.is_empty() {
            return Err(ParseError::InvalidFormat(s.to_string()));
        }

        // The first path component is a registry host only if it looks like one;
        // everything else resolves against the default registry
        let (registry, repository) = match name.split_once('/') {
            Some((host, rest)) if is_registry_host(host) => (host.to_string(), rest.to_string()),
            _ => {
                let repository = if name.contains('/') {
                    name.to_string()
                } else {
                    format!("library/{}", name)
                };
                (DEFAULT_REGISTRY.to_string(), repository)
            }
        };

        if repository.is_empty() {
            return Err(ParseError::MissingRepository);
        }

        Ok(Self {
            registry,
            repository,
            reference,
        })
    }

    /// The tag or digest string used in registry manifest URLs.
    pub fn manifest_reference(&self) -> &str {
        match &self.reference {
            Reference::Tag(tag) => tag,
            Reference::Digest(digest) => digest,
        }
    }
}

fn is_registry_host(component: &str) -> bool {
    component.contains('.') || component.contains(':') || component == "localhost"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_name() {
        let reference = ImageReference::parse("nginx:1.25").expect("should parse");
        assert_eq!(reference.registry, DEFAULT_REGISTRY);
        assert_eq!(reference.repository, "library/nginx");
        assert_eq!(reference.reference, Reference::Tag("1.25".to_string()));
    }

    #[test]
    fn test_parse_defaults_tag_to_latest() {
        let reference = ImageReference::parse("redis").expect("should parse");
        assert_eq!(reference.repository, "library/redis");
        assert_eq!(reference.reference, Reference::Tag("latest".to_string()));
    }

    #[test]
    fn test_parse_with_registry_host() {
        let reference = ImageReference::parse("quay.io/library/nginx:1.25").expect("should parse");
        assert_eq!(reference.registry, "quay.io");
        assert_eq!(reference.repository, "library/nginx");
        assert_eq!(reference.reference, Reference::Tag("1.25".to_string()));
    }

    #[test]
    fn test_parse_namespaced_name_without_host() {
        // "acme" has no dot or colon, so it is a repository namespace, not a registry
        let reference =
            ImageReference::parse("acme/quay.io-library-nginx:1.25").expect("should parse");
        assert_eq!(reference.registry, DEFAULT_REGISTRY);
        assert_eq!(reference.repository, "acme/quay.io-library-nginx");
        assert_eq!(reference.reference, Reference::Tag("1.25".to_string()));
    }

    #[test]
    fn test_parse_registry_with_port() {
        let reference = ImageReference::parse("localhost:5000/foo").expect("should parse");
        assert_eq!(reference.registry, "localhost:5000");
        assert_eq!(reference.repository, "foo");
        assert_eq!(reference.reference, Reference::Tag("latest".to_string()));
    }

    #[test]
    fn test_parse_digest_reference() {
        let reference =
            ImageReference::parse("quay.io/app/api@sha256:abcd1234").expect("should parse");
        assert_eq!(reference.registry, "quay.io");
        assert_eq!(reference.repository, "app/api");
        assert_eq!(
            reference.reference,
            Reference::Digest("sha256:abcd1234".to_string())
        );
        assert_eq!(reference.manifest_reference(), "sha256:abcd1234");
    }

    #[test]
    fn test_parse_missing_repository() {
        assert!(matches!(
            ImageReference::parse("quay.io/"),
            Err(ParseError::MissingRepository)
        ));
    }

    #[test]
    fn test_parse_empty_reference() {
        assert!(matches!(
            ImageReference::parse(""),
            Err(ParseError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_display_round_trip() {
        let reference = ImageReference::parse("quay.io/library/nginx:1.25").expect("should parse");
        assert_eq!(reference.to_string(), "quay.io/library/nginx:1.25");
    }
}
