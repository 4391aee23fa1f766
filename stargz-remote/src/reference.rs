//! Image reference parsing.

use anyhow::{bail, Error};

/// Default registry assumed for bare references.
pub const DOCKER_HOST: &str = "docker.io";
/// Actual endpoint serving the default registry.
pub const DOCKER_REGISTRY_HOST: &str = "registry-1.docker.io";

/// A parsed `[host/]repository[:tag][@digest]` image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    /// Registry endpoint, already rewritten for the default registry.
    pub host: String,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl Reference {
    pub fn parse(s: &str) -> Result<Self, Error> {
        if s.is_empty() {
            bail!("empty image reference");
        }

        let (rest, digest) = match s.split_once('@') {
            Some((rest, digest)) => {
                if !digest.contains(':') {
                    bail!("malformed digest in reference {:?}", s);
                }
                (rest, Some(digest.to_string()))
            }
            None => (s, None),
        };

        // the first segment is a registry host only if it looks like one
        let (host, mut repository) = match rest.split_once('/') {
            Some((first, path))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), path.to_string())
            }
            _ => (DOCKER_HOST.to_string(), rest.to_string()),
        };

        let tag = match repository.rsplit_once(':') {
            Some((repo, tag)) if !tag.contains('/') => {
                let tag = tag.to_string();
                repository = repo.to_string();
                Some(tag)
            }
            _ => None,
        };

        if repository.is_empty() {
            bail!("missing repository in reference {:?}", s);
        }

        // official images live under library/ on the default registry
        let host = if host == DOCKER_HOST || host == "index.docker.io" {
            if !repository.contains('/') {
                repository = format!("library/{}", repository);
            }
            DOCKER_REGISTRY_HOST.to_string()
        } else {
            host
        };

        Ok(Reference {
            host,
            repository,
            tag,
            digest,
        })
    }

    /// Canonical rendering, used as the transport cache key.
    pub fn canonical(&self) -> String {
        let mut out = format!("{}/{}", self.host, self.repository);
        if let Some(ref tag) = self.tag {
            out.push(':');
            out.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            out.push('@');
            out.push_str(digest);
        }
        out
    }

    /// URL of a blob in this repository.
    pub fn blob_url(&self, scheme: &str, digest: &str) -> String {
        format!(
            "{}://{}/v2/{}/blobs/{}",
            scheme, self.host, self.repository, digest
        )
    }

    /// URL of the registry's version check endpoint.
    pub fn v2_url(&self, scheme: &str) -> String {
        format!("{}://{}/v2/", scheme, self.host)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_fully_qualified() {
        let r = Reference::parse("ghcr.io/org/app:v1.2@sha256:abcd").unwrap();
        assert_eq!(r.host, "ghcr.io");
        assert_eq!(r.repository, "org/app");
        assert_eq!(r.tag.as_deref(), Some("v1.2"));
        assert_eq!(r.digest.as_deref(), Some("sha256:abcd"));
        assert_eq!(r.canonical(), "ghcr.io/org/app:v1.2@sha256:abcd");
    }

    #[test]
    fn test_docker_io_rewrite() {
        let r = Reference::parse("docker.io/library/ubuntu:20.04").unwrap();
        assert_eq!(r.host, DOCKER_REGISTRY_HOST);
        assert_eq!(r.repository, "library/ubuntu");

        let r = Reference::parse("ubuntu").unwrap();
        assert_eq!(r.host, DOCKER_REGISTRY_HOST);
        assert_eq!(r.repository, "library/ubuntu");
        assert_eq!(r.tag, None);

        let r = Reference::parse("someorg/app:latest").unwrap();
        assert_eq!(r.host, DOCKER_REGISTRY_HOST);
        assert_eq!(r.repository, "someorg/app");
        assert_eq!(r.tag.as_deref(), Some("latest"));
    }

    #[test]
    fn test_host_with_port_and_localhost() {
        let r = Reference::parse("localhost:5000/test/repo").unwrap();
        assert_eq!(r.host, "localhost:5000");
        assert_eq!(r.repository, "test/repo");

        let r = Reference::parse("localhost/repo").unwrap();
        assert_eq!(r.host, "localhost");
        assert_eq!(r.repository, "repo");
    }

    #[test]
    fn test_urls() {
        let r = Reference::parse("registry.example.com/a/b").unwrap();
        assert_eq!(
            r.blob_url("https", "sha256:ffff"),
            "https://registry.example.com/v2/a/b/blobs/sha256:ffff"
        );
        assert_eq!(r.v2_url("http"), "http://registry.example.com/v2/");
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(Reference::parse("").is_err());
        assert!(Reference::parse("host.io/repo@notadigest").is_err());
    }
}
