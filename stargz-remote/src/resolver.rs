//! Registry resolution.
//!
//! Turns an image reference and a blob digest into a ready transport:
//! scheme picked by the insecure-host list, credentials from the ambient
//! keychain, a pull-scoped bearer token from the registry's auth challenge,
//! and a probed blob URL with one redirect followed. Transports are cached
//! per canonical reference and re-resolve themselves in place on failure.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as _, Error};
use hyper::{Body, Client, Request};
use regex::Regex;
use serde::Deserialize;
use tokio::runtime::Runtime;

use crate::http::{build_client, HttpsConnector};
use crate::keychain::Keychain;
use crate::range_reader::RemoteFetcher;
use crate::reference::Reference;
use crate::RemoteError;

/// Deadline on each resolve-time probe.
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Resolver {
    /// Runtime driving all transport I/O; owned here so teardown follows
    /// the orchestrator instead of a process-global.
    runtime: Arc<Runtime>,
    keychain: Keychain,
    insecure_hosts: Vec<Regex>,
    transports: Mutex<HashMap<String, Arc<Transport>>>,
}

impl Resolver {
    pub fn new(insecure_hosts: &[String]) -> Result<Self, Error> {
        Self::with_keychain(insecure_hosts, Keychain::load())
    }

    pub fn with_keychain(insecure_hosts: &[String], keychain: Keychain) -> Result<Self, Error> {
        let insecure_hosts = insecure_hosts
            .iter()
            .map(|pattern| {
                Regex::new(pattern).with_context(|| format!("bad insecure host pattern {:?}", pattern))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("stargz-remote")
            .enable_all()
            .build()
            .context("starting transport runtime")?;
        Ok(Self {
            runtime: Arc::new(runtime),
            keychain,
            insecure_hosts,
            transports: Mutex::new(HashMap::new()),
        })
    }

    fn is_insecure(&self, host: &str) -> bool {
        self.insecure_hosts.iter().any(|re| re.is_match(host))
    }

    /// Resolve a blob of `reference` into a transport ready for ranged GETs.
    pub fn resolve(
        &self,
        reference: &Reference,
        digest: &str,
    ) -> Result<Arc<Transport>, RemoteError> {
        let key = format!("{}@{}", reference.canonical(), digest);
        if let Some(transport) = self.transports.lock().unwrap().get(&key) {
            return Ok(Arc::clone(transport));
        }

        let insecure = self.is_insecure(&reference.host);
        let scheme = if insecure { "http" } else { "https" };
        let client = build_client(insecure).map_err(RemoteError::net)?;
        let credentials = self.keychain.resolve(&reference.host);

        let transport = Arc::new(Transport {
            runtime: Arc::clone(&self.runtime),
            client,
            scheme,
            reference: reference.clone(),
            digest: digest.to_string(),
            credentials,
            state: Mutex::new(TransportState {
                token: None,
                url: String::new(),
            }),
        });
        if let Err(first) = transport.do_resolve() {
            // a transient transport failure earns one rebuild attempt; the
            // later error is returned, the earlier one logged
            log::warn!("resolving {} failed, retrying once: {}", key, first);
            transport.do_resolve()?;
        }

        self.transports
            .lock()
            .unwrap()
            .insert(key, Arc::clone(&transport));
        Ok(transport)
    }
}

struct TransportState {
    token: Option<String>,
    /// Blob URL after redirect resolution.
    url: String,
}

/// An authenticated route to one blob.
pub struct Transport {
    runtime: Arc<Runtime>,
    client: Client<HttpsConnector, Body>,
    scheme: &'static str,
    reference: Reference,
    digest: String,
    credentials: Option<(String, String)>,
    state: Mutex<TransportState>,
}

impl Transport {
    fn do_resolve(&self) -> Result<(), RemoteError> {
        let resolved = self.runtime.block_on(async {
            let token = fetch_token(
                &self.client,
                self.scheme,
                &self.reference,
                self.credentials.as_ref(),
            )
            .await?;
            let url = self.reference.blob_url(self.scheme, &self.digest);
            let url = check_and_redirect(&self.client, &url, token.as_deref()).await?;
            Ok::<_, RemoteError>((token, url))
        })?;
        let mut state = self.state.lock().unwrap();
        state.token = resolved.0;
        state.url = resolved.1;
        Ok(())
    }

    fn snapshot(&self) -> (Option<String>, String) {
        let state = self.state.lock().unwrap();
        (state.token.clone(), state.url.clone())
    }

    fn ranged_get(&self, url: &str, token: Option<&str>, range: String) -> Result<hyper::Response<Body>, RemoteError> {
        let mut builder = Request::get(url).header(hyper::header::RANGE, range);
        if let Some(token) = token {
            builder = builder.header(hyper::header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let request = builder.body(Body::empty()).map_err(RemoteError::net)?;
        self.runtime
            .block_on(self.client.request(request))
            .map_err(RemoteError::net)
    }
}

impl RemoteFetcher for Transport {
    fn fetch_range(&self, start: u64, len: u64) -> Result<Vec<u8>, RemoteError> {
        let (token, url) = self.snapshot();
        let range = format!("bytes={}-{}", start, start + len - 1);
        let response = self.ranged_get(&url, token.as_deref(), range)?;
        let status = response.status().as_u16();
        if status >= 400 {
            return Err(RemoteError::Status(status));
        }
        let body = self
            .runtime
            .block_on(hyper::body::to_bytes(response.into_body()))
            .map_err(RemoteError::net)?;
        if body.len() != len as usize {
            return Err(RemoteError::Range {
                expected: len as usize,
                got: body.len(),
            });
        }
        Ok(body.to_vec())
    }

    fn check_reachable(&self) -> Result<(), RemoteError> {
        let (token, url) = self.snapshot();
        let response = self
            .runtime
            .block_on(async {
                let mut builder =
                    Request::get(url.as_str()).header(hyper::header::RANGE, "bytes=0-0");
                if let Some(ref token) = token {
                    builder = builder
                        .header(hyper::header::AUTHORIZATION, format!("Bearer {}", token));
                }
                let request = builder.body(Body::empty()).map_err(RemoteError::net)?;
                tokio::time::timeout(RESOLVE_TIMEOUT, self.client.request(request))
                    .await
                    .map_err(|_| RemoteError::Net("liveness probe deadline exceeded".into()))?
                    .map_err(RemoteError::net)
            })?;
        let status = response.status().as_u16();
        if status >= 400 {
            return Err(RemoteError::Status(status));
        }
        Ok(())
    }

    fn refresh(&self) -> Result<(), RemoteError> {
        self.do_resolve()
    }

    fn id(&self) -> String {
        // the pre-redirect URL: stable across refreshes, so cache entries
        // survive re-resolution
        self.reference.blob_url(self.scheme, &self.digest)
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: String,
    #[serde(default)]
    access_token: String,
}

async fn fetch_token(
    client: &Client<HttpsConnector, Body>,
    scheme: &str,
    reference: &Reference,
    credentials: Option<&(String, String)>,
) -> Result<Option<String>, RemoteError> {
    let probe = Request::get(reference.v2_url(scheme))
        .body(Body::empty())
        .map_err(RemoteError::net)?;
    let response = tokio::time::timeout(RESOLVE_TIMEOUT, client.request(probe))
        .await
        .map_err(|_| RemoteError::Net("registry probe deadline exceeded".into()))?
        .map_err(RemoteError::net)?;

    match response.status().as_u16() {
        200 => Ok(None),
        401 => {
            let challenge = response
                .headers()
                .get(hyper::header::WWW_AUTHENTICATE)
                .and_then(|value| value.to_str().ok())
                .ok_or_else(|| RemoteError::Auth("registry sent no auth challenge".into()))?;
            let params = parse_bearer_challenge(challenge)
                .ok_or_else(|| RemoteError::Auth(format!("unsupported challenge {:?}", challenge)))?;
            let realm = params
                .get("realm")
                .ok_or_else(|| RemoteError::Auth("challenge carries no realm".into()))?;

            let mut token_url = url::Url::parse(realm)
                .map_err(|err| RemoteError::Auth(format!("bad realm {:?}: {}", realm, err)))?;
            {
                let mut query = token_url.query_pairs_mut();
                if let Some(service) = params.get("service") {
                    query.append_pair("service", service);
                }
                query.append_pair("scope", &format!("repository:{}:pull", reference.repository));
            }

            let mut builder = Request::get(token_url.as_str());
            if let Some((user, password)) = credentials {
                builder = builder.header(
                    hyper::header::AUTHORIZATION,
                    format!("Basic {}", base64::encode(format!("{}:{}", user, password))),
                );
            }
            let request = builder.body(Body::empty()).map_err(RemoteError::net)?;
            let response = tokio::time::timeout(RESOLVE_TIMEOUT, client.request(request))
                .await
                .map_err(|_| RemoteError::Net("token request deadline exceeded".into()))?
                .map_err(RemoteError::net)?;
            let status = response.status().as_u16();
            if status >= 400 {
                return Err(RemoteError::Auth(format!(
                    "token endpoint answered {}",
                    status
                )));
            }
            let body = hyper::body::to_bytes(response.into_body())
                .await
                .map_err(RemoteError::net)?;
            let token: TokenResponse = serde_json::from_slice(&body)
                .map_err(|err| RemoteError::Auth(format!("unreadable token response: {}", err)))?;
            let token = if !token.token.is_empty() {
                token.token
            } else if !token.access_token.is_empty() {
                token.access_token
            } else {
                return Err(RemoteError::Auth("token endpoint issued no token".into()));
            };
            Ok(Some(token))
        }
        status => Err(RemoteError::Status(status)),
    }
}

/// Probe the blob URL with a two-byte range and follow a single redirect.
/// Returns the URL that actually serves the blob.
async fn check_and_redirect(
    client: &Client<HttpsConnector, Body>,
    url: &str,
    token: Option<&str>,
) -> Result<String, RemoteError> {
    let response = probe_range(client, url, token).await?;
    let status = response.status();

    if status.is_redirection() {
        let location = response
            .headers()
            .get(hyper::header::LOCATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| RemoteError::Net("redirect carried no location".into()))?;
        let base = url::Url::parse(url).map_err(RemoteError::net)?;
        let next = base.join(location).map_err(RemoteError::net)?;

        // signed redirect targets on other hosts reject registry auth
        let same_host = next.host_str() == base.host_str();
        let response = probe_range(client, next.as_str(), token.filter(|_| same_host)).await?;
        let status = response.status().as_u16();
        if status >= 400 {
            return Err(RemoteError::Status(status));
        }
        return Ok(next.to_string());
    }

    if status.as_u16() >= 400 {
        return Err(RemoteError::Status(status.as_u16()));
    }
    Ok(url.to_string())
}

async fn probe_range(
    client: &Client<HttpsConnector, Body>,
    url: &str,
    token: Option<&str>,
) -> Result<hyper::Response<Body>, RemoteError> {
    let mut builder = Request::get(url).header(hyper::header::RANGE, "bytes=0-1");
    if let Some(token) = token {
        builder = builder.header(hyper::header::AUTHORIZATION, format!("Bearer {}", token));
    }
    let request = builder.body(Body::empty()).map_err(RemoteError::net)?;
    tokio::time::timeout(RESOLVE_TIMEOUT, client.request(request))
        .await
        .map_err(|_| RemoteError::Net("blob probe deadline exceeded".into()))?
        .map_err(RemoteError::net)
}

fn parse_bearer_challenge(header: &str) -> Option<HashMap<String, String>> {
    let rest = header.strip_prefix("Bearer ")?;
    let mut out = HashMap::new();
    for part in rest.split(',') {
        let (key, value) = part.trim().split_once('=')?;
        out.insert(key.to_string(), value.trim_matches('"').to_string());
    }
    Some(out)
}
