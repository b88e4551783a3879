use std::collections::HashSet;
use std::future::Future;
use std::sync::RwLock;
use std::time::Duration;

use reqwest::{Client, Method, Response, StatusCode, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::config::{AuthMethod, CloudConfig, Domain, Project};
use crate::error::{Result, VmError};
use crate::traits::ComputeApi;
use crate::types::{Flavor, Image, Keypair, Server, ServerAction, ServerCreate, ServerQuery};

const TOKEN_HEADER: &str = "X-Subject-Token";
const AUTH_TOKEN_HEADER: &str = "X-Auth-Token";

/// Authenticated session against a Keystone v3 cloud, bound to its Nova endpoint.
///
/// A request rejected with 401 re-authenticates once and is retried.
#[derive(Debug)]
pub struct OpenStackSession {
    client: Client,
    config: CloudConfig,
    token: RwLock<String>,
    compute: Url,
}

#[derive(Debug, Deserialize)]
struct TokenBody {
    token: Token,
}

#[derive(Debug, Deserialize)]
struct Token {
    #[serde(default)]
    catalog: Vec<CatalogEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct CatalogEntry {
    #[serde(rename = "type")]
    service_type: String,
    #[serde(default)]
    endpoints: Vec<CatalogEndpoint>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct CatalogEndpoint {
    interface: String,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    region_id: Option<String>,
    url: String,
}

#[derive(Debug, Deserialize)]
struct Link {
    href: String,
    #[serde(default)]
    rel: String,
}

/// One page of a collection listing.
struct Page<T> {
    items: Vec<T>,
    next: Option<Url>,
}

/// Response bodies of collection listings, which carry `<collection>_links`.
trait Listing: DeserializeOwned {
    type Item;

    fn into_parts(self) -> (Vec<Self::Item>, Vec<Link>);
}

#[derive(Deserialize)]
struct ServersBody {
    servers: Vec<Server>,
    #[serde(default)]
    servers_links: Vec<Link>,
}

impl Listing for ServersBody {
    type Item = Server;

    fn into_parts(self) -> (Vec<Server>, Vec<Link>) {
        (self.servers, self.servers_links)
    }
}

#[derive(Deserialize)]
struct ServerBody {
    server: Server,
}

#[derive(Deserialize)]
struct CreatedServerBody {
    server: CreatedServer,
}

#[derive(Deserialize)]
struct CreatedServer {
    id: String,
}

#[derive(Deserialize)]
struct FlavorsBody {
    flavors: Vec<Flavor>,
    #[serde(default)]
    flavors_links: Vec<Link>,
}

impl Listing for FlavorsBody {
    type Item = Flavor;

    fn into_parts(self) -> (Vec<Flavor>, Vec<Link>) {
        (self.flavors, self.flavors_links)
    }
}

#[derive(Deserialize)]
struct ImagesBody {
    images: Vec<Image>,
    #[serde(default)]
    images_links: Vec<Link>,
}

impl Listing for ImagesBody {
    type Item = Image;

    fn into_parts(self) -> (Vec<Image>, Vec<Link>) {
        (self.images, self.images_links)
    }
}

#[derive(Deserialize)]
struct KeypairBody {
    keypair: Keypair,
}

/// Keystone token endpoint for an `auth_url` as written in `clouds.yaml`.
fn token_url(auth_url: &str) -> String {
    let base = auth_url.trim_end_matches('/');
    let base = base.strip_suffix("/v2.0").unwrap_or(base);
    if base.ends_with("/v3") {
        format!("{base}/auth/tokens")
    } else {
        format!("{base}/v3/auth/tokens")
    }
}

fn domain_json(domain: &Domain) -> Value {
    match domain {
        Domain::Id(id) => json!({ "id": id }),
        Domain::Name(name) => json!({ "name": name }),
    }
}

fn auth_body(method: &AuthMethod) -> Value {
    match method {
        AuthMethod::Password {
            username,
            password,
            user_domain,
            project,
        } => {
            let project = match project {
                Project::Id(id) => json!({ "id": id }),
                Project::Name { name, domain } => {
                    json!({ "name": name, "domain": domain_json(domain) })
                }
            };
            json!({
                "auth": {
                    "identity": {
                        "methods": ["password"],
                        "password": {
                            "user": {
                                "name": username,
                                "domain": domain_json(user_domain),
                                "password": password,
                            }
                        }
                    },
                    "scope": { "project": project }
                }
            })
        }
        AuthMethod::ApplicationCredential { id, secret } => json!({
            "auth": {
                "identity": {
                    "methods": ["application_credential"],
                    "application_credential": { "id": id, "secret": secret }
                }
            }
        }),
    }
}

/// Pick a service endpoint from a Keystone catalog.
pub(crate) fn select_endpoint(
    catalog: &[CatalogEntry],
    service_type: &str,
    interface: &str,
    region: Option<&str>,
) -> Result<String> {
    catalog
        .iter()
        .filter(|entry| entry.service_type == service_type)
        .flat_map(|entry| entry.endpoints.iter())
        .find(|ep| {
            ep.interface == interface
                && region.is_none_or(|r| {
                    ep.region.as_deref() == Some(r) || ep.region_id.as_deref() == Some(r)
                })
        })
        .map(|ep| ep.url.trim_end_matches('/').to_string())
        .ok_or_else(|| VmError::EndpointNotFound {
            service: service_type.to_string(),
            interface: interface.to_string(),
            region: region.unwrap_or("any").to_string(),
        })
}

/// The `next` link of a listing, resolved against `base`.
fn next_link(base: &Url, links: &[Link]) -> Option<Url> {
    let link = links.iter().find(|l| l.rel == "next")?;
    match base.join(&link.href) {
        Ok(url) => Some(url),
        Err(e) => {
            warn!(href = %link.href, error = %e, "ignoring unparseable next link");
            None
        }
    }
}

/// Fetch `first` and every page its `next` links lead to, in order.
async fn collect_pages<T, F, Fut>(first: Url, mut fetch: F) -> Result<Vec<T>>
where
    F: FnMut(Url) -> Fut,
    Fut: Future<Output = Result<Page<T>>>,
{
    let mut items = Vec::new();
    let mut seen = HashSet::new();
    let mut next = Some(first);
    while let Some(url) = next.take() {
        if !seen.insert(url.to_string()) {
            warn!(url = %url, "listing links back to a page already read");
            break;
        }
        let page = fetch(url).await?;
        items.extend(page.items);
        next = page.next;
    }
    Ok(items)
}

/// Request a token and pick the compute endpoint from its catalog.
async fn authenticate(client: &Client, config: &CloudConfig) -> Result<(String, Url)> {
    let url = token_url(&config.auth_url);
    let auth_failed = |detail: String| VmError::Authentication {
        auth_url: url.clone(),
        detail,
    };

    info!(cloud = %config.name, auth_url = %url, "authenticating");
    let resp = client
        .post(&url)
        .json(&auth_body(&config.method))
        .send()
        .await
        .map_err(|e| auth_failed(e.to_string()))?;

    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        return Err(auth_failed(format!("status {status}: {text}")));
    }

    let token = resp
        .headers()
        .get(TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| auth_failed(format!("response carried no {TOKEN_HEADER} header")))?;

    let body: TokenBody = resp
        .json()
        .await
        .map_err(|e| auth_failed(format!("unreadable token body: {e}")))?;

    let endpoint = select_endpoint(
        &body.token.catalog,
        "compute",
        &config.interface,
        config.region.as_deref(),
    )?;
    let compute = Url::parse(&endpoint)
        .map_err(|e| auth_failed(format!("invalid compute endpoint '{endpoint}': {e}")))?;
    Ok((token, compute))
}

impl OpenStackSession {
    /// Authenticate against Keystone and bind to the compute endpoint of the catalog.
    pub async fn connect(config: &CloudConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()?;

        let (token, compute) = authenticate(&client, config).await?;
        info!(cloud = %config.name, compute = %compute, "session established");
        Ok(Self {
            client,
            config: config.clone(),
            token: RwLock::new(token),
            compute,
        })
    }

    pub fn cloud(&self) -> &str {
        &self.config.name
    }

    fn token(&self) -> String {
        self.token
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    async fn reauthenticate(&self) -> Result<()> {
        let (token, _) = authenticate(&self.client, &self.config).await?;
        *self.token.write().unwrap_or_else(|e| e.into_inner()) = token;
        Ok(())
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.compute.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn request(
        &self,
        method: Method,
        url: Url,
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> Result<Response> {
        let resp = self.send(method.clone(), url.clone(), query, body).await?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }
        info!(cloud = %self.config.name, "token rejected; re-authenticating");
        self.reauthenticate().await?;
        self.send(method, url, query, body).await
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> Result<Response> {
        debug!(method = %method, url = %url, "compute request");
        let mut req = self
            .client
            .request(method, url)
            .header(AUTH_TOKEN_HEADER, self.token())
            .query(query);
        if let Some(body) = body {
            req = req.json(body);
        }
        Ok(req.send().await?)
    }

    /// Turn a non-success response into an `Api` error.
    async fn check(resp: Response, method: &'static str) -> Result<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let url = resp.url().to_string();
        let detail = resp.text().await.unwrap_or_default();
        Err(VmError::Api {
            method,
            url,
            status: status.as_u16(),
            detail,
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url, query: &[(&str, &str)]) -> Result<T> {
        let resp = self.request(Method::GET, url, query, None).await?;
        Ok(Self::check(resp, "GET").await?.json().await?)
    }

    /// Every item of a collection, following `next` links across pages.
    async fn list_all<L: Listing>(
        &self,
        mut first: Url,
        query: &[(&str, &str)],
    ) -> Result<Vec<L::Item>> {
        if !query.is_empty() {
            first.query_pairs_mut().extend_pairs(query);
        }
        collect_pages(first, |url| async move {
            let body: L = self.get_json(url, &[]).await?;
            let (items, links) = body.into_parts();
            Ok(Page {
                items,
                next: next_link(&self.compute, &links),
            })
        })
        .await
    }
}

impl ComputeApi for OpenStackSession {
    async fn list_servers(&self, query: &ServerQuery) -> Result<Vec<Server>> {
        let url = if query.detailed {
            self.endpoint(&["servers", "detail"])
        } else {
            self.endpoint(&["servers"])
        };
        let params: Vec<(&str, &str)> = query.name.iter().map(|n| ("name", n.as_str())).collect();
        self.list_all::<ServersBody>(url, &params).await
    }

    async fn get_server(&self, id: &str) -> Result<Server> {
        let resp = self
            .request(Method::GET, self.endpoint(&["servers", id]), &[], None)
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(VmError::NotFound {
                kind: "server",
                name: id.to_string(),
            });
        }
        let body: ServerBody = Self::check(resp, "GET").await?.json().await?;
        Ok(body.server)
    }

    async fn create_server(&self, request: &ServerCreate) -> Result<Server> {
        let body = json!({ "server": request });
        let resp = self
            .request(Method::POST, self.endpoint(&["servers"]), &[], Some(&body))
            .await?;
        let created: CreatedServerBody = Self::check(resp, "POST").await?.json().await?;
        info!(id = %created.server.id, name = %request.name, "server submitted");
        Ok(Server {
            id: created.server.id,
            name: request.name.clone(),
            status: Default::default(),
            addresses: Default::default(),
        })
    }

    async fn delete_server(&self, id: &str) -> Result<()> {
        let resp = self
            .request(Method::DELETE, self.endpoint(&["servers", id]), &[], None)
            .await?;
        Self::check(resp, "DELETE").await?;
        Ok(())
    }

    async fn server_action(&self, id: &str, action: ServerAction) -> Result<()> {
        let body = action.body();
        let resp = self
            .request(
                Method::POST,
                self.endpoint(&["servers", id, "action"]),
                &[],
                Some(&body),
            )
            .await?;
        Self::check(resp, "POST").await?;
        Ok(())
    }

    async fn find_flavor(&self, name: &str) -> Result<Option<Flavor>> {
        let flavors = self
            .list_all::<FlavorsBody>(self.endpoint(&["flavors", "detail"]), &[])
            .await?;
        Ok(flavors.into_iter().find(|f| f.name == name || f.id == name))
    }

    async fn find_image(&self, name: &str) -> Result<Option<Image>> {
        let images = self
            .list_all::<ImagesBody>(self.endpoint(&["images", "detail"]), &[("name", name)])
            .await?;
        Ok(images.into_iter().find(|i| i.name == name || i.id == name))
    }

    async fn find_keypair(&self, name: &str) -> Result<Option<Keypair>> {
        let resp = self
            .request(Method::GET, self.endpoint(&["os-keypairs", name]), &[], None)
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: KeypairBody = Self::check(resp, "GET").await?.json().await?;
        Ok(Some(body.keypair))
    }

    async fn create_keypair(&self, name: &str) -> Result<Keypair> {
        let body = json!({ "keypair": { "name": name } });
        let resp = self
            .request(Method::POST, self.endpoint(&["os-keypairs"]), &[], Some(&body))
            .await?;
        let body: KeypairBody = Self::check(resp, "POST").await?.json().await?;
        Ok(body.keypair)
    }
}
