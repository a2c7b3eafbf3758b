use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{ACCEPT, USER_AGENT, WWW_AUTHENTICATE};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

use super::glob::{Glob, has_wildcard};
use super::{
    ImageListing, ListQuery, RegistryCatalog, RegistryContext, expanded_mask, split_mask,
};
use crate::error::RegistryError;

const CLIENT_AGENT: &str = "Docker-Client (linux)";
const DIGEST_HEADER: &str = "Docker-Content-Digest";
const MANIFEST_TYPES: &str = "application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.oci.image.manifest.v1+json, \
     application/vnd.oci.image.index.v1+json";

static CHALLENGE_PARAM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(\w+)="([^"]*)""#).expect("challenge pattern compiles"));

#[derive(Deserialize)]
struct Catalog {
    #[serde(default)]
    repositories: Vec<String>,
}

#[derive(Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// Docker Registry HTTP API v2 client.
#[derive(Clone, Debug)]
pub struct RegistryClient {
    http: reqwest::Client,
}

impl RegistryClient {
    pub fn new(timeout: Duration) -> Result<Self, RegistryError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RegistryError::Request {
                route: "client".to_string(),
                message: e.to_string(),
            })?;
        Ok(Self { http })
    }

    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }

    fn request(&self, ctx: &RegistryContext, route: &str) -> RequestBuilder {
        let mut builder = self.http.get(route).header(USER_AGENT, CLIENT_AGENT);
        if let Some(creds) = ctx.credentials.as_ref() {
            builder = builder.basic_auth(&creds.user, Some(&creds.pass));
        }
        builder
    }

    /// GET `route`, answering a Bearer challenge once.
    async fn get(
        &self,
        ctx: &RegistryContext,
        route: &str,
        accept: Option<&str>,
    ) -> Result<Response, RegistryError> {
        let with_accept = |builder: RequestBuilder| match accept {
            Some(accept) => builder.header(ACCEPT, accept),
            None => builder,
        };

        let response = with_accept(self.request(ctx, route))
            .send()
            .await
            .map_err(|e| request_error(route, e))?;

        let response = if response.status() == StatusCode::UNAUTHORIZED {
            let challenge = response
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            match challenge {
                Some(challenge) if challenge.starts_with("Bearer") => {
                    let token = self.fetch_token(ctx, &challenge).await?;
                    with_accept(self.http.get(route).header(USER_AGENT, CLIENT_AGENT))
                        .bearer_auth(token)
                        .send()
                        .await
                        .map_err(|e| request_error(route, e))?
                }
                _ => response,
            }
        } else {
            response
        };

        check_status(route, response)
    }

    async fn fetch_token(&self, ctx: &RegistryContext, challenge: &str) -> Result<String, RegistryError> {
        let mut realm = None;
        let mut query = Vec::new();
        for caps in CHALLENGE_PARAM.captures_iter(challenge) {
            match &caps[1] {
                "realm" => realm = Some(caps[2].to_string()),
                key @ ("service" | "scope") => query.push((key.to_string(), caps[2].to_string())),
                _ => {}
            }
        }
        let realm = realm.ok_or_else(|| RegistryError::Request {
            route: ctx.api_base(),
            message: format!("token challenge without realm: {challenge}"),
        })?;

        debug!(realm = %realm, "requesting registry token");
        let response = self
            .request(ctx, &realm)
            .query(&query)
            .send()
            .await
            .map_err(|e| request_error(&realm, e))?;
        let body: TokenResponse = check_status(&realm, response)?
            .json()
            .await
            .map_err(|e| request_error(&realm, e))?;

        body.token
            .or(body.access_token)
            .ok_or_else(|| RegistryError::Request {
                route: realm,
                message: "token response without token".to_string(),
            })
    }

    async fn catalog(&self, ctx: &RegistryContext) -> Result<Vec<String>, RegistryError> {
        let route = format!("{}/v2/_catalog", ctx.api_base());
        let catalog: Catalog = self
            .get(ctx, &route, None)
            .await?
            .json()
            .await
            .map_err(|e| request_error(&route, e))?;
        Ok(catalog.repositories)
    }

    async fn tags(&self, ctx: &RegistryContext, name: &str) -> Result<Vec<String>, RegistryError> {
        let route = format!("{}/v2/{}/tags/list", ctx.api_base(), name);
        let list: TagList = self
            .get(ctx, &route, None)
            .await?
            .json()
            .await
            .map_err(|e| request_error(&route, e))?;
        Ok(list.tags.unwrap_or_default())
    }

    /// Content digest of `name:tag`, `None` when the registry does not
    /// report one.
    pub async fn digest(&self, ctx: &RegistryContext, name: &str, tag: &str) -> Option<String> {
        let route = format!("{}/v2/{}/manifests/{}", ctx.api_base(), name, tag);
        match self.get(ctx, &route, Some(MANIFEST_TYPES)).await {
            Ok(response) => response
                .headers()
                .get(DIGEST_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            Err(err) => {
                warn!(image = %format!("{name}:{tag}"), error = %err, "unable to read image digest");
                None
            }
        }
    }
}

#[async_trait]
impl RegistryCatalog for RegistryClient {
    async fn list_images(
        &self,
        ctx: &RegistryContext,
        query: ListQuery,
    ) -> Result<ImageListing, RegistryError> {
        let mask = if query.expand_mask {
            expanded_mask(&ctx.image_mask)
        } else {
            ctx.image_mask.clone()
        };
        let (name_mask, tag_mask) = split_mask(&mask);
        let prefix_len = if query.expand_mask {
            mask.len() - "*:*".len()
        } else {
            0
        };

        let names = if has_wildcard(name_mask) {
            let glob = Glob::new(name_mask).map_err(|e| RegistryError::BadUrl(e.to_string()))?;
            glob.filter(&self.catalog(ctx).await?)
        } else {
            vec![name_mask.to_string()]
        };

        let mut listing = ImageListing::default();
        let mut resolved: Vec<(String, String)> = Vec::new();
        if has_wildcard(tag_mask) {
            let glob = Glob::new(tag_mask).map_err(|e| RegistryError::BadUrl(e.to_string()))?;
            for name in &names {
                match self.tags(ctx, name).await {
                    Ok(tags) => resolved.extend(glob.filter(&tags).into_iter().map(|t| (name.clone(), t))),
                    Err(err) => listing.errors.push(err),
                }
            }
        } else {
            resolved.extend(names.iter().map(|n| (n.clone(), tag_mask.to_string())));
        }

        for (name, tag) in resolved {
            let digest = if query.digests {
                self.digest(ctx, &name, &tag).await
            } else {
                None
            };
            let reported = name.get(prefix_len..).unwrap_or(&name);
            listing.images.insert(format!("{reported}:{tag}"), digest);
        }

        debug!(
            registry = %ctx.repository,
            mask = %mask,
            images = listing.images.len(),
            errors = listing.errors.len(),
            "resolved registry images"
        );
        Ok(listing)
    }
}

fn request_error(route: &str, err: reqwest::Error) -> RegistryError {
    RegistryError::Request {
        route: route.to_string(),
        message: err.to_string(),
    }
}

fn check_status(route: &str, response: Response) -> Result<Response, RegistryError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    Err(RegistryError::Status {
        route: route.to_string(),
        status: status.as_u16(),
        reason: status.canonical_reason().unwrap_or("unknown").to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::KnownRegistries;
    use axum::Router;
    use axum::http::{HeaderMap, StatusCode as AxumStatus, Uri};
    use axum::response::{IntoResponse, Response as AxumResponse};
    use serde_json::json;

    /// Registry that hands out a bearer token and requires it everywhere
    /// else.
    async fn registry(uri: Uri, headers: HeaderMap) -> AxumResponse {
        let authorized = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == "Bearer t0k3n");
        let host = headers
            .get("host")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        match uri.path() {
            "/token" => axum::Json(json!({"token": "t0k3n"})).into_response(),
            _ if !authorized => (
                AxumStatus::UNAUTHORIZED,
                [(
                    "www-authenticate",
                    format!(
                        "Bearer realm=\"http://{host}/token\",service=\"registry\",scope=\"registry:catalog:*\""
                    ),
                )],
            )
                .into_response(),
            "/v2/_catalog" => axum::Json(json!({
                "repositories": ["clean/app", "clean/db", "team/app", "team/web"]
            }))
            .into_response(),
            "/v2/team/app/tags/list" => {
                axum::Json(json!({"name": "team/app", "tags": ["1.0", "1.1", "2.0"]})).into_response()
            }
            "/v2/team/web/tags/list" => AxumStatus::NOT_FOUND.into_response(),
            "/v2/clean/app/tags/list" => axum::Json(json!({"tags": ["1.0"]})).into_response(),
            "/v2/clean/db/tags/list" => axum::Json(json!({"tags": null})).into_response(),
            "/v2/clean/app/manifests/1.0" => {
                ([(DIGEST_HEADER, "sha256:abc")], "{}").into_response()
            }
            _ => AxumStatus::NOT_FOUND.into_response(),
        }
    }

    async fn serve() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, Router::new().fallback(registry)).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn client() -> RegistryClient {
        RegistryClient::new(Duration::from_secs(5)).unwrap()
    }

    fn context(base: &str, mask: &str) -> RegistryContext {
        RegistryContext::parse(&format!("{base}/{mask}"), &KnownRegistries::new()).unwrap()
    }

    #[test]
    fn challenge_scope_may_contain_commas() {
        let params: Vec<(String, String)> = CHALLENGE_PARAM
            .captures_iter(
                r#"Bearer realm="https://auth.local/token",service="reg",scope="repository:a/b:pull,push""#,
            )
            .map(|c| (c[1].to_string(), c[2].to_string()))
            .collect();
        assert_eq!(
            params[2],
            ("scope".to_string(), "repository:a/b:pull,push".to_string())
        );
    }

    #[tokio::test]
    async fn wildcards_expand_through_catalog_and_tags() {
        let base = serve().await;
        let ctx = context(&base, "team/*:1.*");
        let listing = client().list_images(&ctx, ListQuery::default()).await.unwrap();

        assert_eq!(
            listing.images.keys().collect::<Vec<_>>(),
            vec!["team/app:1.0", "team/app:1.1"]
        );
        assert_eq!(listing.errors.len(), 1);
        assert_eq!(listing.errors[0].code(), 404);
    }

    #[tokio::test]
    async fn destination_listing_is_relative_with_digests() {
        let base = serve().await;
        let ctx = context(&base, "clean");
        let listing = client()
            .list_images(
                &ctx,
                ListQuery {
                    digests: true,
                    expand_mask: true,
                },
            )
            .await
            .unwrap();

        assert_eq!(listing.images.keys().collect::<Vec<_>>(), vec!["app:1.0"]);
        assert_eq!(
            listing.images.get("app:1.0"),
            Some(&Some("sha256:abc".to_string()))
        );
    }

    #[tokio::test]
    async fn literal_mask_needs_no_request() {
        let ctx = context("http://127.0.0.1:9", "team/app:1.0");
        let listing = client().list_images(&ctx, ListQuery::default()).await.unwrap();
        assert_eq!(listing.images.keys().collect::<Vec<_>>(), vec!["team/app:1.0"]);
        assert_eq!(listing.images.get("team/app:1.0"), Some(&None));
    }

    #[tokio::test]
    async fn unreachable_catalog_fails_the_listing() {
        let ctx = context("http://127.0.0.1:9", "team/*");
        let err = client().list_images(&ctx, ListQuery::default()).await.unwrap_err();
        assert_eq!(err.code(), 500);
    }
}
