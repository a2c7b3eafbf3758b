use std::collections::HashMap;
use std::fmt;

use url::Url;

use crate::error::RegistryError;

/// Registry login. `Debug` never prints the values.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub pass: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, pass: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            pass: pass.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &"**********")
            .field("pass", &"**********")
            .finish()
    }
}

/// Credentials configured per registry, keyed by `scheme://host[:port]`.
pub type KnownRegistries = HashMap<String, Credentials>;

/// A parsed `scheme://[user:pass@]host[:port]/<image mask>` reference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistryContext {
    pub scheme: String,
    /// `host[:port]`
    pub repository: String,
    pub credentials: Option<Credentials>,
    /// Path part without the leading `/`, e.g. `team/*:1.*`.
    pub image_mask: String,
}

impl RegistryContext {
    /// Parses `url`. Credentials absent from the URL are looked up in `known`.
    pub fn parse(url: &str, known: &KnownRegistries) -> Result<Self, RegistryError> {
        let parsed = Url::parse(url).map_err(|e| RegistryError::BadUrl(format!("{url}: {e}")))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| RegistryError::BadUrl(format!("{url}: bad registry hostname")))?;

        let repository = match parsed.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        let scheme = parsed.scheme().to_string();

        let mut image_mask = parsed.path().trim_start_matches('/').to_string();
        if let Some(query) = parsed.query() {
            // `?` is a glob wildcard in image masks, not a query separator.
            image_mask = format!("{image_mask}?{query}");
        }

        let credentials = match (parsed.username(), parsed.password()) {
            (user, Some(pass)) if !user.is_empty() && !pass.is_empty() => Some(Credentials::new(
                percent_decode(user),
                percent_decode(pass),
            )),
            _ => known.get(&format!("{scheme}://{repository}")).cloned(),
        };

        Ok(Self {
            scheme,
            repository,
            credentials,
            image_mask,
        })
    }

    pub fn tls(&self) -> bool {
        self.scheme == "https"
    }

    /// Base URL of the registry HTTP API.
    pub fn api_base(&self) -> String {
        format!("{}://{}", self.scheme, self.repository)
    }

    /// Fully qualified local reference of a source image.
    pub fn source_reference(&self, image: &str) -> String {
        format!("{}/{}", self.repository, image).replace("//", "/")
    }

    /// Where a clean image is pushed to under this destination.
    pub fn destination_reference(&self, image: &str) -> String {
        format!("{}/{}/{}", self.repository, self.image_mask, image).replace("//", "/")
    }
}

/// URL userinfo stays percent-encoded after parsing.
fn percent_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%'
            && let Some(byte) = raw
                .get(i + 1..i + 3)
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
        {
            out.push(byte);
            i += 3;
            continue;
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
