// src/publish/datagouv.rs
// data.gouv.fr catalog API: dataset lookups and community resources.

use anyhow::{bail, Context, Result};
use futures::{pin_mut, TryStreamExt};
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::fetch::api::{get_json, paginate};

const API_KEY_HEADER: &str = "X-API-KEY";

#[derive(Clone, Debug, Deserialize)]
pub struct Resource {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub last_modified: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Dataset {
    #[serde(default)]
    resources: Vec<Resource>,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct IdRef {
    pub id: String,
}

/// Body of a remote community resource registration.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct CommunityResource {
    pub dataset: IdRef,
    pub description: String,
    pub filesize: u64,
    pub filetype: &'static str,
    pub format: String,
    pub organization: IdRef,
    pub title: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub url: String,
}

impl CommunityResource {
    pub fn remote(
        dataset_id: &str,
        organization_id: &str,
        title: &str,
        format: &str,
        url: &str,
        filesize: u64,
        description: &str,
    ) -> Self {
        Self {
            dataset: IdRef {
                id: dataset_id.to_string(),
            },
            description: description.to_string(),
            filesize,
            filetype: "remote",
            format: format.to_string(),
            organization: IdRef {
                id: organization_id.to_string(),
            },
            title: title.to_string(),
            kind: "main",
            url: url.to_string(),
        }
    }
}

/// Whether a registration created a new resource or updated an existing one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Registration {
    Created(String),
    Updated(String),
}

#[derive(Clone, Debug)]
pub struct DatagouvClient {
    http: Client,
    base: String,
    api_key: String,
}

impl DatagouvClient {
    pub fn new(http: Client, base: &str, api_key: &str) -> Self {
        Self {
            http,
            base: base.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    pub fn dataset_page_url(&self, dataset_id: &str) -> String {
        format!("{}/fr/datasets/{}", self.base, dataset_id)
    }

    /// Most recently modified resource of `dataset_id` whose title starts
    /// with `title_prefix`.
    #[instrument(level = "info", skip(self))]
    pub async fn latest_resource(&self, dataset_id: &str, title_prefix: &str) -> Result<Resource> {
        let url = format!("{}/api/1/datasets/{}/", self.base, dataset_id);
        let dataset: Dataset = get_json(&self.http, &url).await?;
        let found = dataset
            .resources
            .into_iter()
            .filter(|r| r.title.starts_with(title_prefix))
            .max_by(|a, b| a.last_modified.cmp(&b.last_modified));
        match found {
            Some(r) => {
                info!(resource = %r.id, title = %r.title, "latest resource");
                Ok(r)
            }
            None => bail!(
                "dataset {} has no resource titled `{}*`",
                dataset_id,
                title_prefix
            ),
        }
    }

    /// Community resource of `dataset_id` pointing at `url`. Walks the
    /// listing page by page and stops at the first match.
    async fn find_community_resource(&self, dataset_id: &str, url: &str) -> Result<Option<Resource>> {
        let first = format!(
            "{}/api/1/datasets/community_resources/?dataset={}&page_size=100",
            self.base, dataset_id
        );
        let listing = paginate::<Resource>(&self.http, &first);
        pin_mut!(listing);
        while let Some(r) = listing.try_next().await? {
            if r.url == url {
                return Ok(Some(r));
            }
        }
        Ok(None)
    }

    /// Register `resource` on its dataset, or update the community resource
    /// already pointing at the same URL.
    #[instrument(level = "info", skip(self, resource), fields(dataset = %resource.dataset.id, url = %resource.url))]
    pub async fn post_remote_community_resource(
        &self,
        resource: &CommunityResource,
    ) -> Result<Registration> {
        let existing = self
            .find_community_resource(&resource.dataset.id, &resource.url)
            .await?;

        let (method, url) = match &existing {
            Some(r) => (
                Method::PUT,
                format!("{}/api/1/datasets/community_resources/{}/", self.base, r.id),
            ),
            None => (
                Method::POST,
                format!("{}/api/1/datasets/community_resources/", self.base),
            ),
        };

        let resp = self
            .http
            .request(method.clone(), &url)
            .header(API_KEY_HEADER, &self.api_key)
            .json(resource)
            .send()
            .await
            .with_context(|| format!("{} {}", method, url))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("{} {} returned {}: {}", method, url, status, body);
        }
        let saved: Resource = resp
            .json()
            .await
            .with_context(|| format!("decoding community resource from {}", url))?;

        info!(resource = %saved.id, "community resource saved");
        Ok(match existing {
            Some(_) => Registration::Updated(saved.id),
            None => Registration::Created(saved.id),
        })
    }
}
