// src/pipelines/harvester.rs
// Weekly report on harvest sources awaiting validation.

use anyhow::Result;
use reqwest::Client;
use serde::Deserialize;
use std::{fmt::Write, time::Duration};
use tracing::{info, instrument, warn};

use crate::{
    dag::{DagDefinition, TaskRun, TaskSpec},
    fetch::api::fetch_numbered_pages,
    pipelines::Context,
};

pub const DAG_ID: &str = "dgv_harvester_notification";
pub const PAD_AWAITING_VALIDATION: &str = "https://pad.incubateur.net/173bEiKKTi2laBNyHwIPlQ";
pub const PREVIEW_TIMEOUT: Duration = Duration::from_secs(60);

const GET_PENDING: &str = "get_pending_harvester";
const GET_PREVIEW: &str = "get_preview_state";
const PUBLISH: &str = "publish_mattermost";

pub fn definition() -> DagDefinition {
    DagDefinition {
        dag_id: DAG_ID,
        schedule: "0 9 * * WED",
        timeout: Duration::from_secs(60 * 60),
        tags: vec!["weekly", "harvester", "mattermost", "notification"],
        email: vec!["geoffrey.aldebert@data.gouv.fr"],
        email_on_failure: true,
        catchup: false,
        tasks: vec![
            TaskSpec::new(GET_PENDING),
            TaskSpec::new(GET_PREVIEW).after(&[GET_PENDING]),
            TaskSpec::new(PUBLISH).after(&[GET_PREVIEW]),
        ],
    }
}

#[derive(Debug, Deserialize)]
pub struct Validation {
    pub state: String,
}

#[derive(Debug, Deserialize)]
pub struct Organization {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct Owner {
    pub id: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
}

/// Item of the harvest sources listing.
#[derive(Debug, Deserialize)]
pub struct HarvestSource {
    pub id: String,
    pub name: String,
    pub url: String,
    pub validation: Validation,
    #[serde(default)]
    pub organization: Option<Organization>,
    #[serde(default)]
    pub owner: Option<Owner>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingSource {
    pub id: String,
    pub name: String,
    pub url: String,
    pub admin_url: String,
    pub owner_label: String,
    pub owner_url: String,
}

impl PendingSource {
    /// Owner precedence: organization, then user, then unknown.
    pub fn from_source(base: &str, src: HarvestSource) -> Self {
        let (owner_label, owner_url) = match (&src.organization, &src.owner) {
            (Some(org), _) => (
                format!("Organisation {}", org.name),
                format!("{}/fr/organizations/{}", base, org.id),
            ),
            (None, Some(user)) => (
                format!("Utilisateur {} {}", user.first_name, user.last_name),
                format!("{}/fr/users/{}", base, user.id),
            ),
            (None, None) => ("Utilisateur inconnu".to_string(), String::new()),
        };
        Self {
            admin_url: format!("{}/fr/admin/harvester/{}", base, src.id),
            id: src.id,
            name: src.name,
            url: src.url,
            owner_label,
            owner_url,
        }
    }
}

/// Keep the sources whose validation is pending.
pub fn pending_sources(base: &str, sources: Vec<HarvestSource>) -> Vec<PendingSource> {
    sources
        .into_iter()
        .filter(|s| s.validation.state == "pending")
        .map(|s| PendingSource::from_source(base, s))
        .collect()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PreviewStatus {
    Done,
    Failed,
    Other(String),
}

impl PreviewStatus {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "done" => PreviewStatus::Done,
            "failed" => PreviewStatus::Failed,
            other => PreviewStatus::Other(other.to_string()),
        }
    }
}

/// Result of one preview call. Transport errors are kept as values.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PreviewOutcome {
    Status(PreviewStatus),
    TimedOut,
    Failed(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Bucket {
    Done,
    Timeout,
    Failed,
    Other,
}

impl PreviewOutcome {
    pub fn bucket(&self) -> Bucket {
        match self {
            PreviewOutcome::Status(PreviewStatus::Done) => Bucket::Done,
            PreviewOutcome::Status(PreviewStatus::Failed) => Bucket::Failed,
            PreviewOutcome::Status(PreviewStatus::Other(_)) => Bucket::Other,
            PreviewOutcome::TimedOut | PreviewOutcome::Failed(_) => Bucket::Timeout,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckedSource {
    pub source: PendingSource,
    pub preview: PreviewOutcome,
}

#[derive(Debug, Deserialize)]
struct PreviewBody {
    status: Option<String>,
}

#[instrument(level = "info", skip(http))]
pub async fn get_pending_harvester(http: &Client, base: &str) -> Result<Vec<PendingSource>> {
    let listing = format!("{}/api/1/harvest/sources/", base);
    let sources: Vec<HarvestSource> = fetch_numbered_pages(http, &listing).await?;
    let total = sources.len();
    let pending = pending_sources(base, sources);
    info!(total, pending = pending.len(), "harvest sources listed");
    Ok(pending)
}

pub async fn preview_state(http: &Client, base: &str, api_key: &str, id: &str) -> PreviewOutcome {
    let url = format!("{}/api/1/harvest/source/{}/preview", base, id);
    let resp = match http
        .get(&url)
        .header("X-API-KEY", api_key)
        .timeout(PREVIEW_TIMEOUT)
        .send()
        .await
    {
        Ok(r) => r,
        Err(e) if e.is_timeout() => return PreviewOutcome::TimedOut,
        Err(e) => return PreviewOutcome::Failed(e.to_string()),
    };
    // a reported status wins over the HTTP code
    let code = resp.status();
    match resp.json::<PreviewBody>().await {
        Ok(PreviewBody { status: Some(s) }) => PreviewOutcome::Status(PreviewStatus::parse(&s)),
        Err(e) if e.is_timeout() => PreviewOutcome::TimedOut,
        _ if !code.is_success() => PreviewOutcome::Failed(format!("HTTP {}", code)),
        Ok(PreviewBody { status: None }) => PreviewOutcome::Failed("no status in preview".into()),
        Err(e) => PreviewOutcome::Failed(e.to_string()),
    }
}

/// Preview every pending source in turn. Never fails.
pub async fn get_preview_state(
    http: &Client,
    base: &str,
    api_key: &str,
    pending: Vec<PendingSource>,
) -> Vec<CheckedSource> {
    let mut checked = Vec::with_capacity(pending.len());
    for source in pending {
        let preview = preview_state(http, base, api_key, &source.id).await;
        match &preview {
            PreviewOutcome::Status(s) => info!(source = %source.id, status = ?s, "preview"),
            other => warn!(source = %source.id, outcome = ?other, "preview error"),
        }
        checked.push(CheckedSource { source, preview });
    }
    checked
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct BucketCounts {
    pub done: usize,
    pub timeout: usize,
    pub failed: usize,
    pub other: usize,
}

pub fn bucket_counts(checked: &[CheckedSource]) -> BucketCounts {
    let mut counts = BucketCounts::default();
    for c in checked {
        match c.preview.bucket() {
            Bucket::Done => counts.done += 1,
            Bucket::Timeout => counts.timeout += 1,
            Bucket::Failed => counts.failed += 1,
            Bucket::Other => counts.other += 1,
        }
    }
    counts
}

fn push_links(text: &mut String, checked: &[CheckedSource], bucket: Bucket) {
    for c in checked.iter().filter(|c| c.preview.bucket() == bucket) {
        let s = &c.source;
        let _ = writeln!(
            text,
            " - [{}]({}) - Moissonneur [{}]({}) - Lien vers [l'espace Admin]({}) ",
            s.owner_label, s.owner_url, s.name, s.url, s.admin_url
        );
    }
}

pub fn render_report(checked: &[CheckedSource]) -> String {
    let counts = bucket_counts(checked);
    let mut text = String::from(":mega: Rapport hebdo sur l'état des moissonneurs en attente : \n ");
    let _ = write!(
        text,
        "- {} moissonneurs en attente \n \
         - {} moissonneurs en attente dont la preview fonctionne \n \
         - {} moissonneurs en attente dont la preview n'aboutit pas (timeout de 60 secondes) \n \
         - {} moissonneurs en attente dont la preview failed \n \
         - {} moissonneurs dont la preview est dans un autre statut \n \n\n",
        checked.len(),
        counts.done,
        counts.timeout,
        counts.failed,
        counts.other
    );

    text.push_str("Liste des moissonneurs en pending dont la preview fonctionne : \n");
    push_links(&mut text, checked, Bucket::Done);
    text.push_str(
        "\nListe des moissonneurs en attente dont la preview n'aboutit pas (timeout de 60 secondes) : \n",
    );
    push_links(&mut text, checked, Bucket::Timeout);
    text.push_str("\nListe des moissonneurs en attente dont la preview failed : \n");
    push_links(&mut text, checked, Bucket::Failed);
    text.push_str("\nListe des moissonneurs en pending avec un autre statut : \n");
    push_links(&mut text, checked, Bucket::Other);
    let _ = writeln!(
        text,
        "Avant validation, pensez à consulter [le pad des moissonneurs à laisser en attente de validation]({}) ",
        PAD_AWAITING_VALIDATION
    );
    text
}

pub async fn run(ctx: &Context, dag: &DagDefinition) -> Result<()> {
    let base = ctx.settings.source_url();
    let api_key = ctx.settings.datagouv.api_key.as_str();
    let mut run = TaskRun::new(dag)?;

    let pending = run
        .task(GET_PENDING, || get_pending_harvester(&ctx.http, base))
        .await?;
    let checked = run
        .task(GET_PREVIEW, || async {
            Ok(get_preview_state(&ctx.http, base, api_key, pending).await)
        })
        .await?;
    run.task(PUBLISH, || async {
        let counts = bucket_counts(&checked);
        info!(?counts, "harvester report");
        ctx.harvester_mattermost()
            .send_message(&render_report(&checked))
            .await
    })
    .await?;

    run.finish()
}
