// src/pipelines/mod.rs
//! The four pipelines, each a `DagDefinition` plus an async `run`.

pub mod elections;
pub mod harvester;
pub mod impact;
pub mod rna;

use anyhow::{Context as _, Result};
use clap::ValueEnum;
use reqwest::Client;
use sqlx::postgres::PgConnection;
use std::time::Duration;

use crate::{
    config::Settings,
    dag::DagDefinition,
    publish::{postgres, DatagouvClient, Mattermost, MinioClient},
    workspace::Scratch,
};

/// Everything a task needs: settings loaded once plus a shared HTTP client.
#[derive(Clone, Debug)]
pub struct Context {
    pub settings: Settings,
    pub http: Client,
}

impl Context {
    pub fn new(settings: Settings) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("datagouv-pipelines/", env!("CARGO_PKG_VERSION")))
            .gzip(true)
            .connect_timeout(Duration::from_secs(30))
            .build()
            .context("building HTTP client")?;
        Ok(Self { settings, http })
    }

    pub fn scratch(&self, pipeline: &str) -> Scratch {
        Scratch::new(self.settings.pipeline_dir(pipeline))
    }

    /// Object store client; keys are prefixed with the environment name.
    pub fn minio(&self) -> Result<MinioClient> {
        MinioClient::new(&self.settings.minio, self.settings.environment.as_str())
    }

    /// Catalog the pipelines publish to.
    pub fn datagouv(&self) -> DatagouvClient {
        DatagouvClient::new(
            self.http.clone(),
            &self.settings.datagouv_url(),
            &self.settings.datagouv.api_key,
        )
    }

    /// Team channel. A missing webhook is fatal in production.
    pub fn mattermost(&self) -> Mattermost {
        Mattermost::new(self.http.clone(), &self.settings.mattermost.webhook)
            .required(self.settings.environment.is_prod())
    }

    pub fn harvester_mattermost(&self) -> Mattermost {
        Mattermost::new(
            self.http.clone(),
            &self.settings.mattermost.harvester_webhook,
        )
        .required(self.settings.environment.is_prod())
    }

    pub async fn postgres(&self) -> Result<PgConnection> {
        let name = self.settings.postgres_connection_name();
        postgres::connect(self.settings.connection(name)?).await
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum PipelineKind {
    #[value(name = "data_mirroring_elections")]
    Elections,
    #[value(name = "data_processing_rna")]
    Rna,
    #[value(name = "dgv_harvester_notification")]
    Harvester,
    #[value(name = "dgv_impact")]
    Impact,
}

impl PipelineKind {
    pub const ALL: [PipelineKind; 4] = [
        PipelineKind::Elections,
        PipelineKind::Rna,
        PipelineKind::Harvester,
        PipelineKind::Impact,
    ];

    pub fn definition(&self) -> DagDefinition {
        match self {
            PipelineKind::Elections => elections::definition(),
            PipelineKind::Rna => rna::definition(),
            PipelineKind::Harvester => harvester::definition(),
            PipelineKind::Impact => impact::definition(),
        }
    }

    pub async fn run(&self, ctx: &Context) -> Result<()> {
        let dag = self.definition();
        match self {
            PipelineKind::Elections => elections::run(ctx, &dag).await,
            PipelineKind::Rna => rna::run(ctx, &dag).await,
            PipelineKind::Harvester => harvester::run(ctx, &dag).await,
            PipelineKind::Impact => impact::run(ctx, &dag).await,
        }
    }
}
