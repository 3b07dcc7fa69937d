// src/pipelines/rna.rs
// Weekly aggregation of the national associations registry (RNA).

use anyhow::{Context as _, Result};
use chrono::Local;
use reqwest::Client;
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::task;
use tracing::info;

use crate::{
    config::Environment,
    dag::{DagDefinition, TaskRun, TaskSpec},
    fetch::files::{download_into_dir, unzip},
    pipelines::Context,
    process::{concat_fragments, CsvFormat, Encoding},
    publish::{
        datagouv::Registration,
        postgres::{copy_file, execute_sql_file},
        CommunityResource, DatagouvClient, FileTransfer, SqlFile,
    },
};

pub const DAG_ID: &str = "data_processing_rna";
pub const RNA_DATASET: &str = "58e53811c751df03df38f42d";
pub const ARCHIVE_PREFIX: &str = "rna_waldec";
pub const RESOURCE_TITLE: &str = "RNA agrégé";
pub const OUTPUT: &str = "base_rna.csv";

const CLEAN: &str = "clean_previous_outputs";
const DOWNLOAD: &str = "download_rna";
const PROCESS: &str = "process_rna";
const CREATE_TABLE: &str = "create_rna_table";
const POPULATE_TABLE: &str = "populate_rna_table";
const INDEX_TABLE: &str = "index_rna_table";
const UPLOAD: &str = "send_rna_to_minio";
const PUBLISH: &str = "publish_rna_communautaire";
const NOTIFY: &str = "send_notification_mattermost";

pub fn definition() -> DagDefinition {
    DagDefinition {
        dag_id: DAG_ID,
        schedule: "0 4 * * MON",
        timeout: Duration::from_secs(240 * 60),
        tags: vec!["data_processing", "rna", "association"],
        email: vec!["geoffrey.aldebert@data.gouv.fr"],
        email_on_failure: true,
        catchup: false,
        tasks: vec![
            TaskSpec::new(CLEAN),
            TaskSpec::new(DOWNLOAD).after(&[CLEAN]),
            TaskSpec::new(PROCESS).after(&[DOWNLOAD]),
            TaskSpec::new(CREATE_TABLE).after(&[PROCESS]),
            TaskSpec::new(POPULATE_TABLE).after(&[CREATE_TABLE]),
            TaskSpec::new(INDEX_TABLE).after(&[POPULATE_TABLE]),
            TaskSpec::new(UPLOAD).after(&[PROCESS]),
            TaskSpec::new(PUBLISH).after(&[UPLOAD]),
            TaskSpec::new(NOTIFY).after(&[INDEX_TABLE, PUBLISH]),
        ],
    }
}

/// Organization the community resource is published under.
pub fn publishing_organization(env: &Environment) -> &'static str {
    if env.is_prod() {
        // data.gouv.fr
        "646b7187b50b2a93b1ae3d45"
    } else {
        // DataTeam
        "63e3ae4082ddaa6c806b8417"
    }
}

pub fn table_name(env: &Environment) -> &'static str {
    if env.is_prod() {
        "airflow.base_rna"
    } else {
        "base_rna"
    }
}

/// Fetch the latest registry archive and extract it under `<data_dir>/rna`.
pub async fn download_rna(
    http: &Client,
    catalog: &DatagouvClient,
    data_dir: &Path,
) -> Result<Vec<PathBuf>> {
    let resource = catalog.latest_resource(RNA_DATASET, ARCHIVE_PREFIX).await?;
    let archive = download_into_dir(http, &resource.url, data_dir).await?;
    let dest = data_dir.join("rna");
    let files = task::spawn_blocking({
        let archive = archive.clone();
        move || unzip(&archive, &dest)
    })
    .await
    .context("unzip task panicked")??;
    tokio::fs::remove_file(&archive)
        .await
        .with_context(|| format!("removing {}", archive.display()))?;
    info!(archive = %resource.title, files = files.len(), "registry extracted");
    Ok(files)
}

/// Concatenate every fragment of `<data_dir>/rna`, normalize the text and
/// write `<data_dir>/base_rna.csv`. Returns the output size in bytes.
pub fn process_rna(data_dir: &Path) -> Result<u64> {
    let table = concat_fragments(
        &data_dir.join("rna"),
        "*.csv",
        CsvFormat::semicolon(Encoding::Latin1),
    )?
    .normalized()?;
    let size = table.write_csv(&data_dir.join(OUTPUT))?;
    info!(rows = table.num_rows(), columns = table.column_names().len(), bytes = size, "registry aggregated");
    Ok(size)
}

pub fn notification(bucket: &str, catalog: &DatagouvClient) -> String {
    format!(
        ":mega: Données des associations mises à jour.\n\
         - Données stockées sur Minio - Bucket {}\n\
         - Données publiées [sur data.gouv.fr]({})",
        bucket,
        catalog.dataset_page_url(RNA_DATASET)
    )
}

pub async fn run(ctx: &Context, dag: &DagDefinition) -> Result<()> {
    let env = &ctx.settings.environment;
    let scratch = ctx.scratch("rna");
    let source = DatagouvClient::new(ctx.http.clone(), ctx.settings.source_url(), "");
    let catalog = ctx.datagouv();
    let sql_dir = ctx.settings.sql_dir.join("rna");
    let table = table_name(env);
    let mut run = TaskRun::new(dag)?;

    let data_dir = run.task(CLEAN, || scratch.reset()).await?;
    run.task(DOWNLOAD, || download_rna(&ctx.http, &source, &data_dir))
        .await?;
    let size = run
        .task(PROCESS, || {
            let dir = data_dir.clone();
            async move { task::spawn_blocking(move || process_rna(&dir)).await? }
        })
        .await?;

    // database branch
    let mut conn = run
        .task(CREATE_TABLE, || async {
            let mut conn = ctx.postgres().await?;
            execute_sql_file(
                &mut conn,
                &[SqlFile::new(&sql_dir, "create_rna_table.sql")],
                &[("table", table)],
            )
            .await?;
            Ok(conn)
        })
        .await?;
    run.task(POPULATE_TABLE, || async {
        copy_file(&mut conn, table, &[SqlFile::new(&data_dir, OUTPUT)]).await
    })
    .await?;
    run.task(INDEX_TABLE, || async {
        execute_sql_file(
            &mut conn,
            &[SqlFile::new(&sql_dir, "index_rna_table.sql")],
            &[("table", table)],
        )
        .await
    })
    .await?;

    // publication branch
    let keys = run
        .task(UPLOAD, || async {
            ctx.minio()?
                .send_files(&[FileTransfer {
                    source_path: data_dir.clone(),
                    source_name: OUTPUT.to_string(),
                    dest_path: "rna/".to_string(),
                    dest_name: OUTPUT.to_string(),
                }])
                .await
        })
        .await?;
    run.task(PUBLISH, || async {
        let key = keys.first().context("no object uploaded")?;
        let resource = CommunityResource::remote(
            RNA_DATASET,
            publishing_organization(env),
            RESOURCE_TITLE,
            "csv",
            &ctx.settings.public_object_url(key),
            size,
            &format!(
                "Répertoire National des Associations en un seul fichier, agrégé à partir des données brutes ({})",
                Local::now().format("%Y-%m-%d %H:%M:%S")
            ),
        );
        match catalog.post_remote_community_resource(&resource).await? {
            Registration::Created(id) => info!(resource = %id, "community resource created"),
            Registration::Updated(id) => info!(resource = %id, "community resource updated"),
        }
        Ok(())
    })
    .await?;

    run.task(NOTIFY, || async {
        ctx.mattermost()
            .send_message(&notification(&ctx.settings.minio.bucket, &catalog))
            .await
    })
    .await?;

    run.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::{fs, io::Write};
    use tempfile::tempdir;
    use zip::write::SimpleFileOptions;

    fn latin1(s: &str) -> Vec<u8> {
        s.chars().map(|c| c as u32 as u8).collect()
    }

    #[test]
    fn test_environment_switches() {
        assert_eq!(table_name(&Environment::Prod), "airflow.base_rna");
        assert_eq!(table_name(&Environment::Dev), "base_rna");
        assert_eq!(publishing_organization(&Environment::Prod), "646b7187b50b2a93b1ae3d45");
        assert_eq!(publishing_organization(&Environment::Dev), "63e3ae4082ddaa6c806b8417");
        let staging = Environment::Other("staging".to_string());
        assert_eq!(table_name(&staging), "base_rna");
        assert_eq!(publishing_organization(&staging), "63e3ae4082ddaa6c806b8417");
    }

    #[test]
    fn test_process_rna_aggregates_fragments() {
        let tmp = tempdir().unwrap();
        let rna = tmp.path().join("rna");
        fs::create_dir_all(&rna).unwrap();
        fs::write(
            rna.join("rna_waldec_dpt_02.csv"),
            latin1("id;titre;objet\nW022;Comité des fêtes;animations (été)\n"),
        )
        .unwrap();
        fs::write(
            rna.join("rna_waldec_dpt_01.csv"),
            latin1("id;titre;objet\nW011;Amicale bouliste;pétanque & loisirs\nW012;Club #1;\n"),
        )
        .unwrap();

        let size = process_rna(tmp.path()).unwrap();
        let out = fs::read_to_string(tmp.path().join(OUTPUT)).unwrap();
        assert_eq!(size, out.len() as u64);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "id,titre,objet");
        assert_eq!(lines[1], "W011,Amicale bouliste,petanque  loisirs");
        assert_eq!(lines[2], "W012,Club 1,");
        assert_eq!(lines[3], "W022,Comite des fetes,animations ete");
        assert_eq!(lines.len(), 4);
    }

    #[test]
    fn test_notification_links_dataset() {
        let catalog = DatagouvClient::new(Client::new(), "https://demo.data.gouv.fr", "");
        let text = notification("data-pipeline-open", &catalog);
        assert!(text.contains("Bucket data-pipeline-open\n"));
        assert!(text.ends_with("(https://demo.data.gouv.fr/fr/datasets/58e53811c751df03df38f42d)"));
    }

    #[tokio::test]
    async fn test_download_rna_extracts_latest_archive() {
        let mut archive = Vec::new();
        {
            let mut zw = zip::ZipWriter::new(std::io::Cursor::new(&mut archive));
            zw.start_file("rna_waldec_dpt_01.csv", SimpleFileOptions::default())
                .unwrap();
            zw.write_all(b"id;titre\nW1;a\n").unwrap();
            zw.finish().unwrap();
        }

        let mut server = mockito::Server::new_async().await;
        let zip_url = format!("{}/files/rna_waldec_20260101.zip", server.url());
        let _dataset = server
            .mock("GET", format!("/api/1/datasets/{}/", RNA_DATASET).as_str())
            .with_body(
                json!({"resources": [
                    {"id": "z", "title": "rna_waldec_20260101.zip", "url": zip_url, "last_modified": "2026-01-01T00:00:00"}
                ]})
                .to_string(),
            )
            .create_async()
            .await;
        let _zip = server
            .mock("GET", "/files/rna_waldec_20260101.zip")
            .with_body(archive)
            .create_async()
            .await;

        let tmp = tempdir().unwrap();
        let http = Client::new();
        let catalog = DatagouvClient::new(http.clone(), &server.url(), "");
        let files = download_rna(&http, &catalog, tmp.path()).await.unwrap();
        assert_eq!(files, vec![tmp.path().join("rna").join("rna_waldec_dpt_01.csv")]);
        assert!(!tmp.path().join("rna_waldec_20260101.zip").exists());
    }
}
