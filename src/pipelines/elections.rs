// src/pipelines/elections.rs
// Yearly mirror of the election results download area into the open bucket.

use anyhow::{Context as _, Result};
use reqwest::Client;
use std::{path::Path, time::Duration};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    config::ElectionsSettings,
    dag::{DagDefinition, TaskRun, TaskSpec},
    fetch::{files::download_to, urls::crawl_file_links, urls::relative_path},
    pipelines::Context,
    publish::{FileTransfer, MinioClient},
};

pub const DAG_ID: &str = "data_mirroring_elections";
pub const MIRROR_PREFIX: &str = "elections-mirroring";

const CLEAN: &str = "clean_previous_outputs";
const MIRROR: &str = "get_files_minio_mirroring";
const NOTIFY: &str = "send_notification_mattermost";

pub fn definition() -> DagDefinition {
    DagDefinition {
        dag_id: DAG_ID,
        schedule: "15 7 1 1 *",
        timeout: Duration::from_secs(240 * 60),
        tags: vec!["data_processing", "election", "miroir", "miom"],
        email: vec!["pierlou.ramade@data.gouv.fr", "geoffrey.aldebert@data.gouv.fr"],
        email_on_failure: false,
        catchup: false,
        tasks: vec![
            TaskSpec::new(CLEAN),
            TaskSpec::new(MIRROR).after(&[CLEAN]),
            TaskSpec::new(NOTIFY).after(&[MIRROR]),
        ],
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct MirrorReport {
    pub mirrored: Vec<String>,
    pub skipped: usize,
}

/// Split `a/b/c.csv` into the object directory `<prefix>/a/b/` and `c.csv`.
fn mirror_destination(rel: &str) -> (String, String) {
    match rel.rsplit_once('/') {
        Some((dir, name)) => (format!("{}/{}/", MIRROR_PREFIX, dir), name.to_string()),
        None => (format!("{}/", MIRROR_PREFIX), rel.to_string()),
    }
}

async fn mirror_file(
    http: &Client,
    minio: &MinioClient,
    url: &Url,
    rel: &str,
    data_dir: &Path,
) -> Result<Option<String>> {
    let (dest_path, dest_name) = mirror_destination(rel);
    let key = format!("{}{}", dest_path, dest_name);
    if minio.exists(&key).await? {
        debug!(%key, "already mirrored");
        return Ok(None);
    }

    let local = data_dir.join(rel);
    download_to(http, url.as_str(), &local).await?;
    let source_path = local
        .parent()
        .with_context(|| format!("{} has no parent directory", local.display()))?
        .to_path_buf();
    let written = minio
        .send_files(&[FileTransfer {
            source_path,
            source_name: dest_name.clone(),
            dest_path,
            dest_name,
        }])
        .await?;
    tokio::fs::remove_file(&local)
        .await
        .with_context(|| format!("removing {}", local.display()))?;
    Ok(written.into_iter().next())
}

/// Crawl every configured index and copy each new file to the bucket.
pub async fn get_files_minio_mirroring(
    http: &Client,
    minio: &MinioClient,
    settings: &ElectionsSettings,
    data_dir: &Path,
) -> Result<MirrorReport> {
    let mut report = MirrorReport::default();
    for index in &settings.index_urls {
        let root = Url::parse(index).with_context(|| format!("parsing index URL {}", index))?;
        let files = crawl_file_links(http, index, &settings.extensions, settings.max_depth).await?;
        for url in files {
            let Some(rel) = relative_path(&root, &url) else {
                warn!(%url, "link outside of the index, ignored");
                continue;
            };
            match mirror_file(http, minio, &url, &rel, data_dir).await? {
                Some(key) => report.mirrored.push(key),
                None => report.skipped += 1,
            }
        }
        info!(index, mirrored = report.mirrored.len(), skipped = report.skipped, "index mirrored");
    }
    Ok(report)
}

pub fn notification(bucket: &str, report: &MirrorReport) -> String {
    format!(
        ":mega: Miroir des résultats électoraux mis à jour.\n\
         - {} nouveaux fichiers copiés, {} déjà présents\n\
         - Données stockées sur Minio - Bucket {} - dossier `{}`",
        report.mirrored.len(),
        report.skipped,
        bucket,
        MIRROR_PREFIX
    )
}

pub async fn run(ctx: &Context, dag: &DagDefinition) -> Result<()> {
    let scratch = ctx.scratch(MIRROR_PREFIX);
    let mut run = TaskRun::new(dag)?;

    let data_dir = run.task(CLEAN, || scratch.reset()).await?;
    let report = run
        .task(MIRROR, || async {
            let minio = ctx.minio()?;
            get_files_minio_mirroring(&ctx.http, &minio, &ctx.settings.elections, &data_dir).await
        })
        .await?;
    run.task(NOTIFY, || async {
        ctx.mattermost()
            .send_message(&notification(&ctx.settings.minio.bucket, &report))
            .await
    })
    .await?;

    run.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publish::minio::tests::settings as minio_settings;
    use tempfile::tempdir;

    #[test]
    fn test_mirror_destination() {
        assert_eq!(
            mirror_destination("2024/europeennes/t1.csv"),
            ("elections-mirroring/2024/europeennes/".to_string(), "t1.csv".to_string())
        );
        assert_eq!(
            mirror_destination("t1.csv"),
            ("elections-mirroring/".to_string(), "t1.csv".to_string())
        );
    }

    #[test]
    fn test_notification_counts() {
        let report = MirrorReport {
            mirrored: vec!["dev/elections-mirroring/a.csv".to_string()],
            skipped: 3,
        };
        let text = notification("data-pipeline-open", &report);
        assert!(text.contains("- 1 nouveaux fichiers copiés, 3 déjà présents\n"));
    }

    #[tokio::test]
    async fn test_mirror_skips_existing_objects() {
        let mut server = mockito::Server::new_async().await;
        let index = format!("{}/telechargements/", server.url());
        let _root = server
            .mock("GET", "/telechargements/")
            .with_body(r#"<a href="a.csv">a</a><a href="2024/">2024</a><a href="notice.pdf">n</a>"#)
            .create_async()
            .await;
        let _sub = server
            .mock("GET", "/telechargements/2024/")
            .with_body(r#"<a href="b.txt">b</a>"#)
            .create_async()
            .await;
        let _b = server
            .mock("GET", "/telechargements/2024/b.txt")
            .with_body("resultats")
            .create_async()
            .await;
        let _head_a = server
            .mock("HEAD", "/data-pipeline-open/dev/elections-mirroring/a.csv")
            .with_status(200)
            .with_header("content-length", "1")
            .with_header("last-modified", "Mon, 01 Jan 2024 00:00:00 GMT")
            .with_header("etag", "\"a\"")
            .create_async()
            .await;
        let _head_b = server
            .mock("HEAD", "/data-pipeline-open/dev/elections-mirroring/2024/b.txt")
            .with_status(404)
            .create_async()
            .await;
        let put_b = server
            .mock("PUT", "/data-pipeline-open/dev/elections-mirroring/2024/b.txt")
            .match_body("resultats")
            .with_status(200)
            .with_header("etag", "\"b\"")
            .create_async()
            .await;

        let minio = MinioClient::new(&minio_settings(&server.url()), "dev").unwrap();
        let settings = ElectionsSettings {
            index_urls: vec![index],
            ..ElectionsSettings::default()
        };
        let tmp = tempdir().unwrap();
        let report = get_files_minio_mirroring(&Client::new(), &minio, &settings, tmp.path())
            .await
            .unwrap();

        assert_eq!(
            report,
            MirrorReport {
                mirrored: vec!["dev/elections-mirroring/2024/b.txt".to_string()],
                skipped: 1,
            }
        );
        put_b.assert_async().await;
        assert!(!tmp.path().join("2024/b.txt").exists());
    }
}
