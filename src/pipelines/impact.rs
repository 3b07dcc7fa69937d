// src/pipelines/impact.rs
// Monthly platform-impact indicators: dataset quality and discussion response time.

use anyhow::{Context as _, Result};
use chrono::{Local, NaiveDate};
use futures::TryStreamExt;
use reqwest::Client;
use serde::{Serialize, Serializer};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{info, instrument};

use crate::{
    dag::{DagDefinition, TaskRun, TaskSpec},
    fetch::{api::paginate, files::download_to},
    pipelines::Context,
    process::{
        metrics::{average_quality_score, one_year_before, Discussion, ResponseTimes},
        CsvFormat, Encoding, Table,
    },
    publish::FileTransfer,
};

pub const DAG_ID: &str = "dgv_impact";
/// Resource id of the catalog's datasets export.
pub const DATASETS_EXPORT: &str = "f868cca6-8da1-4369-a78d-47463f19a9a3";
pub const TOP_DATASETS: usize = 1000;
pub const OUTPUT: &str = "impact.csv";

const CLEAN: &str = "clean_previous_outputs";
const CALCULATE: &str = "calculate_metrics";
const UPLOAD: &str = "send_impact_to_minio";
const NOTIFY: &str = "send_notification_mattermost";

pub fn definition() -> DagDefinition {
    DagDefinition {
        dag_id: DAG_ID,
        schedule: "0 6 1 * *",
        timeout: Duration::from_secs(60 * 60),
        tags: vec!["monthly", "impact", "datagouv"],
        email: vec!["geoffrey.aldebert@data.gouv.fr"],
        email_on_failure: true,
        catchup: false,
        tasks: vec![
            TaskSpec::new(CLEAN),
            TaskSpec::new(CALCULATE).after(&[CLEAN]),
            TaskSpec::new(UPLOAD).after(&[CALCULATE]),
            TaskSpec::new(NOTIFY).after(&[UPLOAD]),
        ],
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ImpactMetrics {
    pub average_quality_score: Option<f64>,
    pub average_response_days: Option<f64>,
    pub discussions: usize,
    pub answered: usize,
    pub since: NaiveDate,
    pub computed_on: NaiveDate,
}

fn py_bool<S: Serializer>(v: &bool, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(if *v { "True" } else { "False" })
}

/// Floats keep a decimal part (`50.0`); missing values are empty.
fn decimal<S: Serializer>(v: &Option<f64>, s: S) -> std::result::Result<S::Ok, S::Error> {
    match v {
        Some(v) if v.fract() == 0.0 && v.is_finite() => s.serialize_str(&format!("{:.1}", v)),
        Some(v) => s.serialize_str(&v.to_string()),
        None => s.serialize_str(""),
    }
}

/// One row of the impact table.
#[derive(Clone, Debug, Serialize)]
pub struct Indicator {
    pub nom_service_public_numerique: &'static str,
    pub indicateur: &'static str,
    #[serde(serialize_with = "decimal")]
    pub valeur: Option<f64>,
    pub unite_mesure: &'static str,
    #[serde(serialize_with = "py_bool")]
    pub est_cible: bool,
    pub frequence_calcul: &'static str,
    pub date: String,
    #[serde(serialize_with = "py_bool")]
    pub est_periode: bool,
    pub date_debut: String,
    #[serde(serialize_with = "py_bool")]
    pub est_automatise: bool,
    pub source_collecte: &'static str,
    pub mode_calcul: &'static str,
    pub commentaires: &'static str,
}

pub fn indicators(m: &ImpactMetrics) -> Vec<Indicator> {
    let date = m.computed_on.format("%Y-%m-%d").to_string();
    let row = |indicateur: &'static str,
               valeur: Option<f64>,
               unite_mesure: &'static str,
               est_periode: bool,
               date_debut: String| Indicator {
        nom_service_public_numerique: "data.gouv.fr",
        indicateur,
        valeur,
        unite_mesure,
        est_cible: false,
        frequence_calcul: "mensuelle",
        date: date.clone(),
        est_periode,
        date_debut,
        est_automatise: true,
        source_collecte: "script",
        mode_calcul: "moyenne",
        commentaires: "",
    };
    vec![
        row(
            "Score qualité moyen 1000 JdD les plus vus",
            m.average_quality_score,
            "unité",
            false,
            String::new(),
        ),
        row(
            "Délai moyen de réponse à une discussion",
            m.average_response_days,
            "jour",
            true,
            m.since.format("%Y-%m-%d").to_string(),
        ),
    ]
}

pub fn write_indicators(path: &Path, rows: &[Indicator]) -> Result<()> {
    let mut w = csv::Writer::from_path(path).with_context(|| format!("creating {}", path.display()))?;
    for r in rows {
        w.serialize(r)?;
    }
    w.flush()?;
    Ok(())
}

#[instrument(level = "info", skip(http))]
pub async fn average_response_time(
    http: &Client,
    base: &str,
    cutoff: NaiveDate,
) -> Result<ResponseTimes> {
    let mut acc = ResponseTimes::new(cutoff);
    let first = format!("{}/api/1/discussions/", base);
    let items = paginate::<Discussion>(http, &first);
    futures::pin_mut!(items);
    let mut walked = 0usize;
    while let Some(item) = items.try_next().await? {
        walked += 1;
        if acc.observe(&item)?.is_break() {
            break;
        }
    }
    info!(
        walked,
        discussions = acc.discussions(),
        answered = acc.answered(),
        "discussions scanned"
    );
    Ok(acc)
}

/// Download the datasets export into `data_dir`, compute both indicators
/// and write `impact.csv`.
pub async fn calculate_metrics(
    http: &Client,
    base: &str,
    data_dir: &Path,
    today: NaiveDate,
) -> Result<ImpactMetrics> {
    let export = data_dir.join("datasets_export.csv");
    download_to(http, &format!("{}/fr/datasets/r/{}", base, DATASETS_EXPORT), &export).await?;
    let datasets = Table::read_csv(&export, CsvFormat::semicolon(Encoding::Utf8))?;
    let quality = average_quality_score(&datasets, TOP_DATASETS)?;
    info!(datasets = datasets.num_rows(), ?quality, "quality score");

    let since = one_year_before(today);
    let times = average_response_time(http, base, since).await?;

    let metrics = ImpactMetrics {
        average_quality_score: quality,
        average_response_days: times.average(),
        discussions: times.discussions(),
        answered: times.answered(),
        since,
        computed_on: today,
    };
    write_indicators(&data_dir.join(OUTPUT), &indicators(&metrics))?;
    Ok(metrics)
}

pub fn notification(bucket: &str, object_url: &str, m: &ImpactMetrics) -> String {
    let fmt = |v: Option<f64>| v.map(|v| format!("{:.2}", v)).unwrap_or_else(|| "n/a".into());
    format!(
        ":mega: Indicateurs d'impact de data.gouv.fr mis à jour.\n\
         - Score qualité moyen des 1000 JdD les plus vus : {}\n\
         - Délai moyen de réponse à une discussion : {} jours ({} discussions depuis le {})\n\
         - Données stockées sur Minio - Bucket {} - [impact.csv]({})",
        fmt(m.average_quality_score),
        fmt(m.average_response_days),
        m.discussions,
        m.since.format("%Y-%m-%d"),
        bucket,
        object_url
    )
}

pub async fn run(ctx: &Context, dag: &DagDefinition) -> Result<()> {
    let scratch = ctx.scratch("impact");
    let base = ctx.settings.source_url();
    let mut run = TaskRun::new(dag)?;

    let data_dir: PathBuf = run.task(CLEAN, || scratch.reset()).await?;
    let metrics = run
        .task(CALCULATE, || {
            calculate_metrics(&ctx.http, base, &data_dir, Local::now().date_naive())
        })
        .await?;
    let keys = run
        .task(UPLOAD, || async {
            ctx.minio()?
                .send_files(&[FileTransfer {
                    source_path: data_dir.clone(),
                    source_name: OUTPUT.to_string(),
                    dest_path: "impact/".to_string(),
                    dest_name: OUTPUT.to_string(),
                }])
                .await
        })
        .await?;
    run.task(NOTIFY, || async {
        let key = keys.first().map(String::as_str).unwrap_or_default();
        let text = notification(
            &ctx.settings.minio.bucket,
            &ctx.settings.public_object_url(key),
            &metrics,
        );
        ctx.mattermost().send_message(&text).await
    })
    .await?;

    run.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;
    use tempfile::tempdir;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn metrics() -> ImpactMetrics {
        ImpactMetrics {
            average_quality_score: Some(50.0),
            average_response_days: Some(12.5),
            discussions: 4,
            answered: 3,
            since: date("2025-10-18"),
            computed_on: date("2026-10-18"),
        }
    }

    #[test]
    fn test_indicator_csv() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join(OUTPUT);
        write_indicators(&path, &indicators(&metrics())).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(
            lines[0],
            "nom_service_public_numerique,indicateur,valeur,unite_mesure,est_cible,frequence_calcul,date,est_periode,date_debut,est_automatise,source_collecte,mode_calcul,commentaires"
        );
        assert_eq!(
            lines[1],
            "data.gouv.fr,Score qualité moyen 1000 JdD les plus vus,50.0,unité,False,mensuelle,2026-10-18,False,,True,script,moyenne,"
        );
        assert_eq!(
            lines[2],
            "data.gouv.fr,Délai moyen de réponse à une discussion,12.5,jour,False,mensuelle,2026-10-18,True,2025-10-18,True,script,moyenne,"
        );
    }

    #[test]
    fn test_missing_average_is_empty() {
        let mut m = metrics();
        m.average_response_days = None;
        let tmp = tempdir().unwrap();
        let path = tmp.path().join(OUTPUT);
        write_indicators(&path, &indicators(&m)).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.lines().nth(2).unwrap().contains("discussion,,jour,"));
    }

    #[test]
    fn test_notification_mentions_values() {
        let text = notification("data-pipeline-open", "https://o/x/impact.csv", &metrics());
        assert!(text.contains(": 50.00\n"));
        assert!(text.contains("12.50 jours (4 discussions depuis le 2025-10-18)"));
        assert!(text.ends_with("[impact.csv](https://o/x/impact.csv)"));
    }

    #[tokio::test]
    async fn test_calculate_metrics_end_to_end() {
        let mut server = mockito::Server::new_async().await;
        let _export = server
            .mock("GET", format!("/fr/datasets/r/{}", DATASETS_EXPORT).as_str())
            .with_body("id;metric.views;quality_score\na;10;0.5\nb;20;0.7\nc;;0.1\n")
            .create_async()
            .await;
        let _discussions = server
            .mock("GET", "/api/1/discussions/")
            .match_query(Matcher::Missing)
            .with_body(
                json!({"data": [
                    {"id": "d1", "subject": {"class": "Dataset", "id": "x"},
                     "discussion": [{"posted_on": "2026-09-01T00:00:00"}, {"posted_on": "2026-09-03T00:00:00"}]},
                    {"id": "d2", "subject": {"class": "Dataset", "id": "y"},
                     "discussion": [{"posted_on": "2026-08-01T00:00:00"}]},
                    {"id": "d3", "subject": {"class": "Dataset", "id": "z"},
                     "discussion": [{"posted_on": "2024-01-01T00:00:00"}]}
                ], "next_page": null})
                .to_string(),
            )
            .create_async()
            .await;

        let tmp = tempdir().unwrap();
        let m = calculate_metrics(&Client::new(), &server.url(), tmp.path(), date("2026-10-18"))
            .await
            .unwrap();
        // top 1000 holds every row; c has no views but still a score
        assert_eq!(m.average_quality_score, Some(43.33));
        assert_eq!(m.average_response_days, Some(16.0));
        assert_eq!(m.discussions, 2);
        assert_eq!(m.answered, 1);
        assert_eq!(m.since, date("2025-10-18"));
        assert!(tmp.path().join(OUTPUT).exists());
    }

    #[tokio::test]
    async fn test_exhausted_listing_ends_walk() {
        let mut server = mockito::Server::new_async().await;
        let _discussions = server
            .mock("GET", "/api/1/discussions/")
            .with_body(json!({"data": [], "next_page": null}).to_string())
            .create_async()
            .await;
        let acc = average_response_time(&Client::new(), &server.url(), date("2025-01-01"))
            .await
            .unwrap();
        assert_eq!(acc.discussions(), 0);
        assert_eq!(acc.average(), None);
    }
}
