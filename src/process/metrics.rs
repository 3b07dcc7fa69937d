use anyhow::{bail, Context, Result};
use chrono::{Months, NaiveDate, NaiveDateTime};
use serde::Deserialize;
use std::{cmp::Ordering, ops::ControlFlow};
use tracing::debug;

use crate::process::table::Table;

pub const VIEWS_COLUMN: &str = "metric.views";
pub const QUALITY_COLUMN: &str = "quality_score";
/// Response times are capped at this many days; unanswered discussions count
/// as the cap.
pub const RESPONSE_CAP_DAYS: f64 = 30.0;

fn parse_f64(raw: Option<&str>) -> Option<f64> {
    raw.and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|v| !v.is_nan())
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

pub fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Mean quality score of the `top_n` most viewed datasets, as a percentage
/// rounded to two decimals. Rows with unparsable views sort last; unparsable
/// scores are left out of the mean. `None` when no score is usable.
pub fn average_quality_score(datasets: &Table, top_n: usize) -> Result<Option<f64>> {
    let views = datasets.values(VIEWS_COLUMN)?;
    let scores = datasets.values(QUALITY_COLUMN)?;

    let mut rows: Vec<(Option<f64>, Option<f64>)> = views
        .into_iter()
        .zip(scores)
        .map(|(v, q)| (parse_f64(v), parse_f64(q)))
        .collect();
    // stable: ties keep file order
    rows.sort_by(|a, b| match (a.0, b.0) {
        (Some(x), Some(y)) => y.partial_cmp(&x).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });

    let top: Vec<f64> = rows.iter().take(top_n).filter_map(|(_, q)| *q).collect();
    debug!(rows = rows.len(), scored = top.len(), "quality score sample");
    Ok(mean(&top).map(|m| round2(100.0 * m)))
}

#[derive(Clone, Debug, Deserialize)]
pub struct DiscussionSubject {
    #[serde(rename = "class")]
    pub class: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DiscussionMessage {
    pub posted_on: String,
}

/// One item of the discussions listing.
#[derive(Clone, Debug, Deserialize)]
pub struct Discussion {
    #[serde(default)]
    pub id: Option<String>,
    pub subject: DiscussionSubject,
    pub discussion: Vec<DiscussionMessage>,
}

/// Parse the `YYYY-MM-DDTHH:MM:SS` prefix of a catalog timestamp.
pub fn parse_posted_on(raw: &str) -> Result<NaiveDateTime> {
    let head = raw.get(..19).unwrap_or(raw);
    NaiveDateTime::parse_from_str(head, "%Y-%m-%dT%H:%M:%S")
        .with_context(|| format!("parsing timestamp `{}`", raw))
}

/// Days between the first message and the reply, capped; the cap when there
/// is no reply.
pub fn response_days(first: NaiveDateTime, reply: Option<NaiveDateTime>) -> f64 {
    match reply {
        Some(reply) => {
            let gap = (reply - first).num_seconds() as f64 / 86_400.0;
            gap.min(RESPONSE_CAP_DAYS)
        }
        None => RESPONSE_CAP_DAYS,
    }
}

/// `today` minus one calendar year, clamped to the end of February.
pub fn one_year_before(today: NaiveDate) -> NaiveDate {
    today
        .checked_sub_months(Months::new(12))
        .unwrap_or(NaiveDate::MIN)
}

/// Accumulates response times over a trailing window. Items must arrive
/// newest first: the first one opened before the cut-off ends the walk.
#[derive(Debug)]
pub struct ResponseTimes {
    cutoff: NaiveDate,
    samples: Vec<f64>,
    answered: usize,
}

impl ResponseTimes {
    pub fn new(cutoff: NaiveDate) -> Self {
        Self {
            cutoff,
            samples: Vec::new(),
            answered: 0,
        }
    }

    pub fn observe(&mut self, item: &Discussion) -> Result<ControlFlow<()>> {
        let Some(first) = item.discussion.first() else {
            bail!("discussion {:?} has no message", item.id);
        };
        let opened = parse_posted_on(&first.posted_on)?;
        if opened.date() < self.cutoff {
            return Ok(ControlFlow::Break(()));
        }
        if item.subject.class != "Dataset" {
            return Ok(ControlFlow::Continue(()));
        }
        let reply = match item.discussion.get(1) {
            Some(m) => {
                self.answered += 1;
                Some(parse_posted_on(&m.posted_on)?)
            }
            None => None,
        };
        self.samples.push(response_days(opened, reply));
        Ok(ControlFlow::Continue(()))
    }

    pub fn discussions(&self) -> usize {
        self.samples.len()
    }

    pub fn answered(&self) -> usize {
        self.answered
    }

    pub fn average(&self) -> Option<f64> {
        mean(&self.samples)
    }
}
