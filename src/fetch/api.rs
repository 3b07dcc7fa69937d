use anyhow::{bail, Context, Result};
use futures::{stream, Stream};
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize};
use std::collections::VecDeque;
use tracing::{debug, info};

/// One page of a catalog listing endpoint.
#[derive(Debug, Deserialize)]
pub struct Page<T> {
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
    #[serde(default)]
    pub next_page: Option<String>,
    #[serde(default)]
    pub page: u64,
    #[serde(default)]
    pub page_size: u64,
    #[serde(default)]
    pub total: u64,
}

pub async fn get_json<T: DeserializeOwned>(client: &Client, url: &str) -> Result<T> {
    debug!(url, "GET json");
    client
        .get(url)
        .send()
        .await
        .with_context(|| format!("GET {}", url))?
        .error_for_status()
        .with_context(|| format!("GET {}", url))?
        .json::<T>()
        .await
        .with_context(|| format!("decoding JSON from {}", url))
}

/// Number of pages to request for a listing: `floor(total / page_size) + 1`.
/// When `total` is an exact multiple the last page is simply empty.
pub fn page_count(total: u64, page_size: u64) -> Result<u64> {
    if page_size == 0 {
        bail!("listing reported a page_size of 0");
    }
    Ok(total / page_size + 1)
}

fn page_url(base: &str, page: u64) -> String {
    let sep = if base.contains('?') { '&' } else { '?' };
    format!("{}{}page={}", base, sep, page)
}

/// Collect every item of a `?page=N` listing. The first page tells how many
/// pages there are; pages are then read in order.
#[tracing::instrument(level = "info", skip(client))]
pub async fn fetch_numbered_pages<T: DeserializeOwned>(client: &Client, base: &str) -> Result<Vec<T>> {
    let first: Page<T> = get_json(client, &page_url(base, 1)).await?;
    let pages = page_count(first.total, first.page_size)?;
    info!(total = first.total, page_size = first.page_size, pages, "listing size");

    let mut items = first.data;
    for page in 2..=pages {
        let p: Page<T> = get_json(client, &page_url(base, page)).await?;
        items.extend(p.data);
    }
    Ok(items)
}

type Cursor<T> = (Option<String>, VecDeque<T>);

async fn next_item<T: DeserializeOwned>(
    client: &Client,
    (mut next, mut buffered): Cursor<T>,
) -> Result<Option<(T, Cursor<T>)>> {
    loop {
        if let Some(item) = buffered.pop_front() {
            return Ok(Some((item, (next, buffered))));
        }
        let Some(url) = next.take() else {
            return Ok(None);
        };
        let page: Page<T> = get_json(client, &url).await?;
        next = page.next_page;
        buffered.extend(page.data);
    }
}

/// Lazily walk a `next_page`-chained listing, one item at a time. Pages are
/// only requested when the consumer pulls past the buffered items, so a
/// consumer stopping early stops the pagination too.
pub fn paginate<'a, T>(client: &'a Client, first_url: &str) -> impl Stream<Item = Result<T>> + 'a
where
    T: DeserializeOwned + 'a,
{
    let start: Cursor<T> = (Some(first_url.to_string()), VecDeque::new());
    stream::try_unfold(start, move |cursor| next_item(client, cursor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use mockito::Matcher;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Item {
        id: u32,
    }

    #[test]
    fn test_page_count() {
        assert_eq!(page_count(45, 20).unwrap(), 3);
        assert_eq!(page_count(40, 20).unwrap(), 3);
        assert_eq!(page_count(0, 20).unwrap(), 1);
        assert!(page_count(10, 0).is_err());
    }

    #[test]
    fn test_page_url() {
        assert_eq!(page_url("https://x/api/1/harvest/sources/", 2), "https://x/api/1/harvest/sources/?page=2");
        assert_eq!(page_url("https://x/api?sort=-created", 3), "https://x/api?sort=-created&page=3");
    }

    #[tokio::test]
    async fn test_fetch_numbered_pages() {
        let mut server = mockito::Server::new_async().await;
        let _p1 = server
            .mock("GET", "/sources/")
            .match_query(Matcher::UrlEncoded("page".into(), "1".into()))
            .with_body(json!({"data": [{"id": 1}, {"id": 2}], "total": 3, "page_size": 2, "page": 1}).to_string())
            .expect(1)
            .create_async()
            .await;
        let _p2 = server
            .mock("GET", "/sources/")
            .match_query(Matcher::UrlEncoded("page".into(), "2".into()))
            .with_body(json!({"data": [{"id": 3}], "total": 3, "page_size": 2, "page": 2}).to_string())
            .create_async()
            .await;

        let client = Client::new();
        let items: Vec<Item> = fetch_numbered_pages(&client, &format!("{}/sources/", server.url()))
            .await
            .unwrap();
        assert_eq!(items, vec![Item { id: 1 }, Item { id: 2 }, Item { id: 3 }]);
    }

    #[tokio::test]
    async fn test_paginate_follows_next_page_lazily() {
        let mut server = mockito::Server::new_async().await;
        let second = format!("{}/discussions/?page=2", server.url());
        let _p1 = server
            .mock("GET", "/discussions/")
            .match_query(Matcher::Missing)
            .with_body(json!({"data": [{"id": 1}, {"id": 2}], "next_page": second}).to_string())
            .create_async()
            .await;
        let p2 = server
            .mock("GET", "/discussions/")
            .match_query(Matcher::UrlEncoded("page".into(), "2".into()))
            .with_body(json!({"data": [{"id": 3}], "next_page": null}).to_string())
            .expect(0)
            .create_async()
            .await;

        let client = Client::new();
        let first = format!("{}/discussions/", server.url());
        let stream = paginate::<Item>(&client, &first);
        futures::pin_mut!(stream);
        assert_eq!(stream.try_next().await.unwrap(), Some(Item { id: 1 }));
        assert_eq!(stream.try_next().await.unwrap(), Some(Item { id: 2 }));
        // second page not requested yet
        p2.assert_async().await;
    }

    #[tokio::test]
    async fn test_paginate_collects_all_pages() {
        let mut server = mockito::Server::new_async().await;
        let second = format!("{}/discussions/?page=2", server.url());
        let _p1 = server
            .mock("GET", "/discussions/")
            .match_query(Matcher::Missing)
            .with_body(json!({"data": [{"id": 1}], "next_page": second}).to_string())
            .create_async()
            .await;
        let _p2 = server
            .mock("GET", "/discussions/")
            .match_query(Matcher::UrlEncoded("page".into(), "2".into()))
            .with_body(json!({"data": [{"id": 2}], "next_page": null}).to_string())
            .create_async()
            .await;

        let client = Client::new();
        let first = format!("{}/discussions/", server.url());
        let all: Vec<Item> = paginate(&client, &first).try_collect().await.unwrap();
        assert_eq!(all, vec![Item { id: 1 }, Item { id: 2 }]);
    }
}
