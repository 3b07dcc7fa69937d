// src/fetch/urls.rs
use anyhow::{Context, Result};
use reqwest::Client;
use scraper::{Html, Selector};
use std::collections::{BTreeSet, HashSet, VecDeque};
use tracing::{debug, info};
use url::Url;

/// Crawl `index` (an HTML directory listing) and return every linked file whose
/// extension is one of `extensions`. Sub-directory links (ending in `/`) below
/// the index are followed up to `max_depth` levels. Links leaving the index
/// prefix or carrying a query string are ignored. The result is sorted and deduplicated.
#[tracing::instrument(level = "info", skip(client, extensions))]
pub async fn crawl_file_links(
    client: &Client,
    index: &str,
    extensions: &[String],
    max_depth: usize,
) -> Result<Vec<Url>> {
    let root = Url::parse(index).with_context(|| format!("parsing index URL {}", index))?;
    let mut queue = VecDeque::from([(root.clone(), 0usize)]);
    let mut visited = HashSet::from([root.to_string()]);
    let mut files = BTreeSet::new();

    while let Some((page, depth)) = queue.pop_front() {
        debug!(page = %page, depth, "fetching index page");
        let html = client
            .get(page.clone())
            .send()
            .await
            .with_context(|| format!("GET {}", page))?
            .error_for_status()?
            .text()
            .await
            .with_context(|| format!("reading body from {}", page))?;

        for link in extract_links(&html, &page) {
            // listing sort links (`?C=N;O=D`) point back at the same page
            if !link.as_str().starts_with(root.as_str()) || link.query().is_some() {
                continue;
            }
            if link.path().ends_with('/') {
                if depth < max_depth && visited.insert(link.to_string()) {
                    queue.push_back((link, depth + 1));
                }
            } else if has_extension(&link, extensions) {
                files.insert(link);
            }
        }
    }

    info!(index, files = files.len(), "index crawl done");
    Ok(files.into_iter().collect())
}

/// Every `a[href]` of the document, resolved against `base`, without fragments.
pub fn extract_links(html: &str, base: &Url) -> Vec<Url> {
    let selector = Selector::parse("a[href]").expect("CSS selector for links should be valid");
    Html::parse_document(html)
        .select(&selector)
        .filter_map(|e| e.value().attr("href"))
        .filter_map(|href| base.join(href).ok())
        .map(|mut u| {
            u.set_fragment(None);
            u
        })
        .collect()
}

fn has_extension(url: &Url, extensions: &[String]) -> bool {
    let path = url.path().to_lowercase();
    extensions
        .iter()
        .any(|ext| path.ends_with(&format!(".{}", ext.trim_start_matches('.').to_lowercase())))
}

/// Percent-decoded path of `file` relative to `root`, used as the mirror key.
pub fn relative_path(root: &Url, file: &Url) -> Option<String> {
    let rel = file.path().strip_prefix(root.path())?;
    if file.origin() != root.origin() || rel.is_empty() {
        return None;
    }
    urlencoding::decode(rel).ok().map(|s| s.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exts() -> Vec<String> {
        vec!["csv".to_string(), "zip".to_string()]
    }

    #[test]
    fn test_extract_links_resolves_relative() {
        let base = Url::parse("https://example.org/data/").unwrap();
        let html = r##"<html><body>
            <a href="a.csv">a</a>
            <a href="/other/b.csv#top">b</a>
            <a href="sub/">sub</a>
            <a name="anchor">no href</a>
        </body></html>"##;
        let links: Vec<String> = extract_links(html, &base)
            .into_iter()
            .map(|u| u.to_string())
            .collect();
        assert_eq!(
            links,
            vec![
                "https://example.org/data/a.csv",
                "https://example.org/other/b.csv",
                "https://example.org/data/sub/",
            ]
        );
    }

    #[test]
    fn test_has_extension_is_case_insensitive() {
        let u = Url::parse("https://example.org/data/RESULTS.CSV").unwrap();
        assert!(has_extension(&u, &exts()));
        let u = Url::parse("https://example.org/data/readme.pdf").unwrap();
        assert!(!has_extension(&u, &exts()));
    }

    #[test]
    fn test_relative_path() {
        let root = Url::parse("https://example.org/data/").unwrap();
        let file = Url::parse("https://example.org/data/2024/t1.csv").unwrap();
        assert_eq!(relative_path(&root, &file).as_deref(), Some("2024/t1.csv"));
        let other = Url::parse("https://example.org/elsewhere.csv").unwrap();
        assert_eq!(relative_path(&root, &other), None);
        let encoded = Url::parse("https://example.org/data/r%C3%A9sultats%20T1.csv").unwrap();
        assert_eq!(relative_path(&root, &encoded).as_deref(), Some("résultats T1.csv"));
        let foreign = Url::parse("https://mirror.example.org/data/a.csv").unwrap();
        assert_eq!(relative_path(&root, &foreign), None);
    }

    #[tokio::test]
    async fn test_crawl_follows_subdirectories() {
        let mut server = mockito::Server::new_async().await;
        let root = format!("{}/telechargements/", server.url());
        let _index = server
            .mock("GET", "/telechargements/")
            .with_status(200)
            .with_body(
                r#"<a href="../">up</a><a href="europeennes.csv">e</a>
                   <a href="2024/">2024</a><a href="notice.pdf">n</a>"#,
            )
            .create_async()
            .await;
        let _sub = server
            .mock("GET", "/telechargements/2024/")
            .with_status(200)
            .with_body(r#"<a href="t1.zip">t1</a><a href="deeper/">d</a>"#)
            .create_async()
            .await;

        let client = Client::new();
        let files = crawl_file_links(&client, &root, &exts(), 1).await.unwrap();
        let rel: Vec<String> = files
            .iter()
            .filter_map(|f| relative_path(&Url::parse(&root).unwrap(), f))
            .collect();
        assert_eq!(rel, vec!["2024/t1.zip", "europeennes.csv"]);
    }

    #[tokio::test]
    async fn test_crawl_ignores_sort_links() {
        let mut server = mockito::Server::new_async().await;
        let root = format!("{}/telechargements/", server.url());
        let index = server
            .mock("GET", "/telechargements/")
            .match_query(mockito::Matcher::Missing)
            .with_body(
                r#"<a href="?C=N;O=D">Name</a><a href="?C=M;O=A">Last modified</a>
                   <a href="a.csv">a</a><a href="export.csv?download=1">x</a>"#,
            )
            .expect(1)
            .create_async()
            .await;
        let sorted = server
            .mock("GET", "/telechargements/")
            .match_query(mockito::Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let client = Client::new();
        let files = crawl_file_links(&client, &root, &exts(), 2).await.unwrap();
        assert_eq!(files, vec![Url::parse(&format!("{}a.csv", root)).unwrap()]);
        index.assert_async().await;
        sorted.assert_async().await;
    }

    #[tokio::test]
    async fn test_crawl_fails_on_http_error() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/missing/")
            .with_status(404)
            .create_async()
            .await;
        let client = Client::new();
        let res = crawl_file_links(&client, &format!("{}/missing/", server.url()), &exts(), 1).await;
        assert!(res.is_err());
    }
}
