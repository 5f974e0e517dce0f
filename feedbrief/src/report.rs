use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::entry::{DigestResponse, ProcessedItem};

/// Render the outgoing digest as Markdown.
///
/// Key developments pointing at items that are not part of this report are
/// left out so every reference resolves to an item below.
pub fn render_markdown(
    persona: &str,
    generated_at: DateTime<Utc>,
    digest: &DigestResponse,
    items: &[&ProcessedItem],
) -> String {
    let mut out = format!(
        "# {} digest, {}\n\n",
        persona,
        generated_at.format("%Y-%m-%d %H:%M UTC")
    );

    if items.is_empty() {
        out.push_str("No new relevant items since the last digest.\n");
        return out;
    }

    if !digest.summary.is_empty() {
        out.push_str(digest.summary.trim());
        out.push_str("\n\n");
    }

    let developments: Vec<_> = digest
        .key_developments
        .iter()
        .filter_map(|d| items.iter().find(|i| i.id == d.item_id).map(|item| (d, *item)))
        .collect();
    if !developments.is_empty() {
        out.push_str("## Key developments\n\n");
        for (development, item) in developments {
            out.push_str(&format!("- {} ([{}](#{}))\n", development.text.trim(), item.title, anchor(&item.id)));
        }
        out.push('\n');
    }

    if !digest.emerging_trends.is_empty() {
        out.push_str("## Emerging trends\n\n");
        for trend in &digest.emerging_trends {
            out.push_str(&format!("- {}\n", trend.trim()));
        }
        out.push('\n');
    }

    if !digest.technical_highlight.is_empty() {
        out.push_str("## Technical highlight\n\n");
        out.push_str(digest.technical_highlight.trim());
        out.push_str("\n\n");
    }

    out.push_str("## Items\n\n");
    for item in items {
        out.push_str(&format!("<a id=\"{}\"></a>\n### {}\n\n", anchor(&item.id), item.title));
        out.push_str(&item.summary);
        out.push_str("\n\n");
        if let Some(comments) = &item.comment_summary {
            out.push_str(&format!("*Discussion:* {}\n\n", comments));
        }
        if let Some(link) = &item.link {
            out.push_str(&format!("[Read more]({})\n\n", link));
        }
    }
    out
}

fn anchor(id: &str) -> String {
    let slug: String = id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    format!("item-{}", slug)
}

/// Write the report as `{reports_dir}/{persona}_{YYYYmmdd_HHMMSS}.md`.
pub async fn write_report(
    reports_dir: impl AsRef<Path>,
    persona: &str,
    generated_at: DateTime<Utc>,
    markdown: &str,
) -> Result<PathBuf> {
    let reports_dir = reports_dir.as_ref();
    tokio::fs::create_dir_all(reports_dir)
        .await
        .with_context(|| format!("failed to create {}", reports_dir.display()))?;

    let safe: String = persona
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let path = reports_dir.join(format!("{}_{}.md", safe, generated_at.format("%Y%m%d_%H%M%S")));
    tokio::fs::write(&path, markdown)
        .await
        .with_context(|| format!("failed to write report {}", path.display()))?;
    info!(path = %path.display(), "report written");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::KeyDevelopment;

    fn item(id: &str, title: &str) -> ProcessedItem {
        ProcessedItem {
            id: id.to_string(),
            title: title.to_string(),
            summary: format!("Summary of {}", title),
            comment_summary: Some("People liked it".to_string()),
            is_relevant: true,
            relevance_reason: String::new(),
            link: Some(format!("https://example.com/{}", id)),
            thumbnail: None,
        }
    }

    #[test]
    fn renders_digest_and_items() {
        let a = item("t3_a", "Alpha");
        let digest = DigestResponse {
            summary: "A quiet week.".to_string(),
            key_developments: vec![
                KeyDevelopment {
                    text: "Alpha shipped".to_string(),
                    item_id: "t3_a".to_string(),
                },
                KeyDevelopment {
                    text: "Beta was already sent".to_string(),
                    item_id: "t3_b".to_string(),
                },
            ],
            emerging_trends: vec!["faster builds".to_string()],
            technical_highlight: "Incremental linking".to_string(),
        };
        let at = DateTime::parse_from_rfc3339("2024-05-01T08:30:00Z").unwrap().with_timezone(&Utc);

        let md = render_markdown("rust", at, &digest, &[&a]);
        assert!(md.starts_with("# rust digest, 2024-05-01 08:30 UTC\n"));
        assert!(md.contains("- Alpha shipped ([Alpha](#item-t3-a))"));
        assert!(!md.contains("Beta was already sent"));
        assert!(md.contains("## Emerging trends\n\n- faster builds"));
        assert!(md.contains("*Discussion:* People liked it"));
        assert!(md.contains("[Read more](https://example.com/t3_a)"));
    }

    #[test]
    fn empty_report_says_so() {
        let md = render_markdown("rust", Utc::now(), &DigestResponse::default(), &[]);
        assert!(md.contains("No new relevant items"));
    }

    #[tokio::test]
    async fn writes_into_reports_dir() {
        let dir = tempfile::tempdir().unwrap();
        let at = DateTime::parse_from_rfc3339("2024-05-01T08:30:00Z").unwrap().with_timezone(&Utc);
        let path = write_report(dir.path().join("reports"), "my persona", at, "# hi\n").await.unwrap();
        assert!(path.ends_with("my_persona_20240501_083000.md"));
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "# hi\n");
    }
}
