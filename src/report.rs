//! Turns an `AnalysisResult` into a deliverable report: plain text, a
//! rendered image, or a PDF persisted to disk. Image and PDF rendering go
//! through a headless browser; when none is wired in, those formats fail
//! with guidance instead of silently downgrading to text.

use crate::error::RenderError;
use crate::model::{AnalysisKind, AnalysisResult, OutputFormat, Payload, RenderedReport};
use async_trait::async_trait;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info, warn};

pub const DEFAULT_TEMPLATE_ID: &str = "scrapbook";

const SCRAPBOOK_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<style>
  body { font-family: "Noto Sans", sans-serif; background: #f6f1e7; margin: 0; padding: 24px; width: 720px; }
  h1 { font-size: 28px; border-bottom: 3px dashed #c9b99a; padding-bottom: 8px; }
  h2 { font-size: 20px; color: #7a5c2e; margin-top: 24px; }
  .card { background: #fffdf7; border: 1px solid #e4d8bf; border-radius: 8px; padding: 12px 16px; margin: 8px 0; box-shadow: 2px 2px 0 #e4d8bf; }
  .meta { color: #9a8a6a; font-size: 13px; }
  .unavailable { color: #b08d57; font-style: italic; }
  .chart { display: flex; align-items: flex-end; gap: 2px; height: 72px; margin: 8px 0; }
  .chart div { flex: 1; background: #c9a15a; border-radius: 2px 2px 0 0; min-height: 2px; }
</style>
</head>
<body>
<h1>Daily digest · {{room_id}}</h1>
<p class="meta">{{date}}</p>
{{sections}}
</body>
</html>
"#;

#[derive(Debug, Clone)]
pub struct Template {
    pub id: String,
    pub html: String,
}

/// Source of report templates. The built-in template is always present;
/// a directory of `<id>.html` files extends the set.
pub trait TemplateStore: Send + Sync {
    fn list(&self) -> Vec<String>;
    fn get(&self, id: &str) -> Option<Template>;
}

pub struct FileTemplateStore {
    dir: Option<PathBuf>,
}

impl FileTemplateStore {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }
}

impl TemplateStore for FileTemplateStore {
    fn list(&self) -> Vec<String> {
        let mut ids = vec![DEFAULT_TEMPLATE_ID.to_string()];
        if let Some(dir) = &self.dir {
            if let Ok(entries) = std::fs::read_dir(dir) {
                for entry in entries.flatten() {
                    let path = entry.path();
                    if path.extension().is_some_and(|ext| ext == "html") {
                        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                            if stem != DEFAULT_TEMPLATE_ID {
                                ids.push(stem.to_string());
                            }
                        }
                    }
                }
            }
        }
        ids.sort();
        ids
    }

    fn get(&self, id: &str) -> Option<Template> {
        if id == DEFAULT_TEMPLATE_ID {
            return Some(Template {
                id: DEFAULT_TEMPLATE_ID.to_string(),
                html: SCRAPBOOK_TEMPLATE.to_string(),
            });
        }
        let dir = self.dir.as_ref()?;
        let html = std::fs::read_to_string(dir.join(format!("{id}.html"))).ok()?;
        Some(Template {
            id: id.to_string(),
            html,
        })
    }
}

/// Headless HTML renderer. Implemented by the browser wrapper; faked in
/// tests.
#[async_trait]
pub trait HtmlRenderer: Send + Sync {
    async fn render_image(&self, html: &str) -> Result<Vec<u8>, RenderError>;
    async fn render_pdf(&self, html: &str) -> Result<Vec<u8>, RenderError>;
}

/// Fetches a browser binary for image/pdf rendering. Wired in behind the
/// install command; deployments that ship a browser never touch it.
#[async_trait]
pub trait BrowserInstaller: Send + Sync {
    async fn install(&self) -> anyhow::Result<PathBuf>;
}

/// Drives a Chromium-family binary in headless mode.
pub struct ChromiumRenderer {
    browser: PathBuf,
}

impl ChromiumRenderer {
    pub fn new(browser: PathBuf) -> Self {
        Self { browser }
    }

    async fn run(
        &self,
        html: &str,
        flag: &str,
        filename: &str,
        extra: &[&str],
    ) -> Result<Vec<u8>, RenderError> {
        let scratch = std::env::temp_dir().join(format!("roomdigest-{}", std::process::id()));
        tokio::fs::create_dir_all(&scratch)
            .await
            .map_err(|e| RenderError::Failed(format!("scratch dir: {e}")))?;
        let page = scratch.join("report.html");
        let output = scratch.join(filename);
        tokio::fs::write(&page, html)
            .await
            .map_err(|e| RenderError::Failed(format!("write page: {e}")))?;

        let mut command = Command::new(&self.browser);
        command
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--no-sandbox")
            .arg(format!("--{}={}", flag, output.display()))
            .args(extra)
            .arg(&page)
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        debug!(browser = %self.browser.display(), flag, "invoking headless browser");

        let result = command
            .output()
            .await
            .map_err(|e| RenderError::Failed(format!("spawn browser: {e}")))?;
        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(RenderError::Failed(format!(
                "browser exited with {}: {}",
                result.status,
                stderr.trim()
            )));
        }
        let bytes = tokio::fs::read(&output)
            .await
            .map_err(|e| RenderError::Failed(format!("read output: {e}")))?;
        let _ = tokio::fs::remove_dir_all(&scratch).await;
        Ok(bytes)
    }
}

#[async_trait]
impl HtmlRenderer for ChromiumRenderer {
    async fn render_image(&self, html: &str) -> Result<Vec<u8>, RenderError> {
        self.run(html, "screenshot", "shot.png", &["--window-size=768,1280"])
            .await
    }

    async fn render_pdf(&self, html: &str) -> Result<Vec<u8>, RenderError> {
        self.run(html, "print-to-pdf", "report.pdf", &["--no-pdf-header-footer"])
            .await
    }
}

pub struct ReportRenderer {
    templates: Box<dyn TemplateStore>,
    html: Option<Arc<dyn HtmlRenderer>>,
    reports_dir: PathBuf,
    pdf_filename_format: String,
}

impl ReportRenderer {
    pub fn new(
        templates: Box<dyn TemplateStore>,
        html: Option<Arc<dyn HtmlRenderer>>,
        reports_dir: PathBuf,
        pdf_filename_format: String,
    ) -> Self {
        Self {
            templates,
            html,
            reports_dir,
            pdf_filename_format,
        }
    }

    pub fn templates(&self) -> &dyn TemplateStore {
        self.templates.as_ref()
    }

    pub fn has_html_renderer(&self) -> bool {
        self.html.is_some()
    }

    /// Renders `result` in the requested format. Rendering is pure over the
    /// result: the same input yields the same output.
    pub async fn render(
        &self,
        result: &AnalysisResult,
        format: OutputFormat,
        template_id: &str,
    ) -> Result<RenderedReport, RenderError> {
        let template = self.templates.get(template_id).unwrap_or_else(|| {
            warn!(template_id, "unknown template, using default");
            self.templates
                .get(DEFAULT_TEMPLATE_ID)
                .unwrap_or(Template {
                    id: DEFAULT_TEMPLATE_ID.to_string(),
                    html: SCRAPBOOK_TEMPLATE.to_string(),
                })
        });

        let payload = match format {
            OutputFormat::Text => Payload::Text(render_text(result)),
            OutputFormat::Image => {
                let renderer = self.require_html("image")?;
                let html = fill_template(&template.html, result);
                Payload::Bytes(renderer.render_image(&html).await?)
            }
            OutputFormat::Pdf => {
                let renderer = self.require_html("pdf")?;
                let html = fill_template(&template.html, result);
                let bytes = renderer.render_pdf(&html).await?;
                self.persist_pdf(result, &bytes).await?;
                Payload::Bytes(bytes)
            }
        };

        Ok(RenderedReport {
            room_id: result.room_id.clone(),
            format,
            payload,
            template_id: template.id,
        })
    }

    fn require_html(&self, what: &str) -> Result<&Arc<dyn HtmlRenderer>, RenderError> {
        self.html.as_ref().ok_or_else(|| {
            RenderError::Unavailable(format!(
                "{what} rendering needs a headless browser; set output.pdf.browser_path \
                 or run the pdf install command, or switch output.format to \"text\""
            ))
        })
    }

    async fn persist_pdf(&self, result: &AnalysisResult, bytes: &[u8]) -> Result<(), RenderError> {
        let filename = self
            .pdf_filename_format
            .replace("{room_id}", &sanitize(&result.room_id))
            .replace("{date}", &result.generated_at.format("%Y-%m-%d").to_string());
        tokio::fs::create_dir_all(&self.reports_dir)
            .await
            .map_err(|e| RenderError::Failed(format!("reports dir: {e}")))?;
        let path = self.reports_dir.join(filename);
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| RenderError::Failed(format!("persist pdf: {e}")))?;
        info!(path = %path.display(), "pdf report saved");
        Ok(())
    }
}

fn sanitize(room_id: &str) -> String {
    room_id
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect()
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn fill_template(template: &str, result: &AnalysisResult) -> String {
    template
        .replace("{{room_id}}", &escape_html(&result.room_id))
        .replace(
            "{{date}}",
            &result.generated_at.format("%Y-%m-%d").to_string(),
        )
        .replace("{{sections}}", &render_sections_html(result))
}

fn render_sections_html(result: &AnalysisResult) -> String {
    let mut out = String::new();
    for kind in AnalysisKind::ORDERED {
        if result.unavailable.contains(&kind) {
            let _ = write!(
                out,
                "<h2>{}</h2><p class=\"unavailable\">unavailable</p>",
                section_heading(kind)
            );
            continue;
        }
        match kind {
            AnalysisKind::Statistics => {
                if let Some(stats) = &result.statistics {
                    let _ = write!(
                        out,
                        "<h2>{}</h2><div class=\"card\">{} messages from {} members, \
                         {} characters, {} emotes. Busiest in the {}.</div>",
                        section_heading(kind),
                        stats.message_count,
                        stats.participant_count,
                        stats.char_count,
                        stats.emoji_count,
                        escape_html(&stats.most_active_period),
                    );
                    let _ = write!(
                        out,
                        "<div class=\"card\">{}</div>",
                        hourly_chart_html(&stats.hourly)
                    );
                    for user in &stats.top_users {
                        let _ = write!(
                            out,
                            "<div class=\"card\">{} · {} messages</div>",
                            escape_html(&user.name),
                            user.message_count
                        );
                    }
                }
            }
            AnalysisKind::Topic => {
                if !result.topics.is_empty() {
                    let _ = write!(out, "<h2>{}</h2>", section_heading(kind));
                    for topic in &result.topics {
                        let _ = write!(
                            out,
                            "<div class=\"card\"><b>{}</b> ({})<br>{}</div>",
                            escape_html(&topic.topic),
                            escape_html(&topic.contributors.join(", ")),
                            escape_html(&topic.detail)
                        );
                    }
                }
            }
            AnalysisKind::UserTitle => {
                if !result.titles.is_empty() {
                    let _ = write!(out, "<h2>{}</h2>", section_heading(kind));
                    for title in &result.titles {
                        let _ = write!(
                            out,
                            "<div class=\"card\"><b>{}</b> — {} [{}]<br>{}</div>",
                            escape_html(&title.name),
                            escape_html(&title.title),
                            escape_html(&title.mbti),
                            escape_html(&title.reason)
                        );
                    }
                }
            }
            AnalysisKind::GoldenQuote => {
                if !result.quotes.is_empty() {
                    let _ = write!(out, "<h2>{}</h2>", section_heading(kind));
                    for quote in &result.quotes {
                        let _ = write!(
                            out,
                            "<div class=\"card\">\u{201c}{}\u{201d} — {}<br><span class=\"meta\">{}</span></div>",
                            escape_html(&quote.content),
                            escape_html(&quote.sender),
                            escape_html(&quote.reason)
                        );
                    }
                }
            }
            AnalysisKind::DialoguePoll => {}
        }
    }
    out
}

/// 24 bars, heights scaled to the busiest hour, hover tooltip per bar.
fn hourly_chart_html(hourly: &[u32; 24]) -> String {
    let peak = hourly.iter().copied().max().unwrap_or(0).max(1);
    let mut out = String::from("<div class=\"chart\">");
    for (hour, &count) in hourly.iter().enumerate() {
        let pct = count * 100 / peak;
        let _ = write!(
            out,
            "<div style=\"height:{pct}%\" title=\"{hour:02}:00 \u{b7} {count}\"></div>"
        );
    }
    out.push_str("</div>");
    out
}

/// One block glyph per hour, 00:00 on the left, scaled to the busiest hour.
fn hourly_sparkline(hourly: &[u32; 24]) -> String {
    const GLYPHS: [char; 8] = ['\u{2581}', '\u{2582}', '\u{2583}', '\u{2584}', '\u{2585}', '\u{2586}', '\u{2587}', '\u{2588}'];
    let peak = hourly.iter().copied().max().unwrap_or(0).max(1);
    hourly
        .iter()
        .map(|&count| GLYPHS[(count as usize * (GLYPHS.len() - 1)) / peak as usize])
        .collect()
}

fn section_heading(kind: AnalysisKind) -> &'static str {
    match kind {
        AnalysisKind::Statistics => "Activity",
        AnalysisKind::Topic => "What was discussed",
        AnalysisKind::UserTitle => "Honorary titles",
        AnalysisKind::GoldenQuote => "Golden quotes",
        AnalysisKind::DialoguePoll => "Poll",
    }
}

/// Plain-text rendition, used both as a first-class format and as the
/// fallback when richer delivery keeps failing.
pub fn render_text(result: &AnalysisResult) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Daily digest for {} ({})",
        result.room_id,
        result.generated_at.format("%Y-%m-%d")
    );

    for kind in AnalysisKind::ORDERED {
        if result.unavailable.contains(&kind) {
            let _ = writeln!(out, "\n{}: unavailable", section_heading(kind));
            continue;
        }
        match kind {
            AnalysisKind::Statistics => {
                if let Some(stats) = &result.statistics {
                    let _ = writeln!(out, "\n{}", section_heading(kind));
                    let _ = writeln!(
                        out,
                        "  {} messages · {} members · {} chars · {} emotes · busiest {}",
                        stats.message_count,
                        stats.participant_count,
                        stats.char_count,
                        stats.emoji_count,
                        stats.most_active_period
                    );
                    let _ = writeln!(out, "  by hour: {}", hourly_sparkline(&stats.hourly));
                    for user in &stats.top_users {
                        let _ =
                            writeln!(out, "  {} — {} messages", user.name, user.message_count);
                    }
                }
            }
            AnalysisKind::Topic => {
                if !result.topics.is_empty() {
                    let _ = writeln!(out, "\n{}", section_heading(kind));
                    for topic in &result.topics {
                        let _ = writeln!(
                            out,
                            "  {} ({}): {}",
                            topic.topic,
                            topic.contributors.join(", "),
                            topic.detail
                        );
                    }
                }
            }
            AnalysisKind::UserTitle => {
                if !result.titles.is_empty() {
                    let _ = writeln!(out, "\n{}", section_heading(kind));
                    for title in &result.titles {
                        let _ = writeln!(
                            out,
                            "  {} — {} [{}]: {}",
                            title.name, title.title, title.mbti, title.reason
                        );
                    }
                }
            }
            AnalysisKind::GoldenQuote => {
                if !result.quotes.is_empty() {
                    let _ = writeln!(out, "\n{}", section_heading(kind));
                    for quote in &result.quotes {
                        let _ = writeln!(
                            out,
                            "  \u{201c}{}\u{201d} — {} ({})",
                            quote.content, quote.sender, quote.reason
                        );
                    }
                }
            }
            AnalysisKind::DialoguePoll => {
                if let Some(poll) = &result.poll {
                    let _ = writeln!(out, "\n{}", section_heading(kind));
                    let _ = writeln!(out, "  {}", poll.question);
                    for (i, option) in poll.options.iter().enumerate() {
                        let _ = writeln!(out, "  {}. {}", i + 1, option);
                    }
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GoldenQuote, Statistics, Topic};
    use chrono::{TimeZone, Utc};

    fn sample_result() -> AnalysisResult {
        let mut result =
            AnalysisResult::empty("!room:x", Utc.with_ymd_and_hms(2026, 8, 29, 9, 0, 0).unwrap());
        result.statistics = Some(Statistics {
            message_count: 120,
            participant_count: 9,
            most_active_period: "evening".to_string(),
            ..Statistics::default()
        });
        result.topics = vec![Topic {
            topic: "rust".to_string(),
            contributors: vec!["alice".to_string()],
            detail: "ownership fights".to_string(),
        }];
        result.quotes = vec![GoldenQuote {
            content: "ship it".to_string(),
            sender: "bob".to_string(),
            reason: "bold".to_string(),
        }];
        result.unavailable.insert(AnalysisKind::UserTitle);
        result
    }

    struct FakeHtml;

    #[async_trait]
    impl HtmlRenderer for FakeHtml {
        async fn render_image(&self, html: &str) -> Result<Vec<u8>, RenderError> {
            Ok(html.as_bytes().to_vec())
        }
        async fn render_pdf(&self, html: &str) -> Result<Vec<u8>, RenderError> {
            Ok(html.as_bytes().to_vec())
        }
    }

    fn renderer(html: Option<Arc<dyn HtmlRenderer>>) -> ReportRenderer {
        ReportRenderer::new(
            Box::new(FileTemplateStore::new(None)),
            html,
            std::env::temp_dir().join("roomdigest-test-reports"),
            "report_{room_id}_{date}.pdf".to_string(),
        )
    }

    #[test]
    fn text_render_is_deterministic_and_marks_unavailable() {
        let result = sample_result();
        let a = render_text(&result);
        let b = render_text(&result);
        assert_eq!(a, b);
        assert!(a.contains("Daily digest for !room:x (2026-08-29)"));
        assert!(a.contains("120 messages"));
        assert!(a.contains("Honorary titles: unavailable"));
        assert!(a.contains("\u{201c}ship it\u{201d} — bob"));
    }

    #[tokio::test]
    async fn image_without_browser_is_unavailable_with_guidance() {
        let renderer = renderer(None);
        let err = renderer
            .render(&sample_result(), OutputFormat::Image, DEFAULT_TEMPLATE_ID)
            .await
            .unwrap_err();
        match err {
            RenderError::Unavailable(guidance) => {
                assert!(guidance.contains("browser"));
                assert!(guidance.contains("text"));
            }
            other => panic!("expected Unavailable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_template_falls_back_to_default() {
        let renderer = renderer(Some(Arc::new(FakeHtml)));
        let report = renderer
            .render(&sample_result(), OutputFormat::Image, "no-such-template")
            .await
            .unwrap();
        assert_eq!(report.template_id, DEFAULT_TEMPLATE_ID);
        if let Payload::Bytes(bytes) = &report.payload {
            let html = String::from_utf8_lossy(bytes);
            assert!(html.contains("Daily digest"));
            assert!(html.contains("!room:x"));
        } else {
            panic!("expected bytes");
        }
    }

    #[test]
    fn template_store_always_lists_builtin() {
        let store = FileTemplateStore::new(None);
        assert_eq!(store.list(), vec![DEFAULT_TEMPLATE_ID.to_string()]);
        assert!(store.get(DEFAULT_TEMPLATE_ID).is_some());
        assert!(store.get("missing").is_none());
    }

    #[test]
    fn hourly_chart_scales_bars_to_the_peak_hour() {
        let mut hourly = [0u32; 24];
        hourly[9] = 40;
        hourly[21] = 10;
        let html = hourly_chart_html(&hourly);
        assert_eq!(html.matches("<div style=").count(), 24);
        assert!(html.contains("height:100%\" title=\"09:00 \u{b7} 40\""));
        assert!(html.contains("height:25%\" title=\"21:00 \u{b7} 10\""));
        assert!(html.contains("height:0%\" title=\"00:00 \u{b7} 0\""));
    }

    #[test]
    fn text_render_carries_the_hourly_line() {
        let mut result = sample_result();
        let mut hourly = [0u32; 24];
        hourly[12] = 7;
        if let Some(stats) = result.statistics.as_mut() {
            stats.hourly = hourly;
        }
        let text = render_text(&result);
        let line = text
            .lines()
            .find(|l| l.trim_start().starts_with("by hour:"))
            .unwrap();
        assert_eq!(line.trim_start().trim_start_matches("by hour: ").chars().count(), 24);
        assert!(line.contains('\u{2588}'));
    }

    #[test]
    fn html_escapes_user_content() {
        let mut result = sample_result();
        result.topics[0].topic = "<script>alert(1)</script>".to_string();
        let html = fill_template(SCRAPBOOK_TEMPLATE, &result);
        assert!(!html.contains("<script>alert"));
        assert!(html.contains("&lt;script&gt;"));
    }
}
