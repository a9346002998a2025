use super::archive::ArchiveSummary;
use std::fmt::Write as _;

/// Largest text file rendered inline (1 MiB); longer files are cut.
const MAX_PREVIEW_LEN: usize = 1_048_576;

/// What a preview request produces for a given file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewKind {
    Html,
    Text,
    Archive,
    Unsupported,
}

impl PreviewKind {
    pub fn for_filename(filename: &str) -> Self {
        match extension(filename).as_str() {
            "html" | "htm" => Self::Html,
            "txt" => Self::Text,
            _ if super::archive::is_archive_name(filename) => Self::Archive,
            _ => Self::Unsupported,
        }
    }
}

fn extension(filename: &str) -> String {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default()
}

/// Guess MIME type from filename extension.
pub fn guess_mime_type(filename: &str) -> &'static str {
    match extension(filename).as_str() {
        "txt" => "text/plain; charset=utf-8",
        "html" | "htm" => "text/html; charset=utf-8",
        "pdf" => "application/pdf",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "zip" => "application/zip",
        "rar" => "application/vnd.rar",
        "7z" => "application/x-7z-compressed",
        "tar" => "application/x-tar",
        "gz" | "tgz" => "application/gzip",
        "bz2" => "application/x-bzip2",
        "xz" => "application/x-xz",
        _ => "application/octet-stream",
    }
}

/// Wrap plain text in a minimal HTML page.
pub fn render_text_page(filename: &str, data: &[u8]) -> String {
    let text = String::from_utf8_lossy(&data[..data.len().min(MAX_PREVIEW_LEN)]);
    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>Text preview - {name}</title>\n\
         <style>\nbody {{ font-family: 'Courier New', monospace; padding: 20px; background: #f5f5f5; }}\n\
         .container {{ background: white; padding: 20px; border-radius: 8px; }}\n\
         pre {{ white-space: pre-wrap; word-wrap: break-word; margin: 0; }}\n</style>\n</head>\n\
         <body>\n<div class=\"container\">\n<h2>File: {name}</h2>\n<pre>{body}</pre>\n</div>\n</body>\n</html>\n",
        name = escape_html(filename),
        body = escape_html(&text),
    )
}

/// List an archive summary as an HTML page linking back to the download.
pub fn render_archive_page(
    filename: &str,
    summary: &ArchiveSummary,
    download_href: &str,
) -> String {
    let mut items = String::new();
    for name in &summary.file_list {
        let _ = write!(items, "<li>{}</li>", escape_html(name));
    }
    if summary.has_more {
        items.push_str("<li><em>... more files</em></li>");
    }
    if let Some(err) = &summary.error {
        let _ = write!(items, "<li><strong>Error:</strong> {}</li>", escape_html(err));
    }
    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>Archive preview - {name}</title>\n\
         <style>\nbody {{ font-family: Arial, sans-serif; padding: 20px; background: #f5f5f5; }}\n\
         .container {{ background: white; padding: 20px; border-radius: 8px; }}\n\
         .file-list li {{ margin: 5px 0; font-family: 'Courier New', monospace; }}\n</style>\n</head>\n\
         <body>\n<div class=\"container\">\n<h2>Archive: {name}</h2>\n\
         <p><strong>Type:</strong> {kind}</p>\n<p><strong>Files:</strong> {count}</p>\n\
         <p><strong>Total size:</strong> {size} bytes</p>\n\
         <div class=\"file-list\"><h3>Contents</h3><ul>{items}</ul></div>\n\
         <a href=\"{href}\">Download archive</a>\n</div>\n</body>\n</html>\n",
        name = escape_html(filename),
        kind = escape_html(&summary.kind.to_ascii_uppercase()),
        count = summary.file_count,
        size = summary.total_size,
        items = items,
        href = escape_html(download_href),
    )
}

pub fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_kinds() {
        assert_eq!(PreviewKind::for_filename("Report.HTM"), PreviewKind::Html);
        assert_eq!(PreviewKind::for_filename("notes.txt"), PreviewKind::Text);
        assert_eq!(PreviewKind::for_filename("bundle.zip"), PreviewKind::Archive);
        assert_eq!(PreviewKind::for_filename("photo.png"), PreviewKind::Unsupported);
    }

    #[test]
    fn text_page_escapes_markup() {
        let page = render_text_page("a<b>.txt", b"<script>alert(1)</script>");
        assert!(page.contains("&lt;script&gt;"));
        assert!(!page.contains("<script>"));
        assert!(page.contains("a&lt;b&gt;.txt"));
    }

    #[test]
    fn archive_page_lists_names_and_more_marker() {
        let summary = ArchiveSummary {
            kind: "zip".into(),
            file_count: 12,
            total_size: 300,
            file_list: vec!["a.txt".into(), "b.txt".into()],
            has_more: true,
            error: None,
        };
        let page = render_archive_page("x.zip", &summary, "/download/x.zip");
        assert!(page.contains("<li>a.txt</li>"));
        assert!(page.contains("more files"));
        assert!(page.contains("<strong>Type:</strong> ZIP"));
        assert!(page.contains("href=\"/download/x.zip\""));
    }

    #[test]
    fn mime_guesses() {
        assert_eq!(guess_mime_type("x.PDF"), "application/pdf");
        assert_eq!(guess_mime_type("noext"), "application/octet-stream");
    }
}
