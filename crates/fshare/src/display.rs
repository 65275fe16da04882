//! Terminal presentation: banner, file table, prompts and share panels

use std::io::{self, Write};
use std::path::Path;

use fileserver::{FileInfo, TunnelInfo, TunnelProvider};
use tokio::sync::oneshot;
use walkdir::WalkDir;

use crate::archive::{ArchiveProgress, ItemKind};

const BANNER: &str = r"
  __     _
 / _|___| |__   __ _ _ __ ___
| |_/ __| '_ \ / _` | '__/ _ \
|  _\__ \ | | | (_| | | |  __/
|_| |___/_| |_|\__,_|_|  \___|
";

const RULE_WIDTH: usize = 60;

/// One row of the file table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRow {
    pub name: String,
    pub kind: &'static str,
    pub size: u64,
}

impl FileRow {
    /// Describe a path on disk; directory sizes are summed recursively
    pub fn from_path(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        if path.is_dir() {
            Self {
                name,
                kind: "Directory",
                size: dir_size(path),
            }
        } else {
            Self {
                name,
                kind: "File",
                size: path.metadata().map(|m| m.len()).unwrap_or(0),
            }
        }
    }
}

/// Format a byte count in human-readable form
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];

    if bytes == 0 {
        return "0 B".to_string();
    }

    let bytes = bytes as f64;
    let unit_index = (bytes.ln() / 1024_f64.ln()).floor() as usize;
    let unit_index = unit_index.min(UNITS.len() - 1);
    let size = bytes / 1024_f64.powi(unit_index as i32);

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Space saved by compression, in percent of the original size
pub fn compression_ratio(original: u64, compressed: u64) -> Option<f64> {
    if original == 0 {
        return None;
    }
    Some((1.0 - compressed as f64 / original as f64) * 100.0)
}

pub fn dir_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|metadata| metadata.len())
        .sum()
}

pub fn print_banner() {
    println!("{}", BANNER);
    println!("  Share files instantly from your terminal\n");
}

pub fn render_table(rows: &[FileRow]) -> String {
    let name_width = rows
        .iter()
        .map(|row| row.name.chars().count())
        .chain(std::iter::once("Name".len()))
        .max()
        .unwrap_or(4);

    let mut out = format!("{:<name_width$}  {:<9}  {:>12}\n", "Name", "Type", "Size");
    out.push_str(&format!("{}\n", "-".repeat(name_width + 25)));
    for row in rows {
        out.push_str(&format!(
            "{:<name_width$}  {:<9}  {:>12}\n",
            row.name,
            row.kind,
            format_size(row.size)
        ));
    }
    out
}

pub fn print_file_table(rows: &[FileRow]) {
    println!("Files to share:\n");
    print!("{}", render_table(rows));
    println!();
}

pub fn print_archive_progress(progress: &ArchiveProgress<'_>) {
    let kind = match progress.kind {
        ItemKind::File => "file",
        ItemKind::Directory => "directory",
    };
    println!(
        "  [{}/{}] Added {}: {}",
        progress.index,
        progress.total,
        kind,
        progress.item.display()
    );
}

pub fn print_archive_summary(original: u64, compressed: u64) {
    println!();
    println!("Original size:   {}", format_size(original));
    println!("Compressed size: {}", format_size(compressed));
    if let Some(ratio) = compression_ratio(original, compressed) {
        println!("Compression:     {:.1}%", ratio);
    }
    println!();
}

/// Ask a yes/no question; an empty answer means yes
///
/// Stdin is read on a detached thread, so dropping the returned future
/// stops waiting without blocking runtime shutdown.
pub async fn confirm(prompt: &str) -> io::Result<bool> {
    print!("{} [Y/n] ", prompt);
    io::stdout().flush()?;

    let (tx, rx) = oneshot::channel();
    std::thread::Builder::new()
        .name("fshare-prompt".to_string())
        .spawn(move || {
            let mut answer = String::new();
            let result = io::stdin()
                .read_line(&mut answer)
                .map(|_| parse_answer(&answer));
            let _ = tx.send(result);
        })?;

    rx.await
        .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "prompt reader exited"))?
}

fn parse_answer(answer: &str) -> bool {
    matches!(answer.trim().to_lowercase().as_str(), "" | "y" | "yes")
}

pub fn print_ready(file: &FileInfo, provider: TunnelProvider) {
    println!("{}", "=".repeat(RULE_WIDTH));
    println!("Ready to share: {} ({})", file.download_name, format_size(file.size));
    match provider {
        TunnelProvider::None => println!("Serving locally, no tunnel"),
        provider => println!("Starting {} tunnel...", provider.name()),
    }
    println!("Press Ctrl+C to stop sharing");
    println!("{}", "=".repeat(RULE_WIDTH));
}

pub fn print_public_url(info: &TunnelInfo) {
    println!();
    println!("Share link ({}):", info.provider);
    println!();
    println!("    {}", info.public_url);
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(10), "10.00 B");
        assert_eq!(format_size(1024), "1.00 KB");
        assert_eq!(format_size(1536), "1.50 KB");
        assert_eq!(format_size(1024 * 1024 * 5), "5.00 MB");
        assert_eq!(format_size(1024_u64.pow(3) * 2), "2.00 GB");
    }

    #[test]
    fn test_compression_ratio() {
        assert_eq!(compression_ratio(0, 10), None);
        assert_eq!(compression_ratio(100, 25), Some(75.0));
        assert!(compression_ratio(100, 120).unwrap() < 0.0);
    }

    #[test]
    fn test_parse_answer() {
        assert!(parse_answer("\n"));
        assert!(parse_answer("y\n"));
        assert!(parse_answer(" YES "));
        assert!(!parse_answer("n\n"));
        assert!(!parse_answer("nope"));
    }

    #[test]
    fn test_file_rows() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        fs::write(&file, b"0123456789").unwrap();
        let sub = dir.path().join("docs");
        fs::create_dir_all(sub.join("deep")).unwrap();
        fs::write(sub.join("one.md"), b"12345").unwrap();
        fs::write(sub.join("deep/two.md"), b"123").unwrap();

        assert_eq!(
            FileRow::from_path(&file),
            FileRow {
                name: "a.txt".to_string(),
                kind: "File",
                size: 10
            }
        );
        assert_eq!(
            FileRow::from_path(&sub),
            FileRow {
                name: "docs".to_string(),
                kind: "Directory",
                size: 8
            }
        );
    }

    #[test]
    fn test_render_table_aligns_columns() {
        let rows = vec![
            FileRow {
                name: "a.txt".to_string(),
                kind: "File",
                size: 10,
            },
            FileRow {
                name: "holiday-photos".to_string(),
                kind: "Directory",
                size: 2048,
            },
        ];

        let table = render_table(&rows);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("Name"));
        assert!(lines[2].starts_with("a.txt "));
        assert!(lines[2].ends_with("10.00 B"));
        assert!(lines[3].ends_with("2.00 KB"));
        assert_eq!(lines[0].len(), lines[2].len());
    }
}
