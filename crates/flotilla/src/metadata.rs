use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::Context;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Append `<RFC 3339 UTC> <text>` to an instance's metadata log.
pub fn append(path: &Path, text: &str) -> anyhow::Result<()> {
    let stamp = OffsetDateTime::now_utc()
        .replace_nanosecond(0)
        .unwrap_or_else(|_| OffsetDateTime::now_utc())
        .format(&Rfc3339)
        .context("failed to format timestamp")?;
    let line = text.replace('\n', " ");
    let mut f = fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    writeln!(f, "{stamp} {}", line.trim())
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

/// Every line of the log; a missing log reads as empty.
pub fn read(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .map(|raw| {
            raw.lines()
                .filter(|l| !l.trim().is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Split a log line into its timestamp and text, if it carries one.
pub fn split_line(line: &str) -> (Option<OffsetDateTime>, &str) {
    match line.split_once(' ') {
        Some((stamp, text)) => match OffsetDateTime::parse(stamp, &Rfc3339) {
            Ok(at) => (Some(at), text),
            Err(_) => (None, line),
        },
        None => (None, line),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appended_lines_are_timestamped() {
        let dir = std::env::temp_dir().join(format!("flotilla-test-metadata-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("metadata.log");

        append(&path, "Instance created (image default)").unwrap();
        append(&path, "Instance updated\n(tag v2)").unwrap();
        let lines = read(&path);
        assert_eq!(lines.len(), 2);

        let (at, text) = split_line(&lines[0]);
        assert!(at.is_some());
        assert_eq!(text, "Instance created (image default)");
        assert_eq!(split_line(&lines[1]).1, "Instance updated (tag v2)");
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_log_reads_empty() {
        assert!(read(Path::new("/nonexistent/flotilla/metadata.log")).is_empty());
    }

    #[test]
    fn untimestamped_lines_pass_through() {
        assert_eq!(split_line("hand written note"), (None, "hand written note"));
    }
}
