use std::path::Path;

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::error;

/// One project's dry-run result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportEntry {
    pub project_name: String,
    pub project_id: u64,
    pub dependencies: Vec<String>,
}

fn quote(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

/// The YAML fragment for one entry. Projects without dependencies are
/// omitted from the report entirely.
pub fn entry_fragment(entry: &ReportEntry) -> String {
    if entry.dependencies.is_empty() {
        return String::new();
    }
    let mut out = format!("{}:\n", quote(&entry.project_name));
    for dependency in &entry.dependencies {
        out.push_str("  - ");
        out.push_str(&quote(dependency));
        out.push('\n');
    }
    out
}

/// Build the complete dry-run document: a mapping of double-quoted project
/// names to sequences of double-quoted dependency paths. An empty result set
/// serializes to `{}\n`.
pub fn build_yaml_report(entries: &[ReportEntry]) -> String {
    let body: String = entries.iter().map(entry_fragment).collect();
    if body.is_empty() {
        "{}\n".to_string()
    } else {
        body
    }
}

/// Appends report fragments to a file as projects complete.
///
/// All writes go through one queue drained by a single task, so appends from
/// concurrently finishing projects never interleave mid-fragment.
pub struct ReportWriter {
    tx: mpsc::UnboundedSender<String>,
    writer: JoinHandle<std::io::Result<()>>,
}

impl ReportWriter {
    pub async fn create(path: &Path) -> std::io::Result<Self> {
        let mut file = tokio::fs::File::create(path).await?;
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        let writer = tokio::spawn(async move {
            while let Some(fragment) = rx.recv().await {
                file.write_all(fragment.as_bytes()).await?;
            }
            file.flush().await
        });

        Ok(Self { tx, writer })
    }

    pub fn append(&self, entry: &ReportEntry) {
        let fragment = entry_fragment(entry);
        if fragment.is_empty() {
            return;
        }
        if self.tx.send(fragment).is_err() {
            error!(project = %entry.project_name, "report writer task is gone, entry dropped");
        }
    }

    /// Close the queue and wait for everything queued so far to reach disk.
    pub async fn finish(self) -> std::io::Result<()> {
        drop(self.tx);
        self.writer.await.unwrap_or_else(|e| {
            Err(std::io::Error::other(format!("report writer task panicked: {e}")))
        })
    }
}
