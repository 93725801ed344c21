//! Pattern-match-and-act engine over a worker's output stream.
//!
//! A worker picks its real server port itself and only announces it in a
//! startup banner on stdout. Rather than hard-coding the banner format, the
//! engine is configured with a regex carrying named capture groups and a
//! command template; each matching line yields a substituted command string
//! that the sink may interpret as a value, execute, or both.
//!
//! Parsing happens once ([`ActionTemplate::new`]); rendering a line is pure
//! ([`ActionTemplate::render`]); acting on the rendered string is the
//! sink's job, keeping the two concerns separated.

use crate::error::{CoreError, Result};
use crate::manager::LeaseManager;
use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt};

/// Placeholder syntax inside command templates: `<group_name>`.
const PLACEHOLDER: &str = r"<([A-Za-z_][A-Za-z0-9_]*)>";

/// A compiled (pattern, template) pair.
#[derive(Debug, Clone)]
pub struct ActionTemplate {
    pattern: Regex,
    group_names: Vec<String>,
    template: String,
}

/// The result of one matching line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchOutput {
    /// Template with every `<group>` placeholder substituted.
    pub command: String,
    /// All named capture groups and their captured text.
    pub groups: HashMap<String, String>,
}

impl ActionTemplate {
    /// Compile `pattern` and validate that every placeholder in `template`
    /// names one of its capture groups.
    pub fn new(pattern: &str, template: &str) -> Result<Self> {
        let pattern = Regex::new(pattern)?;
        let group_names: Vec<String> = pattern
            .capture_names()
            .flatten()
            .map(str::to_string)
            .collect();

        // Compiled from a literal, cannot fail.
        let placeholder = Regex::new(PLACEHOLDER).map_err(CoreError::InvalidPattern)?;
        for cap in placeholder.captures_iter(template) {
            let name = &cap[1];
            if !group_names.iter().any(|g| g == name) {
                return Err(CoreError::UnknownPlaceholder(name.to_string()));
            }
        }

        Ok(Self {
            pattern,
            group_names,
            template: template.to_string(),
        })
    }

    /// Match one line. `None` if the pattern does not match; otherwise the
    /// substituted command string plus the raw captures.
    pub fn render(&self, line: &str) -> Option<MatchOutput> {
        let caps = self.pattern.captures(line)?;

        let mut groups = HashMap::new();
        let mut command = self.template.clone();
        for name in &self.group_names {
            let value = caps.name(name).map(|m| m.as_str()).unwrap_or("");
            command = command.replace(&format!("<{name}>"), value);
            groups.insert(name.clone(), value.to_string());
        }

        Some(MatchOutput { command, groups })
    }
}

/// Receiver for rendered matches.
#[async_trait]
pub trait MatchSink: Send + Sync {
    /// Called once per matching line with the substituted command string.
    async fn on_match(&self, output: MatchOutput);
}

/// Consume a line stream, feeding every match to `sink`.
///
/// Non-matching lines are discarded (echoed to the log when `echo` is
/// set). End of stream ends the loop; read errors are logged and the loop
/// continues.
pub async fn watch<R>(reader: R, template: &ActionTemplate, echo: bool, sink: &dyn MatchSink)
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "Error reading worker output");
                continue;
            }
        };

        match template.render(&line) {
            Some(output) => {
                tracing::debug!(command = %output.command, "Worker output matched");
                sink.on_match(output).await;
            }
            None => {
                if echo {
                    tracing::info!(worker = %line, "Worker output");
                }
            }
        }
    }
    tracing::debug!("Worker output stream ended");
}

/// Where an executed command's stdout goes.
#[derive(Debug, Clone, Default)]
pub enum ExecOutput {
    /// Drop it.
    #[default]
    Discard,
    /// Write it to our own stdout.
    Echo,
    /// Append it to a log file, flushed and closed per command.
    LogFile(PathBuf),
}

/// Default sink: interpret the rendered string as the lease's server port,
/// then execute it as an external command unless dry-run.
pub struct ExecSink {
    manager: LeaseManager,
    lease_id: u64,
    dry_run: bool,
    output: ExecOutput,
}

impl ExecSink {
    /// Build a sink bound to one lease.
    pub fn new(manager: LeaseManager, lease_id: u64, dry_run: bool, output: ExecOutput) -> Self {
        Self {
            manager,
            lease_id,
            dry_run,
            output,
        }
    }

    /// Run the rendered command: first whitespace token is the program,
    /// the rest its arguments. Never called while the lease table lock is
    /// held; the command may block for its full duration.
    async fn execute(&self, command: &str) {
        let mut tokens = command.split_whitespace();
        let Some(program) = tokens.next() else {
            return;
        };
        let args: Vec<&str> = tokens.collect();

        let result = tokio::process::Command::new(program)
            .args(&args)
            .output()
            .await;

        let output = match result {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!(program, error = %e, "Action command failed to run");
                return;
            }
        };

        if !output.status.success() {
            tracing::warn!(program, status = %output.status, "Action command exited nonzero");
        }

        match &self.output {
            ExecOutput::Discard => {}
            ExecOutput::Echo => {
                let mut stdout = tokio::io::stdout();
                if let Err(e) = stdout.write_all(&output.stdout).await {
                    tracing::warn!(error = %e, "Failed to echo command output");
                }
                let _ = stdout.flush().await;
            }
            ExecOutput::LogFile(path) => {
                if let Err(e) = append_log(path, &output.stdout).await {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to write command log");
                }
            }
        }
    }
}

/// Append `bytes` to the log file, creating it on first use. The handle is
/// scoped to this call and flushed before it closes.
async fn append_log(path: &PathBuf, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    Ok(())
}

#[async_trait]
impl MatchSink for ExecSink {
    async fn on_match(&self, output: MatchOutput) {
        match output.command.trim().parse::<u16>() {
            Ok(port) => {
                self.manager.set_secondary_port(self.lease_id, port).await;
            }
            Err(_) => {
                tracing::debug!(
                    command = %output.command,
                    "Rendered command is not a bare port number"
                );
            }
        }

        if self.dry_run {
            tracing::info!(command = %output.command, "Dry run, not executing");
            return;
        }
        self.execute(&output.command).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    const BANNER_PATTERN: &str = r"server listening at port (?P<port>\d+)";

    #[test]
    fn test_render_banner() {
        let template = ActionTemplate::new(BANNER_PATTERN, "<port>").unwrap();
        let output = template
            .render("server listening at port 4512")
            .expect("banner should match");
        assert_eq!(output.command, "4512");
        assert_eq!(output.groups["port"], "4512");
    }

    #[test]
    fn test_non_matching_line_is_discarded() {
        let template = ActionTemplate::new(BANNER_PATTERN, "<port>").unwrap();
        assert!(template.render("starting up...").is_none());
    }

    #[test]
    fn test_multiple_groups() {
        let template = ActionTemplate::new(
            r"bound (?P<host>[\w.]+):(?P<port>\d+)",
            "announce <host> on <port>",
        )
        .unwrap();
        let output = template.render("bound 10.0.1.136:4512").unwrap();
        assert_eq!(output.command, "announce 10.0.1.136 on 4512");
        assert_eq!(output.groups.len(), 2);
    }

    #[test]
    fn test_placeholder_may_repeat() {
        let template = ActionTemplate::new(BANNER_PATTERN, "<port> <port>").unwrap();
        let output = template.render("server listening at port 7").unwrap();
        assert_eq!(output.command, "7 7");
    }

    #[test]
    fn test_unknown_placeholder_rejected() {
        let err = ActionTemplate::new(BANNER_PATTERN, "<address>").unwrap_err();
        assert!(matches!(err, CoreError::UnknownPlaceholder(name) if name == "address"));
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let err = ActionTemplate::new("(?P<port>[", "<port>").unwrap_err();
        assert!(matches!(err, CoreError::InvalidPattern(_)));
    }

    struct Collector(Mutex<Vec<MatchOutput>>);

    #[async_trait]
    impl MatchSink for Collector {
        async fn on_match(&self, output: MatchOutput) {
            self.0.lock().unwrap().push(output);
        }
    }

    #[tokio::test]
    async fn test_watch_feeds_only_matches() {
        let template = ActionTemplate::new(BANNER_PATTERN, "<port>").unwrap();
        let sink = Collector(Mutex::new(Vec::new()));
        let input: &[u8] = b"booting\nserver listening at port 4512\ngoodbye\n";

        watch(input, &template, false, &sink).await;

        let seen = sink.0.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].command, "4512");
    }

    #[tokio::test]
    async fn test_watch_ends_on_eof() {
        let template = ActionTemplate::new(BANNER_PATTERN, "<port>").unwrap();
        let sink = Collector(Mutex::new(Vec::new()));
        watch(&b""[..], &template, false, &sink).await;
        assert!(sink.0.lock().unwrap().is_empty());
    }
}
