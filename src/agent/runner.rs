use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::agent::LineType;
use crate::config::AgentSpec;
use crate::usage::UsageMetrics;

/// Something the subprocess reported, already classified
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Output {
        content: String,
        line_type: LineType,
        metadata: Value,
    },
    ToolUse {
        tool: String,
        input: Value,
    },
    Model(String),
    Usage(UsageMetrics),
}

impl StreamItem {
    fn output(content: impl Into<String>, line_type: LineType) -> Self {
        Self::Output {
            content: content.into(),
            line_type,
            metadata: Value::Null,
        }
    }
}

/// How a supervised run ended
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Exit status 0
    Exited,
    /// Non-zero exit or a supervision error
    Failed(String),
    TimedOut(Duration),
    /// Cancelled by the owner
    Killed,
}

impl RunOutcome {
    pub fn error(&self) -> Option<String> {
        match self {
            Self::Exited | Self::Killed => None,
            Self::Failed(message) => Some(message.clone()),
            Self::TimedOut(after) => Some(format!("Timed out after {}", format_duration(*after))),
        }
    }
}

fn format_duration(d: Duration) -> String {
    if d.as_secs() >= 60 {
        format!("{} minutes", d.as_secs() / 60)
    } else if d.as_secs() >= 1 {
        format!("{} seconds", d.as_secs())
    } else {
        format!("{}ms", d.as_millis())
    }
}

// Line-delimited JSON emitted by the agent CLI in stream-json mode

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    Assistant {
        message: AssistantMessage,
    },
    ContentBlockDelta {
        delta: Delta,
    },
    #[serde(rename = "result")]
    Final {
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        total_cost_usd: Option<f64>,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<RawUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Delta {
    ThinkingDelta {
        #[serde(default)]
        thinking: String,
    },
    TextDelta {
        #[serde(default)]
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawUsage {
    input_tokens: u64,
    output_tokens: u64,
    cache_read_input_tokens: u64,
    cache_creation_input_tokens: u64,
}

/// Classify one line of subprocess stdout. Lines that are not JSON are kept as text.
pub fn parse_stream_line(line: &str) -> Vec<StreamItem> {
    let line = line.trim();
    if line.is_empty() {
        return Vec::new();
    }
    let event: StreamEvent = match serde_json::from_str(line) {
        Ok(event) => event,
        Err(_) => return vec![StreamItem::output(line, LineType::Text)],
    };

    let mut items = Vec::new();
    match event {
        StreamEvent::Assistant { message } => {
            if let Some(model) = message.model {
                items.push(StreamItem::Model(model));
            }
            for block in message.content {
                match block {
                    ContentBlock::Thinking { thinking } if !thinking.is_empty() => {
                        items.push(StreamItem::output(thinking, LineType::Thinking));
                    }
                    ContentBlock::Text { text } if !text.is_empty() => {
                        items.push(StreamItem::output(text, LineType::Text));
                    }
                    ContentBlock::ToolUse { name, input } => {
                        let tool = name.unwrap_or_else(|| "unknown".into());
                        items.push(StreamItem::ToolUse {
                            tool: tool.clone(),
                            input: input.clone(),
                        });
                        items.push(StreamItem::Output {
                            content: format!("Using tool: {tool}"),
                            line_type: LineType::ToolUse,
                            metadata: json!({ "tool": tool, "input": input }),
                        });
                    }
                    _ => {}
                }
            }
            if let Some(usage) = message.usage {
                items.push(StreamItem::Usage(UsageMetrics {
                    input_tokens: usage.input_tokens,
                    output_tokens: usage.output_tokens,
                    cache_read_tokens: usage.cache_read_input_tokens,
                    cache_creation_tokens: usage.cache_creation_input_tokens,
                    cost_usd: 0.0,
                    requests: 1,
                }));
            }
        }
        StreamEvent::ContentBlockDelta { delta } => match delta {
            Delta::ThinkingDelta { thinking } if !thinking.is_empty() => {
                items.push(StreamItem::output(thinking, LineType::ThinkingDelta));
            }
            Delta::TextDelta { text } if !text.is_empty() => {
                items.push(StreamItem::output(text, LineType::TextDelta));
            }
            _ => {}
        },
        StreamEvent::Final {
            result,
            total_cost_usd,
            is_error,
        } => {
            if let Some(result) = result.filter(|r| !r.is_empty()) {
                let line_type = if is_error { LineType::Error } else { LineType::Result };
                items.push(StreamItem::output(result, line_type));
            }
            // Per-request tokens were already counted; the final event only adds cost
            if let Some(cost) = total_cost_usd.filter(|c| *c > 0.0) {
                items.push(StreamItem::Usage(UsageMetrics {
                    cost_usd: cost,
                    ..UsageMetrics::default()
                }));
            }
        }
        StreamEvent::Other => {}
    }
    items
}

/// Signals a supervised run listens to
pub struct RunSignals {
    /// Kill at once
    pub cancel: CancellationToken,
    /// Send SIGTERM, then kill once `grace` has passed
    pub terminate: CancellationToken,
    pub grace: Duration,
    /// While `true` stdout is not read
    pub paused: watch::Receiver<bool>,
}

impl RunSignals {
    pub fn new(paused: watch::Receiver<bool>, grace: Duration) -> Self {
        Self {
            cancel: CancellationToken::new(),
            terminate: CancellationToken::new(),
            grace,
            paused,
        }
    }
}

/// Ask the process to exit. False when no signal was delivered.
#[cfg(unix)]
fn send_sigterm(child: &Child) -> bool {
    let Some(pid) = child.id().and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
        return false;
    };
    // SAFETY: kill(2) only takes integers; pid is our own child, not yet reaped
    unsafe { libc::kill(pid, libc::SIGTERM) == 0 }
}

#[cfg(not(unix))]
fn send_sigterm(_child: &Child) -> bool {
    false
}

/// A launched agent subprocess, not yet supervised
pub struct AgentProcess {
    child: Child,
    stdout: ChildStdout,
    stderr: Option<ChildStderr>,
}

impl AgentProcess {
    /// Launch `spec` with `prompt` as its final argument
    pub fn spawn(spec: &AgentSpec, prompt: &str, working_dir: &Path) -> std::io::Result<Self> {
        let mut child = Command::new(&spec.command)
            .args(spec.build_args(prompt))
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("stdout was not captured"))?;
        let stderr = child.stderr.take();
        debug!(command = %spec.command, pid = ?child.id(), "Agent process spawned");
        Ok(Self {
            child,
            stdout,
            stderr,
        })
    }

    /// Stream output into `sink` until the process ends, is cancelled or times out.
    ///
    /// While paused stdout is not read, so the process stalls once its pipe
    /// fills. The timeout keeps running while paused. After `terminate` the
    /// process has `grace` to exit on its own; output is read regardless of
    /// pause, and the run always ends as [`RunOutcome::Killed`].
    pub async fn supervise(
        mut self,
        sink: mpsc::Sender<StreamItem>,
        signals: RunSignals,
        timeout: Duration,
    ) -> RunOutcome {
        let RunSignals {
            cancel,
            terminate,
            grace,
            mut paused,
        } = signals;
        let stderr_task = self.stderr.take().map(|stderr| {
            let sink = sink.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line.trim().is_empty() {
                        continue;
                    }
                    if sink.send(StreamItem::output(line, LineType::Stderr)).await.is_err() {
                        break;
                    }
                }
            })
        });

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let grace_deadline = tokio::time::sleep(grace);
        tokio::pin!(grace_deadline);

        let mut lines = BufReader::new(self.stdout).lines();
        let mut stdout_open = true;
        let mut pause_live = true;
        let mut terminating = false;

        let outcome = loop {
            let reading = terminating || !*paused.borrow();
            tokio::select! {
                _ = cancel.cancelled() => {
                    if let Err(e) = self.child.kill().await {
                        warn!(error = %e, "Failed to kill agent process");
                    }
                    break RunOutcome::Killed;
                }
                _ = &mut deadline => {
                    if let Err(e) = self.child.kill().await {
                        warn!(error = %e, "Failed to kill timed out agent process");
                    }
                    break RunOutcome::TimedOut(timeout);
                }
                _ = terminate.cancelled(), if !terminating => {
                    terminating = true;
                    grace_deadline.as_mut().reset(tokio::time::Instant::now() + grace);
                    if send_sigterm(&self.child) {
                        debug!(?grace, "Sent SIGTERM to agent process");
                    } else if let Err(e) = self.child.start_kill() {
                        warn!(error = %e, "Failed to kill agent process");
                    }
                }
                _ = &mut grace_deadline, if terminating => {
                    debug!(?grace, "Agent process outlived its grace period");
                    if let Err(e) = self.child.kill().await {
                        warn!(error = %e, "Failed to kill agent process");
                    }
                    break RunOutcome::Killed;
                }
                changed = paused.changed(), if pause_live => {
                    if changed.is_err() {
                        pause_live = false;
                    }
                }
                line = lines.next_line(), if reading && stdout_open => match line {
                    Ok(Some(line)) => {
                        for item in parse_stream_line(&line) {
                            if sink.send(item).await.is_err() {
                                debug!("Output sink closed");
                            }
                        }
                    }
                    Ok(None) => stdout_open = false,
                    Err(e) => {
                        warn!(error = %e, "Agent stdout read failed");
                        stdout_open = false;
                    }
                },
                status = self.child.wait(), if !stdout_open => {
                    if terminating {
                        break RunOutcome::Killed;
                    }
                    break match status {
                        Ok(status) if status.success() => RunOutcome::Exited,
                        Ok(status) => match status.code() {
                            Some(code) => RunOutcome::Failed(format!("Exit code: {code}")),
                            None => RunOutcome::Failed("Terminated by signal".into()),
                        },
                        Err(e) => RunOutcome::Failed(e.to_string()),
                    };
                }
            }
        };

        if let Some(task) = stderr_task {
            if matches!(outcome, RunOutcome::Exited | RunOutcome::Failed(_)) {
                // Let trailing stderr land before the run is closed
                let abort = task.abort_handle();
                if tokio::time::timeout(Duration::from_secs(1), task).await.is_err() {
                    abort.abort();
                }
            } else {
                task.abort();
            }
        }
        outcome
    }
}
