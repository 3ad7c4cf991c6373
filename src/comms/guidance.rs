use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::agent::{AgentSnapshot, AgentType};
use crate::config::{Config, GuidanceSettings};
use crate::error::{Error, Result};

/// One appended piece of guidance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuidanceEntry {
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub content: String,
}

fn header_regex() -> &'static Regex {
    static HEADER: OnceLock<Regex> = OnceLock::new();
    HEADER.get_or_init(|| {
        Regex::new(r"^<!-- Injected: (\S+) Source: (\S+) -->$").expect("valid header regex")
    })
}

/// File names are derived from ids; anything outside `[A-Za-z0-9_-]` is replaced
fn file_stem(agent_id: &str) -> String {
    agent_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Durable, append-only guidance files, one per agent id.
///
/// This is the source of truth for operator guidance; agents poll these
/// files on their own schedule. Appends for the same id are serialized.
pub struct GuidanceChannel {
    guidance_dir: PathBuf,
    agent_state_dir: PathBuf,
    locks: DashMap<String, Arc<Mutex<()>>>,
    settings: GuidanceSettings,
}

impl GuidanceChannel {
    pub fn new(
        guidance_dir: impl Into<PathBuf>,
        agent_state_dir: impl Into<PathBuf>,
        settings: GuidanceSettings,
    ) -> Result<Self> {
        let guidance_dir = guidance_dir.into();
        let agent_state_dir = agent_state_dir.into();
        std::fs::create_dir_all(&guidance_dir)?;
        std::fs::create_dir_all(&agent_state_dir)?;
        Ok(Self {
            guidance_dir,
            agent_state_dir,
            locks: DashMap::new(),
            settings,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(
            config.guidance_dir(),
            config.agent_state_dir(),
            config.guidance.clone(),
        )
    }

    pub fn guidance_path(&self, agent_id: &str) -> PathBuf {
        self.guidance_dir.join(format!("{}.md", file_stem(agent_id)))
    }

    fn agent_state_path(&self, agent_id: &str) -> PathBuf {
        self.agent_state_dir.join(format!("{}.json", file_stem(agent_id)))
    }

    fn lock_for(&self, agent_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(agent_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Append guidance, retrying with backoff before giving up
    pub async fn append(&self, agent_id: &str, content: &str, source: &str) -> Result<GuidanceEntry> {
        let source = source.split_whitespace().collect::<Vec<_>>().join("-").replace('>', "");
        let entry = GuidanceEntry {
            timestamp: Utc::now(),
            source: if source.is_empty() { "user".into() } else { source },
            content: content.trim_end_matches('\n').to_string(),
        };
        let record = format!(
            "<!-- Injected: {} Source: {} -->\n{}\n",
            entry.timestamp.to_rfc3339(),
            entry.source,
            entry.content
        );
        let path = self.guidance_path(agent_id);
        let attempts = self.settings.retry_attempts.max(1);

        let lock = self.lock_for(agent_id);
        let _guard = lock.lock().await;

        let mut attempt = 1;
        loop {
            match append_durably(&self.guidance_dir, &path, record.as_bytes()).await {
                Ok(()) => {
                    debug!(agent_id, bytes = record.len(), "Guidance appended");
                    return Ok(entry);
                }
                Err(e) if attempt < attempts => {
                    let delay = Duration::from_millis(
                        self.settings.retry_base_ms.saturating_mul(1u64 << (attempt - 1).min(16)),
                    );
                    warn!(agent_id, attempt, error = %e, "Guidance append failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(Error::ChannelFailure {
                        id: agent_id.to_string(),
                        attempts,
                        source: e,
                    })
                }
            }
        }
    }

    /// Every entry for the agent, in append order
    pub async fn entries(&self, agent_id: &str) -> Result<Vec<GuidanceEntry>> {
        let path = self.guidance_path(agent_id);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(parse_entries(&content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Concatenated guidance bodies without their headers
    pub async fn read_guidance(&self, agent_id: &str) -> Result<Option<String>> {
        let body = self
            .entries(agent_id)
            .await?
            .into_iter()
            .map(|e| e.content)
            .collect::<Vec<_>>()
            .join("\n\n");
        let body = body.trim();
        Ok(if body.is_empty() { None } else { Some(body.to_string()) })
    }

    /// Guidance addressed to any agent whose id starts with `prefix`
    pub async fn read_for_type(&self, prefix: &str) -> Result<Option<String>> {
        let all = self.list_guidance().await?;
        let bodies: Vec<String> = all
            .into_iter()
            .filter(|(id, _)| id.starts_with(prefix))
            .map(|(_, body)| body)
            .collect();
        Ok(if bodies.is_empty() { None } else { Some(bodies.join("\n\n")) })
    }

    pub async fn has_guidance(&self, agent_id: &str) -> bool {
        match tokio::fs::metadata(self.guidance_path(agent_id)).await {
            Ok(meta) => meta.len() > 0,
            Err(_) => false,
        }
    }

    /// Pending guidance keyed by file stem
    pub async fn list_guidance(&self) -> Result<BTreeMap<String, String>> {
        let mut result = BTreeMap::new();
        let mut dir = match tokio::fs::read_dir(&self.guidance_dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(result),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Some(body) = self.read_guidance(stem).await? {
                result.insert(stem.to_string(), body);
            }
        }
        Ok(result)
    }

    pub async fn clear_guidance(&self, agent_id: &str) -> Result<()> {
        let lock = self.lock_for(agent_id);
        let _guard = lock.lock().await;
        match tokio::fs::remove_file(self.guidance_path(agent_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Append the same guidance to every agent with saved state of `agent_type`
    pub async fn broadcast_guidance(
        &self,
        agent_type: AgentType,
        content: &str,
        source: &str,
    ) -> Result<Vec<String>> {
        let mut delivered = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.agent_state_dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let snapshot = match read_snapshot(&path).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable agent state");
                    continue;
                }
            };
            if snapshot.agent_type == agent_type {
                self.append(&snapshot.id, content, source).await?;
                delivered.push(snapshot.id);
            }
        }
        delivered.sort();
        Ok(delivered)
    }

    /// Persist an agent snapshot for recovery
    pub async fn save_agent_state(&self, snapshot: &AgentSnapshot) -> Result<()> {
        let content = serde_json::to_string_pretty(snapshot)?;
        tokio::fs::create_dir_all(&self.agent_state_dir).await?;
        tokio::fs::write(self.agent_state_path(&snapshot.id), content).await?;
        Ok(())
    }

    pub async fn load_agent_state(&self, agent_id: &str) -> Result<Option<AgentSnapshot>> {
        let path = self.agent_state_path(agent_id);
        match read_snapshot(&path).await {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(Error::Io(e)) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn clear_agent_state(&self, agent_id: &str) -> Result<()> {
        match tokio::fs::remove_file(self.agent_state_path(agent_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

async fn read_snapshot(path: &Path) -> Result<AgentSnapshot> {
    let content = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&content)?)
}

async fn append_durably(dir: &Path, path: &Path, bytes: &[u8]) -> io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(bytes).await?;
    file.sync_data().await
}

fn parse_entries(content: &str) -> Vec<GuidanceEntry> {
    let mut entries = Vec::new();
    let mut current: Option<(GuidanceEntry, Vec<&str>)> = None;

    for line in content.lines() {
        if let Some(caps) = header_regex().captures(line) {
            if let Some((mut entry, body)) = current.take() {
                entry.content = body.join("\n");
                entries.push(entry);
            }
            let timestamp = DateTime::parse_from_rfc3339(&caps[1])
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now());
            current = Some((
                GuidanceEntry {
                    timestamp,
                    source: caps[2].to_string(),
                    content: String::new(),
                },
                Vec::new(),
            ));
        } else if let Some((_, body)) = current.as_mut() {
            body.push(line);
        } else if !line.trim().is_empty() {
            // Hand-written guidance without a header
            current = Some((
                GuidanceEntry {
                    timestamp: Utc::now(),
                    source: "file".into(),
                    content: String::new(),
                },
                vec![line],
            ));
        }
    }
    if let Some((mut entry, body)) = current {
        entry.content = body.join("\n");
        entries.push(entry);
    }
    entries
}
