//! Permission broker (component C): an in-process Unix-domain-socket
//! server the agent calls via its pre-tool-use hook, deciding `allow` /
//! `deny` per tool invocation via a three-tier policy.

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::errors::BrokerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Deny,
    AllowOnce,
    AllowProject,
    AllowGlobal,
}

/// Wire request: the four hook fields plus an optional human-readable
/// description, as sent over the socket.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PermissionRequest {
    pub session_id: String,
    pub tool_name: String,
    pub tool_input: serde_json::Value,
    pub tool_use_id: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionResponse {
    pub decision: Decision,
    pub pattern: String,
}

/// Canonicalize (tool-name, tool-input) into `ToolName` or
/// `ToolName(arg)`, where `arg` is the tool-specific primary input,
/// truncated to 100 chars at the first newline.
pub fn compute_pattern(tool_name: &str, tool_input: &serde_json::Value) -> String {
    let arg = primary_arg(tool_name, tool_input);
    let arg = match arg.find('\n') {
        Some(idx) => &arg[..idx],
        None => &arg,
    };
    let arg: String = arg.chars().take(100).collect();
    if arg.is_empty() {
        tool_name.to_string()
    } else {
        format!("{tool_name}({arg})")
    }
}

fn primary_arg(tool_name: &str, tool_input: &serde_json::Value) -> String {
    let field = match tool_name {
        "Bash" => "command",
        "Read" | "Write" | "Edit" => "path",
        "WebFetch" => "url",
        "Glob" | "Grep" => "pattern",
        _ => "",
    };
    if !field.is_empty()
        && let Some(s) = tool_input.get(field).and_then(|v| v.as_str())
    {
        return s.to_string();
    }
    if tool_input.is_null() || matches!(tool_input, serde_json::Value::Object(m) if m.is_empty()) {
        String::new()
    } else {
        tool_input.to_string()
    }
}

/// `match(pattern, target)`: tools must match; an empty pattern arg
/// grants any arg; a `prefix:*` pattern arg prefix-matches; otherwise
/// args must be exactly equal.
pub fn pattern_matches(pattern: &str, target: &str) -> bool {
    if pattern == target {
        return true;
    }
    let (p_tool, p_arg) = split_pattern(pattern);
    let (t_tool, t_arg) = split_pattern(target);
    if p_tool != t_tool {
        return false;
    }
    if p_arg.is_empty() {
        return true;
    }
    if let Some(prefix) = p_arg.strip_suffix(":*") {
        return t_arg.starts_with(prefix);
    }
    p_arg == t_arg
}

fn split_pattern(pattern: &str) -> (&str, &str) {
    match pattern.find('(') {
        Some(idx) => {
            let tool = &pattern[..idx];
            let arg = pattern[idx + 1..].trim_end_matches(')');
            (tool, arg)
        }
        None => (pattern, ""),
    }
}

/// Per-session mapping of granted patterns; never persisted.
#[derive(Default)]
pub struct SessionCache {
    inner: Mutex<HashMap<String, HashSet<String>>>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn allows(&self, session_id: &str, target: &str) -> bool {
        let map = self.inner.lock().await;
        map.get(session_id)
            .is_some_and(|patterns| patterns.iter().any(|p| pattern_matches(p, target)))
    }

    pub async fn insert(&self, session_id: &str, pattern: String) {
        let mut map = self.inner.lock().await;
        map.entry(session_id.to_string()).or_default().insert(pattern);
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Permissions {
    #[serde(default)]
    allow: Vec<String>,
    #[serde(default)]
    deny: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AllowListDoc {
    #[serde(default)]
    permissions: Permissions,
}

/// A persisted project/global allow-list file:
/// `{"permissions":{"allow":[…],"deny":[…]}}`.
pub struct AllowList {
    path: PathBuf,
}

impl AllowList {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn load(&self) -> Result<AllowListDoc, BrokerError> {
        if !self.path.exists() {
            return Ok(AllowListDoc::default());
        }
        let content = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&content).unwrap_or_default())
    }

    pub fn matches(&self, target: &str) -> bool {
        match self.load() {
            Ok(doc) => doc
                .permissions
                .allow
                .iter()
                .any(|p| pattern_matches(p, target)),
            Err(_) => false,
        }
    }

    /// Append `pattern` to the allow-list, under an advisory file lock.
    /// Idempotent: a pattern already present is a no-op.
    pub fn add_pattern(&self, pattern: &str) -> Result<(), BrokerError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.path)?;
        file.lock_exclusive()?;
        let result = (|| -> Result<(), BrokerError> {
            let mut doc = self.load()?;
            if doc.permissions.allow.iter().any(|p| p == pattern) {
                return Ok(());
            }
            doc.permissions.allow.push(pattern.to_string());
            let serialized =
                serde_json::to_string_pretty(&doc).map_err(BrokerError::Decode)?;
            std::fs::write(&self.path, serialized).map_err(|source| BrokerError::AllowListWrite {
                path: self.path.clone(),
                source,
            })
        })();
        let _ = fs2::FileExt::unlock(&file);
        result
    }
}

/// Synchronous callback invoked for requests that bypass every
/// pre-approved tier; represents the TUI dialog. Must never itself
/// initiate a new agent invocation.
#[async_trait::async_trait]
pub trait PermissionHandler: Send + Sync {
    async fn handle(&self, request: &PermissionRequest, pattern: &str) -> (Decision, Option<String>);
}

/// A handler that always denies; used when `--dangerously-skip-permissions`
/// is not set but no interactive handler was wired up (fail closed).
pub struct DenyAllHandler;

#[async_trait::async_trait]
impl PermissionHandler for DenyAllHandler {
    async fn handle(&self, _request: &PermissionRequest, _pattern: &str) -> (Decision, Option<String>) {
        (Decision::Deny, None)
    }
}

pub struct PermissionBroker {
    pub socket_path: PathBuf,
    session_cache: SessionCache,
    pre_allowed: Vec<String>,
    project_allow: AllowList,
    global_allow: AllowList,
    handler: Arc<dyn PermissionHandler>,
}

impl PermissionBroker {
    pub fn new(
        socket_path: PathBuf,
        pre_allowed: Vec<String>,
        project_allow_path: PathBuf,
        global_allow_path: PathBuf,
        handler: Arc<dyn PermissionHandler>,
    ) -> Self {
        Self {
            socket_path,
            session_cache: SessionCache::new(),
            pre_allowed,
            project_allow: AllowList::new(project_allow_path),
            global_allow: AllowList::new(global_allow_path),
            handler,
        }
    }

    /// Compute a decision for one request (first match wins, short-circuits).
    pub async fn decide(&self, request: PermissionRequest) -> PermissionResponse {
        let pattern = compute_pattern(&request.tool_name, &request.tool_input);

        if self.session_cache.allows(&request.session_id, &pattern).await {
            return PermissionResponse {
                decision: Decision::Allow,
                pattern,
            };
        }
        if self.project_allow.matches(&pattern) || self.global_allow.matches(&pattern) {
            return PermissionResponse {
                decision: Decision::Allow,
                pattern,
            };
        }
        if self.pre_allowed.iter().any(|p| pattern_matches(p, &pattern)) {
            return PermissionResponse {
                decision: Decision::Allow,
                pattern,
            };
        }

        let (decision, custom_pattern) = self.handler.handle(&request, &pattern).await;
        let effective_pattern = custom_pattern.unwrap_or_else(|| pattern.clone());
        match decision {
            Decision::Allow => {
                self.session_cache
                    .insert(&request.session_id, effective_pattern.clone())
                    .await;
                PermissionResponse {
                    decision: Decision::Allow,
                    pattern: effective_pattern,
                }
            }
            Decision::AllowOnce => PermissionResponse {
                decision: Decision::Allow,
                pattern: effective_pattern,
            },
            Decision::AllowProject => {
                let _ = self.project_allow.add_pattern(&effective_pattern);
                PermissionResponse {
                    decision: Decision::Allow,
                    pattern: effective_pattern,
                }
            }
            Decision::AllowGlobal => {
                let _ = self.global_allow.add_pattern(&effective_pattern);
                PermissionResponse {
                    decision: Decision::Allow,
                    pattern: effective_pattern,
                }
            }
            Decision::Deny => PermissionResponse {
                decision: Decision::Deny,
                pattern: effective_pattern,
            },
        }
    }

    /// Bind the Unix listener and serve until `cancel` trips, unlinking
    /// the socket path on exit.
    pub async fn serve(self: Arc<Self>, cancel: CancellationToken) -> Result<(), BrokerError> {
        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
        let listener = UnixListener::bind(&self.socket_path)?;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let broker = self.clone();
                            tokio::spawn(async move {
                                let _ = broker.handle_connection(stream).await;
                            });
                        }
                        Err(e) => {
                            tracing::debug!(error = %e, "broker accept failed");
                        }
                    }
                }
            }
        }
        let _ = std::fs::remove_file(&self.socket_path);
        Ok(())
    }

    async fn handle_connection(&self, stream: UnixStream) -> Result<(), BrokerError> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        reader.read_line(&mut line).await?;

        let response = match serde_json::from_str::<PermissionRequest>(line.trim_end()) {
            Ok(request) => self.decide(request).await,
            Err(_) => PermissionResponse {
                decision: Decision::Deny,
                pattern: String::new(),
            },
        };
        tracing::info!(decision = ?response.decision, pattern = %response.pattern, "permission decision");
        let mut payload = serde_json::to_vec(&response).map_err(BrokerError::Decode)?;
        payload.push(b'\n');
        writer.write_all(&payload).await?;
        Ok(())
    }
}

/// Resolve the socket path for this process: an OS-temp path containing
/// the process id.
pub fn default_socket_path() -> PathBuf {
    std::env::temp_dir().join(format!("programmator-{}.sock", std::process::id()))
}

pub fn default_project_allow_list(project_dir: &Path) -> PathBuf {
    project_dir.join(".claude").join("settings.local.json")
}

pub fn default_global_allow_list() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".claude")
        .join("settings.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn pattern_matching_laws() {
        assert!(pattern_matches("Bash", "Bash"));
        assert!(pattern_matches("Bash", "Bash(git status)"));
        assert!(pattern_matches("Bash(git:*)", "Bash(git push origin main)"));
        assert!(!pattern_matches("Bash(git:*)", "Bash(ls -la)"));
        assert!(!pattern_matches("Bash", "Read(file.rs)"));
        assert!(!pattern_matches("Bash(git status)", "Bash(git push)"));
    }

    #[test]
    fn compute_pattern_uses_tool_specific_field() {
        let input = serde_json::json!({"command": "git status"});
        assert_eq!(compute_pattern("Bash", &input), "Bash(git status)");

        let input = serde_json::json!({"path": "src/main.rs"});
        assert_eq!(compute_pattern("Read", &input), "Read(src/main.rs)");

        let input = serde_json::json!({});
        assert_eq!(compute_pattern("TodoWrite", &input), "TodoWrite");
    }

    #[test]
    fn compute_pattern_truncates_at_first_newline_and_100_chars() {
        let input = serde_json::json!({"command": "line one\nline two"});
        assert_eq!(compute_pattern("Bash", &input), "Bash(line one)");

        let long = "a".repeat(200);
        let input = serde_json::json!({"command": long});
        let pattern = compute_pattern("Bash", &input);
        assert_eq!(pattern, format!("Bash({})", "a".repeat(100)));
    }

    #[tokio::test]
    async fn session_cache_is_monotonic_once_allowed() {
        let cache = SessionCache::new();
        assert!(!cache.allows("s1", "Bash(git status)").await);
        cache.insert("s1", "Bash(git status)".to_string()).await;
        assert!(cache.allows("s1", "Bash(git status)").await);
    }

    #[test]
    fn allow_list_add_pattern_is_idempotent() {
        let dir = tempdir().unwrap();
        let list = AllowList::new(dir.path().join("settings.json"));
        list.add_pattern("Bash(git:*)").unwrap();
        list.add_pattern("Bash(git:*)").unwrap();
        let doc = list.load().unwrap();
        assert_eq!(doc.permissions.allow.len(), 1);
    }

    #[test]
    fn allow_list_matches_persisted_pattern() {
        let dir = tempdir().unwrap();
        let list = AllowList::new(dir.path().join("settings.json"));
        list.add_pattern("Bash(git:*)").unwrap();
        assert!(list.matches("Bash(git push origin main)"));
        assert!(!list.matches("Bash(rm -rf /)"));
    }

    struct RecordingHandler {
        calls: Arc<Mutex<u32>>,
        decision: Decision,
    }

    #[async_trait::async_trait]
    impl PermissionHandler for RecordingHandler {
        async fn handle(&self, _request: &PermissionRequest, _pattern: &str) -> (Decision, Option<String>) {
            *self.calls.lock().await += 1;
            (self.decision, None)
        }
    }

    #[tokio::test]
    async fn broker_caches_allow_decisions_and_skips_handler_on_repeat() {
        let dir = tempdir().unwrap();
        let calls = Arc::new(Mutex::new(0));
        let handler = Arc::new(RecordingHandler {
            calls: calls.clone(),
            decision: Decision::Allow,
        });
        let broker = PermissionBroker::new(
            dir.path().join("sock"),
            vec![],
            dir.path().join("project.json"),
            dir.path().join("global.json"),
            handler,
        );

        let request = PermissionRequest {
            session_id: "S1".into(),
            tool_name: "Bash".into(),
            tool_input: serde_json::json!({"command": "git status"}),
            tool_use_id: "t1".into(),
            description: None,
        };

        let first = broker.decide(request.clone()).await;
        assert_eq!(first.decision, Decision::Allow);
        let second = broker.decide(request).await;
        assert_eq!(second.decision, Decision::Allow);
        assert_eq!(*calls.lock().await, 1);
    }

    #[tokio::test]
    async fn broker_fails_closed_when_handler_denies() {
        let dir = tempdir().unwrap();
        let handler = Arc::new(DenyAllHandler);
        let broker = PermissionBroker::new(
            dir.path().join("sock"),
            vec![],
            dir.path().join("project.json"),
            dir.path().join("global.json"),
            handler,
        );
        let request = PermissionRequest {
            session_id: "S1".into(),
            tool_name: "Bash".into(),
            tool_input: serde_json::json!({"command": "rm -rf /"}),
            tool_use_id: "t1".into(),
            description: None,
        };
        let response = broker.decide(request).await;
        assert_eq!(response.decision, Decision::Deny);
    }

    #[tokio::test]
    async fn broker_respects_persisted_global_allow_list() {
        let dir = tempdir().unwrap();
        let global_path = dir.path().join("global.json");
        AllowList::new(global_path.clone())
            .add_pattern("Bash(git:*)")
            .unwrap();
        let calls = Arc::new(Mutex::new(0));
        let handler = Arc::new(RecordingHandler {
            calls: calls.clone(),
            decision: Decision::Deny,
        });
        let broker = PermissionBroker::new(
            dir.path().join("sock"),
            vec![],
            dir.path().join("project.json"),
            global_path,
            handler,
        );
        let request = PermissionRequest {
            session_id: "S1".into(),
            tool_name: "Bash".into(),
            tool_input: serde_json::json!({"command": "git push origin main"}),
            tool_use_id: "t1".into(),
            description: None,
        };
        let response = broker.decide(request).await;
        assert_eq!(response.decision, Decision::Allow);
        assert_eq!(*calls.lock().await, 0);
    }

    #[tokio::test]
    async fn malformed_request_json_yields_deny() {
        let dir = tempdir().unwrap();
        let handler = Arc::new(DenyAllHandler);
        let broker = Arc::new(PermissionBroker::new(
            dir.path().join("sock"),
            vec![],
            dir.path().join("project.json"),
            dir.path().join("global.json"),
            handler,
        ));
        let result: Result<PermissionRequest, _> = serde_json::from_str("not json");
        assert!(result.is_err());
        let _ = broker;
    }
}
