//! Agent invoker (component D): launches the agent subprocess, streams
//! its line-delimited JSON events, and reconstructs assistant text,
//! tool-use events, diff fragments, and process stats.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::errors::InvokerError;
use crate::events::{diff_events, Event, EventSender, ToolResultEvent, ToolUseEvent};
use crate::safety::TokenUsage;

#[derive(Debug, Clone)]
pub struct InvokerConfig {
    pub agent_cmd: String,
    pub extra_flags: Vec<String>,
}

impl Default for InvokerConfig {
    fn default() -> Self {
        Self {
            agent_cmd: "claude".to_string(),
            extra_flags: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub prompt: String,
    pub working_dir: PathBuf,
    pub permission_socket: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct ProcessStats {
    pub pid: Option<u32>,
    pub peak_rss_kb: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct InvocationResult {
    pub assistant_text: String,
    pub tool_uses: Vec<ToolUseEvent>,
    pub stats: ProcessStats,
    pub token_usage: HashMap<String, TokenUsage>,
    pub model: Option<String>,
    pub stderr_tail: String,
}

// --- Streaming event schema (capability contract) -----------------------

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum StreamEvent {
    #[serde(rename = "system")]
    System {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        model: Option<String>,
    },
    #[serde(rename = "assistant")]
    Assistant { message: AssistantMessage },
    #[serde(rename = "user")]
    User { message: UserMessage },
    #[serde(rename = "result")]
    Result {
        #[serde(default)]
        usage: Option<Usage>,
        #[serde(default)]
        model: Option<String>,
    },
    /// Unknown event kinds are ignored silently rather than rejected.
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct UserMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        #[serde(default)]
        tool_use_id: String,
        #[serde(default)]
        content: ToolResultContent,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize, Default)]
#[serde(untagged)]
enum ToolResultContent {
    #[default]
    Empty,
    Text(String),
    Blocks(Vec<TextBlock>),
}

#[derive(Debug, Deserialize)]
struct TextBlock {
    #[serde(default)]
    text: String,
}

impl ToolResultContent {
    fn as_text(&self) -> String {
        match self {
            ToolResultContent::Empty => String::new(),
            ToolResultContent::Text(s) => s.clone(),
            ToolResultContent::Blocks(blocks) => blocks
                .iter()
                .map(|b| b.text.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
struct Usage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// Incremental accumulator fed one decoded line at a time; tolerant of a
/// partial trailing line, which callers buffer until a newline arrives.
#[derive(Default)]
struct StreamAccumulator {
    assistant_text: String,
    tool_uses: Vec<ToolUseEvent>,
    model: Option<String>,
    token_usage: HashMap<String, TokenUsage>,
}

impl StreamAccumulator {
    async fn apply_line(&mut self, line: &str, events: Option<&EventSender>) {
        let event: StreamEvent = match serde_json::from_str(line) {
            Ok(e) => e,
            Err(_) => return, // unknown/partial line: ignore silently
        };
        match event {
            StreamEvent::System { model, .. } => {
                if model.is_some() {
                    self.model = model;
                }
            }
            StreamEvent::Assistant { message } => {
                if message.model.is_some() {
                    self.model = message.model.clone();
                }
                if let Some(usage) = &message.usage {
                    let model = self.model.clone().unwrap_or_default();
                    let entry = self.token_usage.entry(model).or_default();
                    entry.input_tokens = usage.input_tokens;
                    entry.output_tokens += usage.output_tokens;
                }
                for block in message.content {
                    match block {
                        ContentBlock::Text { text } => {
                            self.assistant_text.push_str(&text);
                            if let Some(tx) = events {
                                let _ = tx
                                    .send(Event::AssistantText { delta: text })
                                    .await;
                            }
                        }
                        ContentBlock::ToolUse { id, name, input } => {
                            let ev = ToolUseEvent {
                                name,
                                input,
                                tool_use_id: id,
                            };
                            self.tool_uses.push(ev.clone());
                            if let Some(tx) = events {
                                let _ = tx.send(Event::ToolUse(ev)).await;
                            }
                        }
                        _ => {}
                    }
                }
            }
            StreamEvent::User { message } => {
                for block in message.content {
                    if let ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } = block
                    {
                        let text = content.as_text();
                        if let Some(tx) = events {
                            let _ = tx
                                .send(Event::ToolResult(ToolResultEvent {
                                    tool_use_id,
                                    content: text.clone(),
                                    is_error,
                                }))
                                .await;
                            for diff_event in diff_events(&text) {
                                let _ = tx.send(diff_event).await;
                            }
                        }
                    }
                }
            }
            StreamEvent::Result { usage, model } => {
                if model.is_some() {
                    self.model = model;
                }
                if let Some(usage) = usage {
                    let model = self.model.clone().unwrap_or_default();
                    let entry = self.token_usage.entry(model).or_default();
                    entry.input_tokens = usage.input_tokens;
                    entry.output_tokens = usage.output_tokens;
                }
            }
            StreamEvent::Other => {}
        }
    }
}

pub struct AgentInvoker {
    config: InvokerConfig,
}

impl AgentInvoker {
    pub fn new(config: InvokerConfig) -> Self {
        Self { config }
    }

    fn build_command(&self, request: &InvocationRequest) -> Command {
        let mut cmd = Command::new(&self.config.agent_cmd);
        cmd.current_dir(&request.working_dir)
            .arg("--print")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .args(&self.config.extra_flags);
        if let Some(socket) = &request.permission_socket {
            cmd.arg("--permission-prompt-tool-socket").arg(socket);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    /// Spawn the agent, stream its stdout, and return the reconstructed
    /// result; `cancel` trips on Stop (SIGTERM, then SIGKILL on a second
    /// trip or timeout elapsing).
    pub async fn invoke(
        &self,
        request: InvocationRequest,
        events: Option<EventSender>,
        cancel: CancellationToken,
    ) -> Result<InvocationResult, InvokerError> {
        let mut cmd = self.build_command(&request);
        let mut child = cmd.spawn().map_err(InvokerError::Spawn)?;
        let pid = child.id();

        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(request.prompt.as_bytes()).await;
            drop(stdin);
        }

        let stats_handle = pid.map(|p| spawn_stats_poller(p, events.clone()));

        let stdout = child.stdout.take().expect("stdout piped");
        let mut reader = BufReader::new(stdout).lines();
        let mut accumulator = StreamAccumulator::default();

        let timeout_fut = async {
            match request.timeout {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(timeout_fut);

        let result = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    terminate(&mut child).await;
                    break Err(InvokerError::Cancelled);
                }
                _ = &mut timeout_fut => {
                    terminate(&mut child).await;
                    break Err(InvokerError::Timeout);
                }
                line = reader.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            accumulator.apply_line(&line, events.as_ref()).await;
                        }
                        Ok(None) => {
                            break Ok(());
                        }
                        Err(e) => break Err(InvokerError::Io(e)),
                    }
                }
            }
        };

        if let Some(handle) = stats_handle {
            handle.abort();
        }

        if let Err(e) = result {
            return Err(e);
        }

        let status = child.wait().await.map_err(InvokerError::Io)?;
        let stderr_tail = if let Some(mut stderr) = child.stderr.take() {
            let mut buf = String::new();
            use tokio::io::AsyncReadExt;
            let _ = stderr.read_to_string(&mut buf).await;
            tail(&buf, 2000)
        } else {
            String::new()
        };

        if !status.success() {
            return Err(InvokerError::NonZeroExit {
                code: status.code().unwrap_or(-1),
            });
        }

        Ok(InvocationResult {
            assistant_text: accumulator.assistant_text,
            tool_uses: accumulator.tool_uses,
            stats: ProcessStats {
                pid,
                peak_rss_kb: None,
            },
            token_usage: accumulator.token_usage,
            model: accumulator.model,
            stderr_tail,
        })
    }
}

fn tail(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        s.chars()
            .skip(s.chars().count() - max_chars)
            .collect()
    }
}

async fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            if tokio::time::timeout(Duration::from_secs(3), child.wait())
                .await
                .is_err()
            {
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
            }
        }
        #[cfg(not(unix))]
        {
            let _ = child.kill().await;
        }
    } else {
        let _ = child.kill().await;
    }
}

/// Poll `/proc/<pid>/status` roughly every second and emit the latest
/// (pid, rss-kB) on the stats channel; platforms without `/proc` report
/// `None` rather than failing the invocation.
fn spawn_stats_poller(pid: u32, events: Option<EventSender>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let rss_kb = read_proc_rss_kb(pid);
            if let Some(tx) = &events {
                let _ = tx.send(Event::Stats { pid, rss_kb }).await;
            }
        }
    })
}

fn read_proc_rss_kb(pid: u32) -> Option<u64> {
    let path: PathBuf = Path::new("/proc").join(pid.to_string()).join("status");
    let content = std::fs::read_to_string(path).ok()?;
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let digits: String = rest.chars().filter(|c| c.is_ascii_digit()).collect();
            return digits.parse().ok();
        }
    }
    None
}
