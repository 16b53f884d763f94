//! The `hook` subcommand: the agent's pre-tool-use hook shells out to
//! `programmator hook --socket PATH`, which reads one JSON request from
//! stdin, relays it to the permission broker over that socket, and
//! prints the hook's expected JSON decision to stdout. Fails closed
//! (`deny`) on any I/O or decode error.

use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use crate::broker::{Decision, PermissionRequest, PermissionResponse};

/// The subset of the hook's stdin payload `hook` actually consumes; the
/// agent sends additional fields we don't need and ignore via `Value`
/// round-tripping at the call site instead of here.
#[derive(Debug, Deserialize)]
struct HookInput {
    session_id: String,
    tool_name: String,
    #[serde(default)]
    tool_input: serde_json::Value,
    tool_use_id: String,
}

#[derive(Debug, Serialize)]
struct HookSpecificOutput {
    #[serde(rename = "permissionDecision")]
    permission_decision: &'static str,
}

#[derive(Debug, Serialize)]
struct HookOutput {
    #[serde(rename = "hookSpecificOutput")]
    hook_specific_output: HookSpecificOutput,
}

fn deny_output() -> String {
    serde_json::to_string(&HookOutput {
        hook_specific_output: HookSpecificOutput {
            permission_decision: "deny",
        },
    })
    .unwrap_or_else(|_| r#"{"hookSpecificOutput":{"permissionDecision":"deny"}}"#.to_string())
}

fn allow_output() -> String {
    serde_json::to_string(&HookOutput {
        hook_specific_output: HookSpecificOutput {
            permission_decision: "allow",
        },
    })
    .unwrap_or_else(|_| r#"{"hookSpecificOutput":{"permissionDecision":"allow"}}"#.to_string())
}

/// Read one JSON object from stdin and delegate to [`run`].
pub async fn run_from_stdin(socket_path: &Path) -> String {
    let mut stdin_content = String::new();
    if std::io::stdin().read_to_string(&mut stdin_content).is_err() {
        return deny_output();
    }
    run(socket_path, &stdin_content).await
}

/// Parse `input` as one JSON hook request, ask the broker at
/// `socket_path` for a decision, and return the hook output JSON to
/// print to stdout. Any failure along the way (bad input, no socket,
/// broker unreachable, malformed response) resolves to a deny.
pub async fn run(socket_path: &Path, input: &str) -> String {
    let input: HookInput = match serde_json::from_str(input) {
        Ok(v) => v,
        Err(_) => return deny_output(),
    };

    match ask_broker(socket_path, input).await {
        Ok(Decision::Allow | Decision::AllowOnce | Decision::AllowProject | Decision::AllowGlobal) => {
            allow_output()
        }
        _ => deny_output(),
    }
}

async fn ask_broker(socket_path: &Path, input: HookInput) -> Result<Decision, std::io::Error> {
    let stream = UnixStream::connect(socket_path).await?;
    let (reader, mut writer) = stream.into_split();

    let request = PermissionRequest {
        session_id: input.session_id,
        tool_name: input.tool_name,
        tool_input: input.tool_input,
        tool_use_id: input.tool_use_id,
        description: None,
    };
    let mut payload = serde_json::to_vec(&request)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    payload.push(b'\n');
    writer.write_all(&payload).await?;
    writer.shutdown().await?;

    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    reader.read_line(&mut line).await?;

    let response: PermissionResponse = serde_json::from_str(line.trim_end())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(response.decision)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deny_output_matches_hook_shape() {
        let out = deny_output();
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(
            value["hookSpecificOutput"]["permissionDecision"],
            "deny"
        );
    }

    #[test]
    fn allow_output_matches_hook_shape() {
        let out = allow_output();
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(
            value["hookSpecificOutput"]["permissionDecision"],
            "allow"
        );
    }

    #[tokio::test]
    async fn missing_socket_fails_closed() {
        let input = r#"{"session_id":"s","tool_name":"Read","tool_input":{},"tool_use_id":"t"}"#;
        let out = run(Path::new("/nonexistent/programmator-test.sock"), input).await;
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(
            value["hookSpecificOutput"]["permissionDecision"],
            "deny"
        );
    }

    #[tokio::test]
    async fn malformed_input_fails_closed() {
        let out = run(Path::new("/nonexistent/programmator-test.sock"), "not json").await;
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(
            value["hookSpecificOutput"]["permissionDecision"],
            "deny"
        );
    }
}
