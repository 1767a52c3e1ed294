//! One agent turn inside a running container.
//!
//! Each turn is a single `exec -i` of the container's entrypoint. Low
//! sensitivity context (turn id, model, workdir) goes in env vars on the exec
//! call and is refreshed every turn. Everything sensitive or structured
//! (token, system prompt, capability descriptors) is written once to stdin as
//! a JSON object, so it never shows up in `ps` output, the container's
//! persistent config, or a mount.
//!
//! Failures during a turn are reported as `error` events on the stream, never
//! as `Err`. The stream ends after the first synthesized terminal error.

use futures::Stream;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::engine::ContainerEngine;
use super::events::Event;
use super::hardening::ExecSpec;
use super::lifecycle::ContainerHandle;
use crate::concurrency::KeyedLocks;
use crate::config::Config;
use crate::error::{Error, Result};

pub type EventStream = Pin<Box<dyn Stream<Item = Event> + Send>>;

/// Bytes of workload stderr kept for diagnostics.
const STDERR_TAIL_BYTES: usize = 4096;

/// A credential that must never reach logs.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

impl Serialize for Secret {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

/// Plugin directories, tool servers and agent templates for one turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnCapabilities {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plugin_dirs: Vec<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub mcp_servers: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agents: Option<Value>,
}

/// The stdin payload of one turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRequest {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claude_token: Option<Secret>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<TurnCapabilities>,
}

impl TurnRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            claude_token: None,
            system_prompt: None,
            capabilities: None,
        }
    }

    pub fn with_token(mut self, token: Secret) -> Self {
        self.claude_token = Some(token);
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_capabilities(mut self, capabilities: TurnCapabilities) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    /// One JSON line for the entrypoint's stdin.
    fn to_stdin(&self) -> Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }
}

/// Per-turn values passed as env vars on the exec call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnContext {
    pub session_id: Option<String>,
    pub turn_id: String,
    pub model: Option<String>,
    pub workdir: Option<String>,
}

impl Default for TurnContext {
    fn default() -> Self {
        Self {
            session_id: None,
            turn_id: uuid::Uuid::new_v4().to_string(),
            model: None,
            workdir: None,
        }
    }
}

impl TurnContext {
    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Self::default()
        }
    }

    fn to_env(&self, default_model: Option<&str>) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("AGENTBOX_TURN_ID".to_string(), self.turn_id.clone());
        if let Some(ref id) = self.session_id {
            env.insert("AGENTBOX_SESSION_ID".to_string(), id.clone());
        }
        if let Some(model) = self.model.as_deref().or(default_model) {
            env.insert("AGENTBOX_MODEL".to_string(), model.to_string());
        }
        if let Some(ref dir) = self.workdir {
            env.insert("AGENTBOX_WORKDIR".to_string(), dir.clone());
        }
        env
    }
}

#[derive(Debug, Clone)]
pub struct ExecSettings {
    pub entrypoint: Vec<String>,
    pub line_read_timeout: Duration,
    pub exit_wait: Duration,
    pub oom_exit_code: i32,
    pub default_model: Option<String>,
}

impl From<&Config> for ExecSettings {
    fn from(config: &Config) -> Self {
        Self {
            entrypoint: config.container.entrypoint.clone(),
            line_read_timeout: Duration::from_millis(config.exec.line_read_timeout_ms.max(1)),
            exit_wait: Duration::from_millis(config.exec.exit_wait_ms),
            oom_exit_code: config.exec.oom_exit_code,
            default_model: config.exec.default_model.clone(),
        }
    }
}

pub struct ExecSessionRunner {
    engine: Arc<dyn ContainerEngine>,
    locks: KeyedLocks,
    settings: ExecSettings,
}

impl ExecSessionRunner {
    /// `locks` must be the lifecycle manager's table so an OOM teardown is
    /// serialized with `ensure` for the same identity.
    pub fn new(engine: Arc<dyn ContainerEngine>, locks: KeyedLocks, settings: ExecSettings) -> Self {
        Self {
            engine,
            locks,
            settings,
        }
    }

    /// Run one turn. Events arrive in the order the workload printed them.
    /// Dropping the stream kills the exec process.
    pub fn run(
        &self,
        container: &ContainerHandle,
        request: TurnRequest,
        context: TurnContext,
        deadline: Duration,
    ) -> EventStream {
        let engine = self.engine.clone();
        let locks = self.locks.clone();
        let settings = self.settings.clone();
        let container = container.clone();

        let pid_file = turn_pid_file(&context.turn_id);
        let spec = ExecSpec {
            container: container.name.clone(),
            env: context.to_env(settings.default_model.as_deref()),
            workdir: context.workdir.clone(),
            command: settings.entrypoint.clone(),
            pid_file: Some(pid_file.clone()),
        };
        let turn_id = context.turn_id.clone();

        let stream = async_stream::stream! {
            let payload = match request.to_stdin() {
                Ok(p) => p,
                Err(e) => {
                    yield Event::from_error(&Error::ExecFailed(format!("could not encode turn request: {}", e)));
                    return;
                }
            };

            let deadline_at = Instant::now() + deadline;
            let mut child = match engine.spawn_exec(&spec) {
                Ok(child) => child,
                Err(e) => {
                    warn!("Turn {} failed to start in {}: {}", turn_id, container.name, e);
                    yield Event::from_error(&Error::ExecFailed(e.to_string()));
                    return;
                }
            };
            debug!("Turn {} started in {}", turn_id, container.name);

            let stdin_task = child.stdin.take().map(|mut stdin| {
                tokio::spawn(async move {
                    if let Err(e) = stdin.write_all(&payload).await {
                        debug!("Workload closed stdin early: {}", e);
                    }
                    let _ = stdin.shutdown().await;
                })
            });
            let stderr_task = child
                .stderr
                .take()
                .map(|stderr| tokio::spawn(read_tail(stderr, STDERR_TAIL_BYTES)));

            let Some(stdout) = child.stdout.take() else {
                let _ = child.kill().await;
                yield Event::from_error(&Error::ExecFailed("agent has no stdout".to_string()));
                return;
            };
            let mut lines = BufReader::new(stdout).lines();
            let mut saw_terminal = false;
            let mut timed_out = false;

            loop {
                let now = Instant::now();
                if now >= deadline_at {
                    timed_out = true;
                    break;
                }
                let wait = settings.line_read_timeout.min(deadline_at - now);
                match tokio::time::timeout(wait, lines.next_line()).await {
                    // Poll interval elapsed; recheck the deadline
                    Err(_) => continue,
                    Ok(Ok(Some(line))) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match Event::parse(&line) {
                            Some(event) => {
                                saw_terminal |= event.is_terminal();
                                yield event;
                            }
                            None => warn!("Dropping unparseable line from turn {}: {:.200}", turn_id, line),
                        }
                    }
                    Ok(Ok(None)) => break,
                    Ok(Err(e)) => {
                        warn!("Reading output of turn {} failed: {}", turn_id, e);
                        break;
                    }
                }
            }

            if timed_out {
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill timed out turn {}: {}", turn_id, e);
                }
                if let Err(e) = engine.kill_exec(&container.name, &pid_file).await {
                    warn!("Failed to kill turn {} inside {}: {}", turn_id, container.name, e);
                }
                if let Some(task) = stdin_task {
                    task.abort();
                }
                if let Some(task) = stderr_task {
                    task.abort();
                }
                info!("Turn {} in {} timed out after {}s", turn_id, container.name, deadline.as_secs());
                yield Event::from_error(&Error::ExecTimeout { secs: deadline.as_secs() });
                return;
            }

            let exit_code = match tokio::time::timeout(settings.exit_wait, child.wait()).await {
                Ok(Ok(status)) => status.code(),
                Ok(Err(e)) => {
                    warn!("Waiting for turn {} failed: {}", turn_id, e);
                    let _ = child.kill().await;
                    None
                }
                Err(_) => {
                    warn!("Turn {} closed stdout but did not exit; killing it", turn_id);
                    let _ = child.kill().await;
                    if let Err(e) = engine.kill_exec(&container.name, &pid_file).await {
                        warn!("Failed to kill turn {} inside {}: {}", turn_id, container.name, e);
                    }
                    None
                }
            };

            if let Some(task) = stdin_task {
                task.abort();
            }
            let stderr_tail = match stderr_task {
                Some(task) => match tokio::time::timeout(settings.exit_wait, task).await {
                    Ok(Ok(tail)) => tail,
                    _ => String::new(),
                },
                None => String::new(),
            };

            if exit_code == Some(settings.oom_exit_code) {
                warn!(
                    "Turn {} in {} was OOM-killed; removing container",
                    turn_id, container.name
                );
                {
                    let _guard = locks.lock(&container.lock_key).await;
                    if let Err(e) = engine.remove_container(&container.name).await {
                        warn!("Failed to remove OOM-killed container {}: {}", container.name, e);
                    }
                }
                yield Event::from_error(&Error::OomKilled { name: container.name.clone() });
                return;
            }

            if exit_code != Some(0) && !saw_terminal {
                let shown = exit_code.map_or_else(|| "signal".to_string(), |c| c.to_string());
                if !stderr_tail.is_empty() {
                    warn!("Turn {} exited with {}; stderr tail: {}", turn_id, shown, stderr_tail.trim_end());
                }
                yield Event::from_error(&Error::WorkloadExit { status: shown });
                return;
            }

            debug!("Turn {} finished with {:?}", turn_id, exit_code);
        };

        Box::pin(stream)
    }
}

/// Where the in-container pid of a turn is recorded.
fn turn_pid_file(turn_id: &str) -> String {
    format!("/tmp/agentbox-turn-{}.pid", turn_id)
}

/// Drain a pipe, keeping only the last `limit` bytes.
async fn read_tail<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> String {
    let mut tail: Vec<u8> = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(&buf[..n]);
                if tail.len() > limit {
                    let excess = tail.len() - limit;
                    tail.drain(..excess);
                }
            }
        }
    }
    String::from_utf8_lossy(&tail).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::events::codes;
    use crate::sandbox::fake::FakeEngine;
    use crate::sandbox::identity::ConfigHash;
    use futures::StreamExt;
    use serde_json::json;

    fn handle() -> ContainerHandle {
        ContainerHandle {
            name: "agentbox-proj-alpha".into(),
            slug: "proj-alpha".into(),
            config_hash: ConfigHash::from("ab".repeat(32)),
            lock_key: "proj-alpha".into(),
        }
    }

    fn settings() -> ExecSettings {
        ExecSettings {
            entrypoint: vec!["agent-runner".into()],
            line_read_timeout: Duration::from_millis(50),
            exit_wait: Duration::from_secs(2),
            oom_exit_code: 137,
            default_model: Some("default-model".into()),
        }
    }

    fn runner(engine: Arc<FakeEngine>) -> ExecSessionRunner {
        ExecSessionRunner::new(engine, KeyedLocks::new(), settings())
    }

    async fn collect(stream: EventStream) -> Vec<Event> {
        stream.collect().await
    }

    #[test]
    fn request_serializes_to_wire_schema() {
        let req = TurnRequest::new("hello");
        assert_eq!(serde_json::to_value(&req).unwrap(), json!({"message": "hello"}));

        let req = TurnRequest::new("hi")
            .with_token(Secret::new("sk-123"))
            .with_capabilities(TurnCapabilities {
                plugin_dirs: vec!["/plugins/a".into()],
                ..Default::default()
            });
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({
                "message": "hi",
                "claude_token": "sk-123",
                "capabilities": {"plugin_dirs": ["/plugins/a"]}
            })
        );
    }

    #[test]
    fn debug_never_prints_token() {
        let req = TurnRequest::new("hi").with_token(Secret::new("sk-very-secret"));
        let shown = format!("{:?}", req);
        assert!(!shown.contains("sk-very-secret"));
        assert!(shown.contains("redacted"));
    }

    #[test]
    fn context_env_only_includes_set_values() {
        let ctx = TurnContext {
            session_id: Some("sess-1".into()),
            turn_id: "t-1".into(),
            model: None,
            workdir: None,
        };
        let env = ctx.to_env(Some("m"));
        assert_eq!(env["AGENTBOX_SESSION_ID"], "sess-1");
        assert_eq!(env["AGENTBOX_TURN_ID"], "t-1");
        assert_eq!(env["AGENTBOX_MODEL"], "m");
        assert!(!env.contains_key("AGENTBOX_WORKDIR"));
    }

    #[tokio::test]
    async fn forwards_events_in_order_and_drops_garbage() {
        let engine = Arc::new(FakeEngine::new());
        engine.set_exec_script(
            r#"cat >/dev/null
echo '{"type":"log","message":"one"}'
echo 'not json at all'
echo '{"type":"tool_use","name":"bash"}'
echo '{"type":"result","text":"done"}'"#,
        );

        let events = collect(runner(engine.clone()).run(
            &handle(),
            TurnRequest::new("hi"),
            TurnContext::default(),
            Duration::from_secs(10),
        ))
        .await;

        let kinds: Vec<&str> = events.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["log", "tool_use", "result"]);
        assert!(engine.exec_kills().is_empty());
    }

    #[tokio::test]
    async fn workload_receives_stdin_payload_and_env() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("stdin.json");
        let env_out = tmp.path().join("env.txt");
        let engine = Arc::new(FakeEngine::new());
        engine.set_exec_script(&format!(
            "cat > {}; echo \"$AGENTBOX_SESSION_ID $AGENTBOX_TURN_ID $AGENTBOX_MODEL\" > {}; echo '{{\"type\":\"result\"}}'",
            out.display(),
            env_out.display()
        ));

        let ctx = TurnContext {
            session_id: Some("sess-9".into()),
            turn_id: "turn-9".into(),
            model: None,
            workdir: None,
        };
        let events = collect(runner(engine.clone()).run(
            &handle(),
            TurnRequest::new("hello"),
            ctx,
            Duration::from_secs(10),
        ))
        .await;
        assert_eq!(events.len(), 1);

        let stdin: Value = serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
        assert_eq!(stdin, json!({"message": "hello"}));
        let env = std::fs::read_to_string(&env_out).unwrap();
        assert_eq!(env.trim(), "sess-9 turn-9 default-model");

        let exec = &engine.execs()[0];
        assert_eq!(exec.container, "agentbox-proj-alpha");
        assert_eq!(exec.command, vec!["agent-runner"]);
    }

    #[tokio::test]
    async fn deadline_kills_process_and_emits_one_timeout() {
        let tmp = tempfile::tempdir().unwrap();
        let pid_file = tmp.path().join("pid");
        let engine = Arc::new(FakeEngine::new());
        engine.set_exec_script(&format!(
            "echo $$ > {}; echo '{{\"type\":\"log\",\"message\":\"working\"}}'; exec sleep 30",
            pid_file.display()
        ));

        let started = std::time::Instant::now();
        let context = TurnContext {
            turn_id: "t-timeout".into(),
            ..TurnContext::default()
        };
        let events = collect(runner(engine.clone()).run(
            &handle(),
            TurnRequest::new("hi"),
            context,
            Duration::from_millis(400),
        ))
        .await;
        assert!(started.elapsed() < Duration::from_secs(10));

        // The in-container process is tagged and killed from the engine side
        let spec = &engine.execs()[0];
        assert_eq!(spec.pid_file.as_deref(), Some("/tmp/agentbox-turn-t-timeout.pid"));
        assert_eq!(
            engine.exec_kills(),
            vec![(
                "agentbox-proj-alpha".to_string(),
                "/tmp/agentbox-turn-t-timeout.pid".to_string()
            )]
        );

        let errors: Vec<&Event> = events.iter().filter(|e| e.kind() == "error").collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].error_code(), Some(codes::TIMEOUT));
        assert_eq!(events.last().unwrap().error_code(), Some(codes::TIMEOUT));

        let pid: i32 = std::fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
        let alive = unsafe { libc::kill(pid, 0) } == 0;
        assert!(!alive, "exec process {} still alive", pid);
    }

    #[tokio::test]
    async fn oom_exit_removes_container() {
        let engine = Arc::new(FakeEngine::new());
        engine.insert_container("agentbox-proj-alpha", "running", &[("env", "proj-alpha")]);
        engine.set_exec_script("cat >/dev/null; echo '{\"type\":\"log\",\"message\":\"alloc\"}'; exit 137");

        let events = collect(runner(engine.clone()).run(
            &handle(),
            TurnRequest::new("hi"),
            TurnContext::default(),
            Duration::from_secs(10),
        ))
        .await;

        assert_eq!(events.last().unwrap().error_code(), Some(codes::OOM));
        assert!(!engine.has_container("agentbox-proj-alpha"));
    }

    #[tokio::test]
    async fn crash_without_result_synthesizes_workload_exit() {
        let engine = Arc::new(FakeEngine::new());
        engine.set_exec_script("cat >/dev/null; echo boom >&2; exit 3");

        let events = collect(runner(engine).run(
            &handle(),
            TurnRequest::new("hi"),
            TurnContext::default(),
            Duration::from_secs(10),
        ))
        .await;

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].error_code(), Some(codes::WORKLOAD_EXIT));
        if let Event::Error { message, .. } = &events[0] {
            assert!(message.contains('3'));
            assert!(!message.contains("boom"));
        }
    }

    #[tokio::test]
    async fn nonzero_exit_after_result_is_not_an_error() {
        let engine = Arc::new(FakeEngine::new());
        engine.set_exec_script("cat >/dev/null; echo '{\"type\":\"result\"}'; exit 1");

        let events = collect(runner(engine).run(
            &handle(),
            TurnRequest::new("hi"),
            TurnContext::default(),
            Duration::from_secs(10),
        ))
        .await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), "result");
    }

    #[tokio::test]
    async fn spawn_failure_becomes_exec_failed_event() {
        let engine = Arc::new(FakeEngine::new());
        engine.set_unavailable(true);

        let events = collect(runner(engine).run(
            &handle(),
            TurnRequest::new("hi"),
            TurnContext::default(),
            Duration::from_secs(10),
        ))
        .await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].error_code(), Some(codes::EXEC_FAILED));
    }
}
