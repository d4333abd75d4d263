use anyhow::Result;
use chrono::Utc;
use huntbuddy_core::{SessionState, StateObserver, TelemetryConfig, runtime_dir};
use reqwest::blocking::Client;
use serde_json::json;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub struct Observer {
    log_path: PathBuf,
    telemetry: Option<TelemetrySink>,
    verbose: bool,
}

struct TelemetrySink {
    endpoint: String,
    client: Client,
}

impl Observer {
    pub fn new(workspace: &Path, telemetry_cfg: &TelemetryConfig) -> Result<Self> {
        let dir = runtime_dir(workspace);
        fs::create_dir_all(&dir)?;
        let telemetry = telemetry_sink(telemetry_cfg)?;
        Ok(Self {
            log_path: dir.join("observe.log"),
            telemetry,
            verbose: false,
        })
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Append a compact summary of a session snapshot and forward it to telemetry.
    pub fn record_state(&self, session_id: &str, state: &SessionState) -> Result<()> {
        let summary = json!({
            "session_id": session_id,
            "mode": state.mode,
            "phase": state.phase,
            "target_type": state.target_type,
            "last_event": state.recent_events.last(),
            "last_task_subagent": state.last_task_subagent,
            "pending_task_failover": state.pending_task_failover,
            "task_failover_count": state.task_failover_count,
            "last_failure_reason": state.last_failure_reason,
        });
        self.append_log_line(&format!(
            "{} STATE {}",
            Utc::now().to_rfc3339(),
            serde_json::to_string(&summary)?
        ))?;
        self.emit_telemetry("telemetry.state", summary)
    }

    /// Append an arbitrary tagged record, e.g. a dispatch decision.
    pub fn record(&self, kind: &str, payload: serde_json::Value) -> Result<()> {
        self.append_log_line(&format!(
            "{} {} {}",
            Utc::now().to_rfc3339(),
            kind.to_ascii_uppercase(),
            serde_json::to_string(&payload)?
        ))?;
        self.emit_telemetry(&format!("telemetry.{}", kind.to_ascii_lowercase()), payload)
    }

    /// Enable or disable verbose logging to stderr.
    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Log a message to stderr with `[huntbuddy]` prefix when verbose mode is on.
    pub fn verbose_log(&self, msg: &str) {
        if self.verbose {
            eprintln!("[huntbuddy] {msg}");
        }
    }

    /// Always written to stderr and the log file.
    pub fn warn_log(&self, msg: &str) {
        eprintln!("[huntbuddy WARN] {msg}");
        let _ = self.append_log_line(&format!("{} WARN {msg}", Utc::now().to_rfc3339()));
    }

    fn append_log_line(&self, line: &str) -> Result<()> {
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        writeln!(f, "{line}")?;
        Ok(())
    }

    fn emit_telemetry(&self, name: &str, payload: serde_json::Value) -> Result<()> {
        let Some(sink) = &self.telemetry else {
            return Ok(());
        };

        let body = json!({
            "name": name,
            "at": Utc::now().to_rfc3339(),
            "payload": payload,
        });

        // Fire-and-forget so a slow collector never stalls dispatch.
        let client = sink.client.clone();
        let endpoint = sink.endpoint.clone();
        let log_path = self.log_path.clone();
        std::thread::spawn(move || {
            if let Err(err) = client.post(&endpoint).json(&body).send() {
                let line = format!("{} TELEMETRY_ERROR error={}", Utc::now().to_rfc3339(), err);
                let _ = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&log_path)
                    .and_then(|mut f| writeln!(f, "{line}"));
            }
        });
        Ok(())
    }
}

impl StateObserver for Observer {
    fn state_changed(&self, session_id: &str, state: &SessionState) -> Result<()> {
        self.verbose_log(&format!(
            "session {session_id}: phase={} target={} failover={}/{}",
            state.phase,
            state.target_type,
            state.pending_task_failover,
            state.task_failover_count
        ));
        self.record_state(session_id, state)
    }

    fn warn(&self, msg: &str) {
        self.warn_log(msg);
    }
}

fn telemetry_sink(cfg: &TelemetryConfig) -> Result<Option<TelemetrySink>> {
    if !cfg.enabled {
        return Ok(None);
    }
    let Some(endpoint) = cfg.endpoint.clone() else {
        return Ok(None);
    };
    let client = Client::builder().timeout(Duration::from_secs(3)).build()?;
    Ok(Some(TelemetrySink { endpoint, client }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use huntbuddy_core::{Mode, Phase};
    use std::io::Read;
    use std::net::TcpListener;
    use std::thread;

    fn disabled() -> TelemetryConfig {
        TelemetryConfig {
            enabled: false,
            endpoint: None,
        }
    }

    fn sample_state() -> SessionState {
        let mut state = SessionState::new(Mode::Ctf);
        state.phase = Phase::Plan;
        state.push_recent_event("scan_completed");
        state
    }

    #[test]
    fn record_state_writes_summary_line() {
        let workspace = tempfile::tempdir().expect("workspace");
        let observer = Observer::new(workspace.path(), &disabled()).expect("observer");
        observer
            .record_state("s-1", &sample_state())
            .expect("record state");

        let log_content = fs::read_to_string(observer.log_path()).expect("read log");
        assert!(log_content.contains(" STATE "));
        assert!(log_content.contains("\"phase\":\"PLAN\""));
        assert!(log_content.contains("\"last_event\":\"scan_completed\""));
    }

    #[test]
    fn multiple_records_append_to_log() {
        let workspace = tempfile::tempdir().expect("workspace");
        let observer = Observer::new(workspace.path(), &disabled()).expect("observer");
        observer.record_state("s-1", &sample_state()).expect("record 1");
        observer
            .record("dispatch", json!({"worker": "ctf-web"}))
            .expect("record 2");

        let log_content = fs::read_to_string(observer.log_path()).expect("read log");
        assert_eq!(log_content.lines().count(), 2);
        assert!(log_content.contains(" DISPATCH {\"worker\":\"ctf-web\"}"));
    }

    #[test]
    fn telemetry_posts_when_enabled() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            let mut buf = vec![0_u8; 8192];
            let n = stream.read(&mut buf).expect("read request");
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            let _ = stream.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK");
            request
        });

        let workspace = tempfile::tempdir().expect("workspace");
        let observer = Observer::new(
            workspace.path(),
            &TelemetryConfig {
                enabled: true,
                endpoint: Some(format!("http://{addr}/collect")),
            },
        )
        .expect("observer");
        observer
            .record_state("s-1", &sample_state())
            .expect("record state");
        let request = server.join().expect("join server");
        assert!(request.contains("POST /collect"));
        assert!(request.contains("telemetry.state"));
    }

    #[test]
    fn state_observer_impl_records_snapshots() {
        let workspace = tempfile::tempdir().expect("workspace");
        let observer = Observer::new(workspace.path(), &disabled()).expect("observer");
        let as_trait: &dyn StateObserver = &observer;
        as_trait
            .state_changed("s-2", &sample_state())
            .expect("notify");
        as_trait.warn("persistence disabled");

        let log_content = fs::read_to_string(observer.log_path()).expect("read log");
        assert!(log_content.contains("\"session_id\":\"s-2\""));
        assert!(log_content.contains("WARN persistence disabled"));
    }

    #[test]
    fn verbose_mode_defaults_to_off_and_toggles() {
        let workspace = tempfile::tempdir().expect("workspace");
        let mut observer = Observer::new(workspace.path(), &disabled()).expect("observer");
        assert!(!observer.is_verbose());
        observer.set_verbose(true);
        assert!(observer.is_verbose());
        observer.set_verbose(false);
        assert!(!observer.is_verbose());
    }

    #[test]
    fn telemetry_sink_requires_endpoint_when_enabled() {
        let sink = telemetry_sink(&TelemetryConfig {
            enabled: true,
            endpoint: None,
        })
        .expect("sink");
        assert!(sink.is_none(), "no endpoint → no sink even when enabled");
    }

    #[test]
    fn telemetry_sink_none_when_disabled() {
        let sink = telemetry_sink(&TelemetryConfig {
            enabled: false,
            endpoint: Some("http://example.com".to_string()),
        })
        .expect("sink");
        assert!(sink.is_none());
    }
}
