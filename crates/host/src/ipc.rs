//! Local configuration IPC.
//!
//! Line-delimited JSON request/response on a named channel reachable only by
//! administrators: a named pipe with a SYSTEM+Administrators DACL on Windows,
//! a 0600 Unix socket inside the config directory elsewhere. The configurator
//! UI is the only intended client. Malformed input produces a structured
//! error and keeps the connection open; only failure to bind is fatal.

use crate::config::ConfigStore;
use crate::lockout::apply_success;
use crate::password;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const PIPE_NAME: &str = "P2PRD.Config";

fn error_response(kind: &str) -> String {
    json!({ "status": "error", "error": kind }).to_string()
}

/// Handle one request line and produce the response line.
pub fn handle_request(store: &ConfigStore, line: &str) -> String {
    let Ok(request) = serde_json::from_str::<Value>(line) else {
        return error_response("exception");
    };
    let Some(kind) = request.get("type").and_then(|t| t.as_str()) else {
        return error_response("missing_type");
    };

    match kind {
        "status" => {
            let config = store.snapshot();
            json!({
                "host_id": config.host_id,
                "has_password": config.has_password(),
                "signaling_resolver_url": config.signaling_resolver_url,
                "stun": config.stun,
                "turn": {
                    "url": config.turn.url,
                    "username": config.turn.username,
                    "credential": config.turn.credential,
                },
            })
            .to_string()
        }
        "set_password" => {
            let password = request
                .get("password")
                .and_then(|p| p.as_str())
                .unwrap_or_default();
            if password.is_empty() {
                return error_response("empty_password");
            }
            let hash = match password::hash_password(password) {
                Ok(hash) => hash,
                Err(e) => {
                    warn!("Password hashing failed: {e}");
                    return error_response("exception");
                }
            };
            match store.update(|c| {
                c.password_hash = hash;
                apply_success(&mut c.lockout);
            }) {
                Ok(_) => {
                    info!("Password updated via IPC, lockout cleared");
                    json!({ "status": "ok" }).to_string()
                }
                Err(e) => {
                    warn!("Failed to persist password: {e:#}");
                    error_response("exception")
                }
            }
        }
        "set_resolver" => {
            let url = request
                .get("resolver_url")
                .and_then(|u| u.as_str())
                .unwrap_or_default()
                .to_string();
            if url.is_empty() {
                return error_response("empty_resolver");
            }
            match store.update(|c| c.signaling_resolver_url = url) {
                Ok(_) => json!({ "status": "ok" }).to_string(),
                Err(e) => {
                    warn!("Failed to persist resolver: {e:#}");
                    error_response("exception")
                }
            }
        }
        "set_ice" => {
            let stun: Vec<String> = request
                .get("stun")
                .and_then(|s| s.as_array())
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|v| v.as_str())
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            let turn_url = request
                .get("turn_url")
                .and_then(|u| u.as_str())
                .unwrap_or_default()
                .to_string();
            if stun.is_empty() && turn_url.is_empty() {
                return error_response("empty_ice");
            }
            let turn_username = request
                .get("turn_username")
                .and_then(|u| u.as_str())
                .unwrap_or_default()
                .to_string();
            let turn_credential = request
                .get("turn_credential")
                .and_then(|u| u.as_str())
                .unwrap_or_default()
                .to_string();
            match store.update(|c| {
                c.stun = stun;
                c.turn.url = turn_url;
                c.turn.username = turn_username;
                c.turn.credential = turn_credential;
            }) {
                Ok(_) => json!({ "status": "ok" }).to_string(),
                Err(e) => {
                    warn!("Failed to persist ICE config: {e:#}");
                    error_response("exception")
                }
            }
        }
        _ => error_response("unknown_type"),
    }
}

async fn handle_conn<S>(stream: S, store: Arc<ConfigStore>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        let mut response = handle_request(&store, &line);
        response.push('\n');
        if writer.write_all(response.as_bytes()).await.is_err() {
            break;
        }
    }
    debug!("IPC client disconnected");
}

#[cfg(unix)]
pub struct IpcServer {
    listener: tokio::net::UnixListener,
    store: Arc<ConfigStore>,
    cancel: CancellationToken,
}

#[cfg(unix)]
impl IpcServer {
    /// Bind the socket. Errors here abort startup.
    pub fn bind(store: Arc<ConfigStore>, cancel: CancellationToken) -> anyhow::Result<Self> {
        use anyhow::Context;
        use std::os::unix::fs::PermissionsExt;

        let path = store.dir().join(PIPE_NAME);
        let _ = std::fs::remove_file(&path);
        let listener = tokio::net::UnixListener::bind(&path)
            .with_context(|| format!("Failed to bind IPC socket {}", path.display()))?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("Failed to restrict IPC socket {}", path.display()))?;
        info!(path = %path.display(), "IPC socket listening");
        Ok(Self {
            listener,
            store,
            cancel,
        })
    }

    pub async fn run(self) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        debug!("IPC client connected");
                        tokio::spawn(handle_conn(stream, Arc::clone(&self.store)));
                    }
                    Err(e) => warn!("IPC accept failed: {e}"),
                },
            }
        }
    }
}

#[cfg(windows)]
pub struct IpcServer {
    first: tokio::net::windows::named_pipe::NamedPipeServer,
    store: Arc<ConfigStore>,
    cancel: CancellationToken,
}

#[cfg(windows)]
impl IpcServer {
    const PIPE_PATH: &str = r"\\.\pipe\P2PRD.Config";
    /// SYSTEM and Administrators get full access, nobody else connects.
    const PIPE_SDDL: &str = "D:P(A;;GA;;;SY)(A;;GA;;;BA)";

    pub fn bind(store: Arc<ConfigStore>, cancel: CancellationToken) -> anyhow::Result<Self> {
        let first = Self::create_instance(true)?;
        info!(pipe = Self::PIPE_PATH, "IPC pipe listening");
        Ok(Self {
            first,
            store,
            cancel,
        })
    }

    fn create_instance(
        first: bool,
    ) -> anyhow::Result<tokio::net::windows::named_pipe::NamedPipeServer> {
        use anyhow::Context;
        use tokio::net::windows::named_pipe::ServerOptions;
        use windows::Win32::Foundation::LocalFree;
        use windows::Win32::Security::Authorization::{
            ConvertStringSecurityDescriptorToSecurityDescriptorW, SDDL_REVISION_1,
        };
        use windows::Win32::Security::{PSECURITY_DESCRIPTOR, SECURITY_ATTRIBUTES};
        use windows::core::HSTRING;

        let mut descriptor = PSECURITY_DESCRIPTOR::default();
        unsafe {
            ConvertStringSecurityDescriptorToSecurityDescriptorW(
                &HSTRING::from(Self::PIPE_SDDL),
                SDDL_REVISION_1,
                &mut descriptor,
                None,
            )
            .context("Failed to build pipe security descriptor")?;
        }
        let mut attributes = SECURITY_ATTRIBUTES {
            nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
            lpSecurityDescriptor: descriptor.0,
            bInheritHandle: false.into(),
        };

        let result = unsafe {
            ServerOptions::new()
                .first_pipe_instance(first)
                .create_with_security_attributes_raw(
                    Self::PIPE_PATH,
                    &mut attributes as *mut _ as *mut std::ffi::c_void,
                )
        };
        unsafe {
            let _ = LocalFree(Some(windows::Win32::Foundation::HLOCAL(descriptor.0)));
        }
        result.context("Failed to create IPC pipe instance")
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                connected = self.first.connect() => {
                    if let Err(e) = connected {
                        warn!("IPC pipe connect failed: {e}");
                        continue;
                    }
                    let next = match Self::create_instance(false) {
                        Ok(server) => server,
                        Err(e) => {
                            warn!("Failed to create next pipe instance: {e:#}");
                            continue;
                        }
                    };
                    let client = std::mem::replace(&mut self.first, next);
                    debug!("IPC client connected");
                    tokio::spawn(handle_conn(client, Arc::clone(&self.store)));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lockout::{MAX_ATTEMPTS, apply_failure};
    use uuid::Uuid;

    struct TempStore {
        store: Arc<ConfigStore>,
        dir: std::path::PathBuf,
    }

    impl Drop for TempStore {
        fn drop(&mut self) {
            std::fs::remove_dir_all(&self.dir).ok();
        }
    }

    fn store() -> TempStore {
        let dir = std::env::temp_dir().join(format!("p2prd-ipc-{}", Uuid::new_v4()));
        TempStore {
            store: Arc::new(ConfigStore::open(&dir).unwrap()),
            dir,
        }
    }

    fn parse(response: &str) -> Value {
        serde_json::from_str(response).unwrap()
    }

    #[test]
    fn status_reports_identity_and_ice() {
        let t = store();
        let response = parse(&handle_request(&t.store, r#"{"type":"status"}"#));
        assert_eq!(response["has_password"], false);
        assert!(!response["host_id"].as_str().unwrap().is_empty());
        assert!(response["stun"].as_array().unwrap().len() >= 1);
        assert_eq!(response["turn"]["url"], "");
    }

    #[test]
    fn missing_and_unknown_types() {
        let t = store();
        assert_eq!(
            parse(&handle_request(&t.store, r#"{"password":"x"}"#))["error"],
            "missing_type"
        );
        assert_eq!(
            parse(&handle_request(&t.store, r#"{"type":"reboot"}"#))["error"],
            "unknown_type"
        );
    }

    #[test]
    fn malformed_json_is_an_exception() {
        let t = store();
        assert_eq!(
            parse(&handle_request(&t.store, "{{{ nope"))["error"],
            "exception"
        );
    }

    #[test]
    fn set_password_hashes_and_clears_lockout() {
        let t = store();
        // Arm the lockout first.
        t.store
            .update(|c| {
                for _ in 0..MAX_ATTEMPTS {
                    apply_failure(&mut c.lockout, chrono::Utc::now());
                }
            })
            .unwrap();
        assert!(t.store.snapshot().lockout.locked_until.is_some());

        let response = parse(&handle_request(
            &t.store,
            r#"{"type":"set_password","password":"hunter2"}"#,
        ));
        assert_eq!(response["status"], "ok");

        let config = t.store.snapshot();
        assert!(config.password_hash.starts_with("$argon2id$"));
        assert!(config.lockout.locked_until.is_none());
        assert!(crate::password::verify_password("hunter2", &config.password_hash).unwrap());
    }

    #[test]
    fn empty_password_rejected() {
        let t = store();
        let response = parse(&handle_request(
            &t.store,
            r#"{"type":"set_password","password":""}"#,
        ));
        assert_eq!(response["error"], "empty_password");
        assert!(!t.store.snapshot().has_password());
    }

    #[test]
    fn set_resolver_persists() {
        let t = store();
        let response = parse(&handle_request(
            &t.store,
            r#"{"type":"set_resolver","resolver_url":"https://resolver.example/ep"}"#,
        ));
        assert_eq!(response["status"], "ok");
        assert_eq!(
            t.store.snapshot().signaling_resolver_url,
            "https://resolver.example/ep"
        );

        let response = parse(&handle_request(
            &t.store,
            r#"{"type":"set_resolver","resolver_url":""}"#,
        ));
        assert_eq!(response["error"], "empty_resolver");
    }

    #[test]
    fn set_ice_requires_stun_or_turn() {
        let t = store();
        let response = parse(&handle_request(
            &t.store,
            r#"{"type":"set_ice","stun":[]}"#,
        ));
        assert_eq!(response["error"], "empty_ice");

        let response = parse(&handle_request(
            &t.store,
            r#"{"type":"set_ice","stun":["stun:s.example:3478"]}"#,
        ));
        assert_eq!(response["status"], "ok");
        assert_eq!(t.store.snapshot().stun, vec!["stun:s.example:3478"]);

        let response = parse(&handle_request(
            &t.store,
            r#"{"type":"set_ice","stun":[],"turn_url":"turn:t.example:3478","turn_username":"u","turn_credential":"c"}"#,
        ));
        assert_eq!(response["status"], "ok");
        let turn = t.store.snapshot().turn;
        assert_eq!(turn.url, "turn:t.example:3478");
        assert_eq!(turn.username, "u");
        assert_eq!(turn.credential, "c");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn socket_serves_line_delimited_requests() {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

        let t = store();
        let server = IpcServer::bind(Arc::clone(&t.store), CancellationToken::new()).unwrap();
        let path = t.store.dir().join(PIPE_NAME);
        tokio::spawn(server.run());

        let stream = tokio::net::UnixStream::connect(&path).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        writer.write_all(b"{\"type\":\"status\"}\n").await.unwrap();

        let mut line = String::new();
        BufReader::new(reader).read_line(&mut line).await.unwrap();
        let response: Value = serde_json::from_str(&line).unwrap();
        assert!(response["host_id"].is_string());
    }
}
