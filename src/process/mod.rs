//! Developer application launcher.
//!
//! [`CommandGenerator`] turns the configured entrypoint into a command that
//! runs in the code directory with the debug environment injected, in its own
//! process group, with stdout/stderr inherited. [`AppProcess::kill_tree`]
//! tears down the app together with everything it spawned.

pub mod tree;

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use serde::Deserialize;
use tokio::process::{Child, Command};
use tracing::info;

pub use tree::kill_process_tree;

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("no debug entrypoint")]
    EmptyEntrypoint,
    #[error("failed to start {program}: {error}")]
    Spawn {
        program: String,
        error: std::io::Error,
    },
    #[error("failed to wait for app process: {0}")]
    Wait(std::io::Error),
    #[error("failed to get process information for pid {0}")]
    NoSuchProcess(u32),
    #[error("failed to kill pid {pid}: {reason}")]
    Kill { pid: u32, reason: String },
    #[error("failed to list processes: {0}")]
    ProcessList(String),
    #[error("environment variable {0:?} must be exported locally in debug mode")]
    MissingSecret(String),
}

/// A user-declared variable for the app. With `secret` set, the value is
/// read from the variable of that name in the local environment instead.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct EnvVar {
    pub name: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub secret: String,
}

/// Resolve `vars` to name/value pairs, reading secrets through `lookup`.
/// An unset or empty secret is an error.
pub fn resolve_environment<F>(
    vars: &[EnvVar],
    lookup: F,
) -> Result<Vec<(String, String)>, LaunchError>
where
    F: Fn(&str) -> Option<String>,
{
    vars.iter()
        .map(|var| {
            if var.secret.is_empty() {
                return Ok((var.name.clone(), var.value.clone()));
            }
            match lookup(&var.secret) {
                Some(value) if !value.is_empty() => Ok((var.name.clone(), value)),
                _ => Err(LaunchError::MissingSecret(var.secret.clone())),
            }
        })
        .collect()
}

/// Everything the launched app learns about its debug environment.
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    pub entrypoint: Vec<String>,
    pub working_dir: PathBuf,
    /// Empty when the debug service did not report one.
    pub instance_id: String,
    pub service_name: String,
    pub api_key: String,
    pub api_secret: String,
    pub application_id: String,
    pub application_port: u16,
    pub private_key: String,
    pub region_alias: String,
    pub public_url: String,
    pub endpoint_url_scheme: String,
    pub debugger_url_scheme: String,
    /// Resolved user variables, set before the debug variables.
    pub user_environment: Vec<(String, String)>,
}

pub struct CommandGenerator {
    spec: LaunchSpec,
}

impl CommandGenerator {
    pub fn new(spec: LaunchSpec) -> Result<Self, LaunchError> {
        if spec.entrypoint.first().is_none_or(String::is_empty) {
            return Err(LaunchError::EmptyEntrypoint);
        }
        Ok(Self { spec })
    }

    pub fn program(&self) -> &str {
        &self.spec.entrypoint[0]
    }

    pub fn args(&self) -> &[String] {
        &self.spec.entrypoint[1..]
    }

    /// Variables added on top of the inherited environment, in order. User
    /// variables come first, so a debug variable of the same name wins.
    pub fn environment(&self) -> Vec<(String, String)> {
        let s = &self.spec;
        let code_dir = s.working_dir.display().to_string();
        let port = s.application_port.to_string();
        let mut env: Vec<(&str, String)> = vec![
            ("DEBUG", "true".into()),
            ("INSTANCE_SERVICE_NAME", s.service_name.clone()),
            ("API_ACCOUNT_ID", s.api_key.clone()),
            ("API_APPLICATION_ID", s.application_id.clone()),
            ("API_ACCOUNT_SECRET", s.api_secret.clone()),
            ("PRIVATE_KEY", s.private_key.clone()),
            ("CODE_DIR", code_dir.clone()),
            ("ENDPOINT_URL_SCHEME", s.endpoint_url_scheme.clone()),
            ("DEBUGGER_URL_SCHEME", s.debugger_url_scheme.clone()),
            ("REGION", s.region_alias.clone()),
            ("NERU_APP_PORT", port.clone()),
            ("VCR_DEBUG", "true".into()),
            ("VCR_INSTANCE_SERVICE_NAME", s.service_name.clone()),
            ("VCR_INSTANCE_PUBLIC_URL", s.public_url.clone()),
            ("VCR_API_ACCOUNT_ID", s.api_key.clone()),
            ("VCR_API_ACCOUNT_SECRET", s.api_secret.clone()),
            ("VCR_API_APPLICATION_ID", s.application_id.clone()),
            ("VCR_PRIVATE_KEY", s.private_key.clone()),
            ("VCR_CODE_DIR", code_dir),
            ("VCR_ENDPOINT_URL_SCHEME", s.endpoint_url_scheme.clone()),
            ("VCR_DEBUGGER_URL_SCHEME", s.debugger_url_scheme.clone()),
            ("VCR_REGION", s.region_alias.clone()),
            ("VCR_PORT", port),
            ("FORCE_COLOR", "1".into()),
        ];
        if !s.instance_id.is_empty() {
            env.push(("INSTANCE_ID", s.instance_id.clone()));
        }
        s.user_environment
            .iter()
            .cloned()
            .chain(env.into_iter().map(|(k, v)| (k.to_string(), v)))
            .collect()
    }

    /// The command, ready to spawn.
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(self.program());
        cmd.args(self.args())
            .current_dir(&self.spec.working_dir)
            .envs(self.environment())
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        #[cfg(unix)]
        cmd.process_group(0);
        #[cfg(windows)]
        {
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
            cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
        }
        cmd
    }

    pub fn spawn(&self) -> Result<AppProcess, LaunchError> {
        let child = self.command().spawn().map_err(|error| LaunchError::Spawn {
            program: self.program().to_string(),
            error,
        })?;
        let pid = child.id().unwrap_or_default();
        info!("started {} (pid {pid})", self.spec.entrypoint.join(" "));
        Ok(AppProcess { child, pid })
    }
}

/// A running developer app.
pub struct AppProcess {
    child: Child,
    pid: u32,
}

impl AppProcess {
    pub fn id(&self) -> u32 {
        self.pid
    }

    /// Wait for the app to exit on its own.
    pub async fn wait(&mut self) -> Result<ExitStatus, LaunchError> {
        self.child.wait().await.map_err(LaunchError::Wait)
    }

    /// Kill the app and all of its descendants, then reap it.
    pub async fn kill_tree(&mut self) -> Result<(), LaunchError> {
        let pid = self.pid;
        tokio::task::spawn_blocking(move || kill_process_tree(pid))
            .await
            .map_err(|e| LaunchError::Kill {
                pid,
                reason: e.to_string(),
            })??;
        self.child.wait().await.map_err(LaunchError::Wait)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(entrypoint: &[&str]) -> LaunchSpec {
        LaunchSpec {
            entrypoint: entrypoint.iter().map(ToString::to_string).collect(),
            working_dir: std::env::temp_dir(),
            service_name: "debug-svc".into(),
            api_key: "key".into(),
            api_secret: "secret".into(),
            application_id: "app-id".into(),
            application_port: 3000,
            private_key: "pk".into(),
            region_alias: "euw1".into(),
            public_url: "https://debug-svc.example.com".into(),
            endpoint_url_scheme: "https".into(),
            debugger_url_scheme: "wss".into(),
            ..LaunchSpec::default()
        }
    }

    #[test]
    fn empty_entrypoint_is_rejected() {
        assert!(matches!(
            CommandGenerator::new(spec(&[])),
            Err(LaunchError::EmptyEntrypoint)
        ));
        assert!(matches!(
            CommandGenerator::new(spec(&[""])),
            Err(LaunchError::EmptyEntrypoint)
        ));
    }

    #[test]
    fn entrypoint_splits_into_program_and_args() {
        let gen = CommandGenerator::new(spec(&["node", "index.js", "--inspect"])).unwrap();
        assert_eq!(gen.program(), "node");
        assert_eq!(gen.args(), ["index.js", "--inspect"]);

        let gen = CommandGenerator::new(spec(&["./server"])).unwrap();
        assert!(gen.args().is_empty());
    }

    #[test]
    fn environment_contract() {
        let gen = CommandGenerator::new(spec(&["node"])).unwrap();
        let env = gen.environment();
        let keys: Vec<&str> = env.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            keys,
            [
                "DEBUG",
                "INSTANCE_SERVICE_NAME",
                "API_ACCOUNT_ID",
                "API_APPLICATION_ID",
                "API_ACCOUNT_SECRET",
                "PRIVATE_KEY",
                "CODE_DIR",
                "ENDPOINT_URL_SCHEME",
                "DEBUGGER_URL_SCHEME",
                "REGION",
                "NERU_APP_PORT",
                "VCR_DEBUG",
                "VCR_INSTANCE_SERVICE_NAME",
                "VCR_INSTANCE_PUBLIC_URL",
                "VCR_API_ACCOUNT_ID",
                "VCR_API_ACCOUNT_SECRET",
                "VCR_API_APPLICATION_ID",
                "VCR_PRIVATE_KEY",
                "VCR_CODE_DIR",
                "VCR_ENDPOINT_URL_SCHEME",
                "VCR_DEBUGGER_URL_SCHEME",
                "VCR_REGION",
                "VCR_PORT",
                "FORCE_COLOR",
            ]
        );
        let get = |key: &str| env.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str());
        assert_eq!(get("VCR_PORT"), Some("3000"));
        assert_eq!(get("VCR_INSTANCE_PUBLIC_URL"), Some("https://debug-svc.example.com"));
        assert_eq!(get("FORCE_COLOR"), Some("1"));
    }

    #[test]
    fn instance_id_appended_when_known() {
        let mut with_id = spec(&["node"]);
        with_id.instance_id = "inst-1".into();
        let env = CommandGenerator::new(with_id).unwrap().environment();
        assert_eq!(
            env.last(),
            Some(&("INSTANCE_ID".to_string(), "inst-1".to_string()))
        );
    }

    fn var(name: &str, value: &str, secret: &str) -> EnvVar {
        EnvVar {
            name: name.into(),
            value: value.into(),
            secret: secret.into(),
        }
    }

    #[test]
    fn secrets_resolve_from_local_environment() {
        let local = |name: &str| (name == "LOCAL_TOKEN").then(|| "t0k3n".to_string());
        let resolved = resolve_environment(
            &[var("MODE", "debug", ""), var("TOKEN", "ignored", "LOCAL_TOKEN")],
            local,
        )
        .unwrap();
        assert_eq!(
            resolved,
            [
                ("MODE".to_string(), "debug".to_string()),
                ("TOKEN".to_string(), "t0k3n".to_string()),
            ]
        );
    }

    #[test]
    fn unexported_secret_is_an_error() {
        let err = resolve_environment(&[var("TOKEN", "", "NOT_EXPORTED")], |_| None).unwrap_err();
        assert_eq!(
            err.to_string(),
            "environment variable \"NOT_EXPORTED\" must be exported locally in debug mode"
        );
        let empty = resolve_environment(&[var("TOKEN", "", "EMPTY")], |_| Some(String::new()));
        assert!(matches!(empty, Err(LaunchError::MissingSecret(name)) if name == "EMPTY"));
    }

    #[test]
    fn user_variables_precede_debug_variables() {
        let mut with_user = spec(&["node"]);
        with_user.user_environment = vec![
            ("MODE".into(), "debug".into()),
            ("VCR_PORT".into(), "1".into()),
        ];
        let env = CommandGenerator::new(with_user).unwrap().environment();
        assert_eq!(env[0], ("MODE".to_string(), "debug".to_string()));
        let last_port = env.iter().rev().find(|(k, _)| k == "VCR_PORT").unwrap();
        assert_eq!(last_port.1, "3000");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn child_sees_injected_environment() {
        let gen = CommandGenerator::new(spec(&[
            "sh",
            "-c",
            r#"test "$VCR_PORT" = 3000 && test "$DEBUG" = true && test "$API_ACCOUNT_SECRET" = secret"#,
        ]))
        .unwrap();
        let mut app = gen.spawn().unwrap();
        assert!(app.wait().await.unwrap().success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn missing_program_fails_to_spawn() {
        let gen = CommandGenerator::new(spec(&["/definitely/not/here"])).unwrap();
        let err = gen.spawn().err().unwrap();
        assert!(err.to_string().starts_with("failed to start /definitely/not/here: "));
    }
}
