//! Launch command builders for subprocess backends.
//!
//! A launcher knows how one kind of backend server is started and which
//! HTTP paths it serves. Everything else (ports, health checks, relay) is
//! shared by [`SubprocessEngine`](super::SubprocessEngine).

use serde::Deserialize;
use serde_json::{Map, Value};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use modelvisor_core::{EngineError, LaunchCommand};

use super::request::LoadModelRequest;

pub trait BackendLauncher: Send + Sync + fmt::Debug {
    /// Command that starts a server for `request` listening on `port`.
    fn build_command(
        &self,
        request: &LoadModelRequest,
        port: u16,
    ) -> Result<LaunchCommand, EngineError>;

    fn health_path(&self) -> &'static str {
        "/health"
    }

    fn chat_path(&self) -> &'static str {
        "/v1/chat/completions"
    }

    fn embeddings_path(&self) -> &'static str {
        "/v1/embeddings"
    }
}

/// File name of an executable on this platform.
pub fn executable_name(name: &str) -> String {
    format!("{name}{}", std::env::consts::EXE_SUFFIX)
}

/// llama.cpp's `llama-server`.
#[derive(Debug, Clone)]
pub struct LlamaServerLauncher {
    server_binary: PathBuf,
}

impl LlamaServerLauncher {
    pub const fn new(server_binary: PathBuf) -> Self {
        Self { server_binary }
    }

    /// Launcher for the `llama-server` inside an installed variant directory.
    pub fn in_dir(variant_dir: &Path) -> Self {
        Self::new(variant_dir.join(executable_name("llama-server")))
    }
}

/// Load options that never reach llama-server: catalog metadata, sampling
/// settings applied per request, and fields this adapter owns (`host`,
/// `port`, the model path).
const IGNORED_OPTIONS: &[&str] = &[
    "model", "model_alias", "embedding", "ai_prompt", "ai_template", "prompt_template",
    "mmproj", "system_prompt", "created", "stream", "name", "os", "owned_by", "files",
    "gpu_arch", "quantization_method", "engine", "system_template", "max_tokens",
    "user_template", "user_prompt", "min_keep", "mirostat", "mirostat_eta", "mirostat_tau",
    "text_model", "version", "n_probs", "object", "penalize_nl", "precision", "size", "stop",
    "tfs_z", "typ_p", "model_path", "llama_model_path", "host", "port",
];

/// Load options whose llama-server flag differs from `--<key>`.
const RENAMED_OPTIONS: &[(&str, &str)] = &[
    ("cpu_threads", "--threads"),
    ("n_ubatch", "--ubatch-size"),
    ("n_batch", "--batch-size"),
    ("n_parallel", "--parallel"),
    ("temperature", "--temp"),
    ("top_k", "--top-k"),
    ("top_p", "--top-p"),
    ("min_p", "--min-p"),
    ("dynatemp_exponent", "--dynatemp-exp"),
    ("ctx_len", "--ctx-size"),
    ("ngl", "-ngl"),
];

fn option_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Array(_) => Some(value.to_string()),
        Value::Null | Value::Bool(_) | Value::Object(_) => None,
    }
}

/// llama-server flags for the pass-through members of a load request.
///
/// Options are emitted in key order. `model_type: "embedding"` enables
/// `--embedding`; a `true` boolean becomes a bare flag; `false`, `null`
/// and objects are dropped.
fn llama_server_options(extra: &Map<String, Value>) -> Vec<String> {
    let mut options: Vec<(&String, &Value)> = extra.iter().collect();
    options.sort_by(|a, b| a.0.cmp(b.0));

    let mut args = Vec::new();
    for (key, value) in options {
        if IGNORED_OPTIONS.contains(&key.as_str()) {
            continue;
        }
        if key == "model_type" {
            if value.as_str() == Some("embedding") {
                args.push("--embedding".to_string());
            }
            continue;
        }

        let flag = RENAMED_OPTIONS
            .iter()
            .find(|(name, _)| *name == key.as_str())
            .map_or_else(|| format!("--{key}"), |(_, flag)| (*flag).to_string());
        match value {
            Value::Bool(true) => args.push(flag),
            other => {
                if let Some(v) = option_value(other) {
                    args.push(flag);
                    args.push(v);
                }
            }
        }
    }
    args
}

impl BackendLauncher for LlamaServerLauncher {
    fn build_command(
        &self,
        request: &LoadModelRequest,
        port: u16,
    ) -> Result<LaunchCommand, EngineError> {
        let model_path = request.require_model_path()?;
        let mut cmd = LaunchCommand::new(&self.server_binary)
            .arg("-m")
            .arg(model_path.display().to_string())
            .args(["--host", "127.0.0.1", "--port"])
            .arg(port.to_string())
            .arg("--jinja")
            .args(llama_server_options(&request.extra));

        if let Some(parent) = self.server_binary.parent() {
            cmd = cmd.current_dir(parent);
        }
        Ok(cmd)
    }
}

/// Model config consumed by [`PythonLauncher`], read from YAML
/// (`.yml`/`.yaml`) or JSON.
#[derive(Debug, Clone, Deserialize)]
pub struct PythonModelConfig {
    /// Script (and arguments) run inside the uv environment.
    pub entrypoint: Vec<String>,
    /// Project directory holding the uv environment; defaults to the
    /// config file's directory.
    #[serde(default)]
    pub env_dir: Option<PathBuf>,
    #[serde(default = "default_port_flag")]
    pub port_flag: String,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

fn default_port_flag() -> String {
    "--port".to_string()
}

impl PythonModelConfig {
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let raw = fs::read_to_string(path).map_err(|e| {
            EngineError::InvalidRequest(format!(
                "Unable to read model config {}: {e}",
                path.display()
            ))
        })?;
        let is_yaml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("yml") || ext.eq_ignore_ascii_case("yaml"));
        let parsed: Result<Self, String> = if is_yaml {
            serde_yaml::from_str(&raw).map_err(|e| e.to_string())
        } else {
            serde_json::from_str(&raw).map_err(|e| e.to_string())
        };
        let config = parsed.map_err(|e| {
            EngineError::InvalidRequest(format!("Invalid model config {}: {e}", path.display()))
        })?;
        if config.entrypoint.is_empty() {
            return Err(EngineError::missing_field("entrypoint"));
        }
        Ok(config)
    }
}

/// Python backends run through `uv`, described by a JSON model config.
#[derive(Debug, Clone)]
pub struct PythonLauncher {
    uv: PathBuf,
    cache_dir: Option<PathBuf>,
}

impl PythonLauncher {
    pub const fn new(uv: PathBuf, cache_dir: Option<PathBuf>) -> Self {
        Self { uv, cache_dir }
    }

    fn uv_command(&self) -> LaunchCommand {
        let mut cmd = LaunchCommand::new(&self.uv);
        if let Some(cache) = &self.cache_dir {
            cmd = cmd.arg("--cache-dir").arg(cache.display().to_string());
        }
        cmd
    }
}

impl BackendLauncher for PythonLauncher {
    fn build_command(
        &self,
        request: &LoadModelRequest,
        port: u16,
    ) -> Result<LaunchCommand, EngineError> {
        let config_path = request.require_model_path()?;
        let config = PythonModelConfig::load(config_path)?;
        let env_dir = config
            .env_dir
            .clone()
            .or_else(|| config_path.parent().map(Path::to_path_buf))
            .unwrap_or_default();

        Ok(self
            .uv_command()
            .arg("--directory")
            .arg(env_dir.display().to_string())
            .arg("run")
            .args(config.entrypoint)
            .arg(config.port_flag)
            .arg(port.to_string())
            .args(config.extra_args)
            .current_dir(env_dir))
    }
}

/// vLLM served from a uv environment installed with the engine.
#[derive(Debug, Clone)]
pub struct VllmLauncher {
    python: PythonLauncher,
    env_dir: PathBuf,
}

impl VllmLauncher {
    pub fn new(uv: PathBuf, env_dir: PathBuf) -> Self {
        let cache = env_dir.join(".uv-cache");
        Self {
            python: PythonLauncher::new(uv, Some(cache)),
            env_dir,
        }
    }
}

impl BackendLauncher for VllmLauncher {
    fn build_command(
        &self,
        request: &LoadModelRequest,
        port: u16,
    ) -> Result<LaunchCommand, EngineError> {
        let model_path = request.require_model_path()?;
        Ok(self
            .python
            .uv_command()
            .arg("--directory")
            .arg(self.env_dir.display().to_string())
            .args(["run", "vllm", "serve"])
            .arg(model_path.display().to_string())
            .arg("--port")
            .arg(port.to_string())
            .arg("--served-model-name")
            .arg(request.model.clone())
            .current_dir(&self.env_dir))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn load(value: serde_json::Value) -> LoadModelRequest {
        LoadModelRequest::parse(value).unwrap()
    }

    #[test]
    fn llama_server_args() {
        let launcher = LlamaServerLauncher::new(PathBuf::from("/engines/llama/bin/llama-server"));
        let cmd = launcher
            .build_command(
                &load(json!({"model": "m1", "model_path": "/m/a.gguf", "ctx_len": 8192})),
                39282,
            )
            .unwrap();

        assert_eq!(
            cmd.args,
            vec![
                "-m", "/m/a.gguf", "--host", "127.0.0.1", "--port", "39282", "--jinja",
                "--ctx-size", "8192"
            ]
        );
        assert_eq!(cmd.current_dir, Some(PathBuf::from("/engines/llama/bin")));
    }

    #[test]
    fn llama_server_requires_model_path() {
        let launcher = LlamaServerLauncher::new(PathBuf::from("llama-server"));
        let err = launcher
            .build_command(&load(json!({"model": "m1"})), 1)
            .unwrap_err();
        assert_eq!(err.to_string(), "Missing required field: model_path");
    }

    #[test]
    fn python_launcher_reads_model_config() {
        let temp = tempdir().unwrap();
        let config = temp.path().join("model.json");
        fs::write(
            &config,
            r#"{"entrypoint": ["main.py", "--model", "whisper"], "extra_args": ["--workers", "1"]}"#,
        )
        .unwrap();

        let launcher = PythonLauncher::new(PathBuf::from("uv"), None);
        let cmd = launcher
            .build_command(
                &load(json!({"model": "whisper", "model_path": config})),
                39290,
            )
            .unwrap();

        let dir = temp.path().display().to_string();
        assert_eq!(
            cmd.args,
            vec![
                "--directory", dir.as_str(), "run", "main.py", "--model", "whisper", "--port",
                "39290", "--workers", "1"
            ]
        );
    }

    #[test]
    fn llama_server_forwards_load_options() {
        let launcher = LlamaServerLauncher::new(PathBuf::from("llama-server"));
        let cmd = launcher
            .build_command(
                &load(json!({
                    "model": "m1",
                    "model_path": "/m.gguf",
                    "cpu_threads": 8,
                    "n_parallel": 4,
                    "model_type": "embedding",
                    "flash_attn": true,
                    "cont_batching": false,
                    "cache_type_k": "q8_0",
                    "temperature": 0.7,
                    "stop": ["</s>"],
                    "max_tokens": 512
                })),
                40001,
            )
            .unwrap();

        assert_eq!(
            &cmd.args[7..],
            [
                "--cache_type_k",
                "q8_0",
                "--threads",
                "8",
                "--flash_attn",
                "--embedding",
                "--parallel",
                "4",
                "--temp",
                "0.7"
            ]
        );
    }

    #[test]
    fn pass_through_uses_generic_flag_names() {
        let mut extra = Map::new();
        extra.insert("seed".into(), json!(42));
        extra.insert("lora".into(), json!(["a.gguf", "b.gguf"]));
        extra.insert("engine".into(), json!("llama-cpp"));
        extra.insert("port".into(), json!(1));
        extra.insert("model_type".into(), json!("llm"));

        assert_eq!(
            llama_server_options(&extra),
            vec!["--lora", r#"["a.gguf","b.gguf"]"#, "--seed", "42"]
        );
    }

    #[test]
    fn python_launcher_reads_yaml_model_config() {
        let temp = tempdir().unwrap();
        let config = temp.path().join("model.yml");
        fs::write(
            &config,
            "entrypoint:\n  - main.py\n  - --model\n  - whisper\nport_flag: --listen-port\n",
        )
        .unwrap();

        let launcher = PythonLauncher::new(PathBuf::from("uv"), None);
        let cmd = launcher
            .build_command(
                &load(json!({"model": "whisper", "model_path": config})),
                39291,
            )
            .unwrap();

        let dir = temp.path().display().to_string();
        assert_eq!(
            cmd.args,
            vec![
                "--directory", dir.as_str(), "run", "main.py", "--model", "whisper",
                "--listen-port", "39291"
            ]
        );
    }

    #[test]
    fn python_launcher_rejects_malformed_yaml() {
        let temp = tempdir().unwrap();
        let config = temp.path().join("model.yaml");
        fs::write(&config, "entrypoint: [main.py\n").unwrap();

        let launcher = PythonLauncher::new(PathBuf::from("uv"), None);
        let err = launcher
            .build_command(&load(json!({"model": "m", "model_path": config})), 1)
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert!(err.to_string().starts_with("Invalid model config"));
    }

    #[test]
    fn python_launcher_rejects_unreadable_config() {
        let launcher = PythonLauncher::new(PathBuf::from("uv"), None);
        let err = launcher
            .build_command(
                &load(json!({"model": "m", "model_path": "/does/not/exist.json"})),
                1,
            )
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn vllm_serves_through_uv() {
        let launcher = VllmLauncher::new(PathBuf::from("uv"), PathBuf::from("/engines/vllm/env"));
        let cmd = launcher
            .build_command(&load(json!({"model": "qwen", "model_path": "/m/qwen"})), 39283)
            .unwrap();

        assert_eq!(cmd.args[0], "--cache-dir");
        assert!(cmd.args.windows(3).any(|w| w == ["run", "vllm", "serve"]));
        assert!(cmd.args.windows(2).any(|w| w == ["--port", "39283"]));
    }
}
