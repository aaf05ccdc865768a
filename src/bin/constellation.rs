//! `constellation`: the HTTP-client CLI over a running `constellation serve`
//! instance (`serve` itself boots the server in-process). Grounded in the
//! teacher's `dashflow-cli/src/main.rs` (`#[derive(Parser)]` top-level `Cli`
//! with a `#[derive(Subcommand)]` enum of per-command `Args` structs, each
//! with an async `run`, dispatched from a single `#[tokio::main] main`) and
//! its `reqwest` dependency, reused here for the same reason: talking over
//! the network to a remote service.
//!
//! Unlike the teacher's CLI, errors here carry a specific process exit code
//! (spec.md §6.5) rather than flowing through one opaque `anyhow::Error`, so
//! this binary defines its own [`CliError`] instead of pulling in `anyhow`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;

use constellation::config::Config;
use constellation::value::CValue;

/// Input files (pipeline source, `--input` JSON) larger than this are
/// rejected before ever reaching the server (spec.md §6.5).
const MAX_INPUT_FILE_BYTES: u64 = 10 * 1024 * 1024;

#[derive(Parser)]
#[command(name = "constellation", version, about = "Constellation pipeline execution engine CLI")]
struct Cli {
    /// Base URL of a running constellation server.
    #[arg(long, global = true, default_value = "http://127.0.0.1:8080", env = "CONSTELLATION_SERVER")]
    server: String,

    /// API key sent as `Authorization: Bearer <key>`.
    #[arg(long, global = true, env = "CONSTELLATION_API_KEY")]
    api_key: Option<String>,

    /// Emit raw JSON instead of a human-readable summary.
    #[arg(long, global = true)]
    json: bool,

    /// Config file path, used only by `serve` (precedence: flag > env > `~/.constellation/config.json` > default).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile source and execute it in one step.
    Run(RunArgs),
    /// Compile source into a stored pipeline image without executing it.
    Compile(CompileArgs),
    /// Execute an already-compiled pipeline by hash or alias.
    Execute(ExecuteArgs),
    /// Inspect and manage stored pipeline images.
    #[command(subcommand)]
    Pipelines(PipelinesCommand),
    /// Inspect and manage suspended/completed executions.
    #[command(subcommand)]
    Executions(ExecutionsCommand),
    /// Canary rollout control.
    Deploy(DeployArgs),
    /// Boot the HTTP server in-process.
    Serve(ServeArgs),
}

#[derive(clap::Args)]
struct RunArgs {
    /// Path to pipeline source.
    source: PathBuf,
    /// Path to a JSON object of input values.
    #[arg(long)]
    input: Option<PathBuf>,
    /// Alias to register the compiled image under.
    #[arg(long)]
    name: Option<String>,
    /// Fail instead of suspending when inputs are missing.
    #[arg(long)]
    no_suspend: bool,
}

#[derive(clap::Args)]
struct CompileArgs {
    source: PathBuf,
    #[arg(long)]
    name: Option<String>,
}

#[derive(clap::Args)]
struct ExecuteArgs {
    /// Structural hash or alias name.
    #[arg(long = "ref")]
    pipeline_ref: String,
    #[arg(long)]
    input: Option<PathBuf>,
    #[arg(long)]
    no_suspend: bool,
    #[arg(long)]
    deadline_secs: Option<u64>,
}

#[derive(Subcommand)]
enum PipelinesCommand {
    List,
    Get { name: String },
    Rm { hash: String },
}

#[derive(Subcommand)]
enum ExecutionsCommand {
    List {
        #[arg(long)]
        structural_hash: Option<String>,
        #[arg(long)]
        missing_input: Option<String>,
    },
    Get {
        id: String,
    },
    Resume {
        id: String,
        #[arg(long)]
        input: Option<PathBuf>,
        #[arg(long)]
        no_suspend: bool,
        #[arg(long)]
        deadline_secs: Option<u64>,
    },
    Rm {
        id: String,
    },
}

#[derive(clap::Args)]
struct DeployArgs {
    #[command(subcommand)]
    command: CanaryCommand,
}

#[derive(Subcommand)]
enum CanaryCommand {
    Start {
        name: String,
        #[arg(long)]
        old_hash: Option<String>,
        #[arg(long)]
        new_hash: String,
        #[arg(long)]
        min_requests: Option<u64>,
        #[arg(long)]
        error_threshold: Option<f64>,
        #[arg(long)]
        initial_weight: Option<f64>,
        /// Comma-separated ascending weights ending in 1.0, e.g. "0.1,0.5,1.0".
        #[arg(long, value_delimiter = ',')]
        promotion_steps: Option<Vec<f64>>,
        #[arg(long)]
        observation_window_secs: Option<u64>,
        #[arg(long)]
        latency_threshold_ms: Option<f64>,
        #[arg(long)]
        auto_promote: Option<bool>,
    },
    Promote {
        name: String,
    },
    Rollback {
        name: String,
    },
    Status {
        name: String,
    },
}

#[derive(clap::Args)]
struct ServeArgs {
    #[arg(long)]
    bind_addr: Option<String>,
}

/// Exit codes (spec.md §6.5).
mod exit {
    pub const SUCCESS: u8 = 0;
    pub const COMPILE_ERROR: u8 = 1;
    pub const RUNTIME_ERROR: u8 = 2;
    pub const CONNECTION_ERROR: u8 = 3;
    pub const AUTH_ERROR: u8 = 4;
    pub const NOT_FOUND: u8 = 5;
    pub const CONFLICT: u8 = 6;
    pub const USAGE_ERROR: u8 = 10;
}

/// The shape of every error response body the API emits
/// (`api::middleware::error_response`).
#[derive(serde::Deserialize)]
struct ApiErrorBody {
    kind: String,
    message: String,
}

/// A CLI-level failure, already carrying the exit code it should produce.
struct CliError {
    code: u8,
    message: String,
}

impl CliError {
    fn usage(message: impl Into<String>) -> Self {
        Self { code: exit::USAGE_ERROR, message: message.into() }
    }

    fn connection(message: impl Into<String>) -> Self {
        Self { code: exit::CONNECTION_ERROR, message: message.into() }
    }

    fn from_status_and_kind(status: u16, kind: &str, message: String) -> Self {
        let code = match (status, kind) {
            (_, "CompileError") => exit::COMPILE_ERROR,
            (401, _) | (403, _) => exit::AUTH_ERROR,
            (404, _) => exit::NOT_FOUND,
            (409, _) => exit::CONFLICT,
            _ => exit::RUNTIME_ERROR,
        };
        Self { code, message: format!("{kind}: {message}") }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match dispatch(cli).await {
        Ok(()) => ExitCode::from(exit::SUCCESS),
        Err(err) => {
            eprintln!("error: {}", err.message);
            ExitCode::from(err.code)
        }
    }
}

async fn dispatch(cli: Cli) -> Result<(), CliError> {
    let json = cli.json;
    match cli.command {
        Commands::Serve(args) => run_serve(cli.config.as_deref(), args).await,
        other => {
            let client = ApiClient::new(cli.server, cli.api_key);
            match other {
                Commands::Run(args) => cmd_run(&client, args, json).await,
                Commands::Compile(args) => cmd_compile(&client, args, json).await,
                Commands::Execute(args) => cmd_execute(&client, args, json).await,
                Commands::Pipelines(cmd) => cmd_pipelines(&client, cmd, json).await,
                Commands::Executions(cmd) => cmd_executions(&client, cmd, json).await,
                Commands::Deploy(args) => cmd_deploy(&client, args, json).await,
                Commands::Serve(_) => unreachable!("handled above"),
            }
        }
    }
}

/// Thin wrapper over `reqwest::Client` translating transport failures into
/// [`CliError::connection`] and API error bodies into
/// [`CliError::from_status_and_kind`].
struct ApiClient {
    http: reqwest::Client,
    base: String,
    api_key: Option<String>,
}

impl ApiClient {
    fn new(base: String, api_key: Option<String>) -> Self {
        Self { http: reqwest::Client::new(), base: base.trim_end_matches('/').to_string(), api_key }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self.http.request(method, format!("{}{}", self.base, path));
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {key}"));
        }
        req
    }

    async fn send_json<T: serde::de::DeserializeOwned>(&self, req: reqwest::RequestBuilder) -> Result<T, CliError> {
        let response = req.send().await.map_err(|e| CliError::connection(format!("request to {} failed: {e}", self.base)))?;
        let status = response.status();
        if status.is_success() {
            response.json::<T>().await.map_err(|e| CliError::connection(format!("invalid response body: {e}")))
        } else {
            let body = response.text().await.unwrap_or_default();
            match serde_json::from_str::<ApiErrorBody>(&body) {
                Ok(err) => Err(CliError::from_status_and_kind(status.as_u16(), &err.kind, err.message)),
                Err(_) => Err(CliError::from_status_and_kind(status.as_u16(), "Internal", body)),
            }
        }
    }

    async fn send_no_body(&self, req: reqwest::RequestBuilder) -> Result<(), CliError> {
        let response = req.send().await.map_err(|e| CliError::connection(format!("request to {} failed: {e}", self.base)))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            match serde_json::from_str::<ApiErrorBody>(&body) {
                Ok(err) => Err(CliError::from_status_and_kind(status.as_u16(), &err.kind, err.message)),
                Err(_) => Err(CliError::from_status_and_kind(status.as_u16(), "Internal", body)),
            }
        }
    }
}

fn read_capped(path: &Path) -> Result<String, CliError> {
    let meta = std::fs::metadata(path).map_err(|e| CliError::usage(format!("cannot read {}: {e}", path.display())))?;
    if meta.len() > MAX_INPUT_FILE_BYTES {
        return Err(CliError::usage(format!("{} exceeds the 10 MiB input file cap", path.display())));
    }
    std::fs::read_to_string(path).map_err(|e| CliError::usage(format!("cannot read {}: {e}", path.display())))
}

fn read_inputs(path: &Option<PathBuf>) -> Result<BTreeMap<String, CValue>, CliError> {
    match path {
        None => Ok(BTreeMap::new()),
        Some(path) => {
            let raw = read_capped(path)?;
            serde_json::from_str(&raw).map_err(|e| CliError::usage(format!("{}: not a JSON object of inputs: {e}", path.display())))
        }
    }
}

fn print_result<T: Serialize>(value: &T, json: bool) {
    if json {
        println!("{}", serde_json::to_string_pretty(value).unwrap_or_else(|_| "null".to_string()));
    } else {
        print_human(&serde_json::to_value(value).unwrap_or(Value::Null));
    }
}

/// A minimally-formatted fallback for `--json`-less output: flatten to
/// `key: value` lines rather than pretty-printing JSON structure.
fn print_human(value: &Value) {
    match value {
        Value::Object(map) => {
            for (key, val) in map {
                println!("{key}: {}", human_scalar(val));
            }
        }
        Value::Array(items) => {
            for item in items {
                println!("{}", human_scalar(item));
            }
        }
        other => println!("{}", human_scalar(other)),
    }
}

fn human_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

async fn cmd_run(client: &ApiClient, args: RunArgs, json: bool) -> Result<(), CliError> {
    let source = read_capped(&args.source)?;
    let inputs = read_inputs(&args.input)?;
    let body = serde_json::json!({
        "source": source,
        "inputs": inputs,
        "dagName": args.name,
        "allowSuspend": !args.no_suspend,
    });
    let result: Value = client.send_json(client.request(reqwest::Method::POST, "/run").json(&body)).await?;
    print_result(&result, json);
    Ok(())
}

async fn cmd_compile(client: &ApiClient, args: CompileArgs, json: bool) -> Result<(), CliError> {
    let source = read_capped(&args.source)?;
    let body = serde_json::json!({ "source": source, "name": args.name });
    let result: Value = client.send_json(client.request(reqwest::Method::POST, "/compile").json(&body)).await?;
    print_result(&result, json);
    Ok(())
}

async fn cmd_execute(client: &ApiClient, args: ExecuteArgs, json: bool) -> Result<(), CliError> {
    let inputs = read_inputs(&args.input)?;
    let body = serde_json::json!({
        "ref": args.pipeline_ref,
        "inputs": inputs,
        "options": {
            "allowSuspend": !args.no_suspend,
            "deadlineSecs": args.deadline_secs,
        },
    });
    let result: Value = client.send_json(client.request(reqwest::Method::POST, "/execute").json(&body)).await?;
    print_result(&result, json);
    Ok(())
}

async fn cmd_pipelines(client: &ApiClient, cmd: PipelinesCommand, json: bool) -> Result<(), CliError> {
    match cmd {
        PipelinesCommand::List => {
            let result: Value = client.send_json(client.request(reqwest::Method::GET, "/pipelines")).await?;
            print_result(&result, json);
        }
        PipelinesCommand::Get { name } => {
            let path = format!("/pipelines/{name}");
            let result: Value = client.send_json(client.request(reqwest::Method::GET, &path)).await?;
            print_result(&result, json);
        }
        PipelinesCommand::Rm { hash } => {
            let path = format!("/pipelines/{hash}");
            client.send_no_body(client.request(reqwest::Method::DELETE, &path)).await?;
            if json {
                println!("{}", serde_json::json!({ "removed": hash }));
            } else {
                println!("removed: {hash}");
            }
        }
    }
    Ok(())
}

async fn cmd_executions(client: &ApiClient, cmd: ExecutionsCommand, json: bool) -> Result<(), CliError> {
    match cmd {
        ExecutionsCommand::List { structural_hash, missing_input } => {
            let mut query = Vec::new();
            if let Some(h) = &structural_hash {
                query.push(("structural_hash", h.clone()));
            }
            if let Some(m) = &missing_input {
                query.push(("missing_input", m.clone()));
            }
            let result: Value = client.send_json(client.request(reqwest::Method::GET, "/executions").query(&query)).await?;
            print_result(&result, json);
        }
        ExecutionsCommand::Get { id } => {
            let path = format!("/executions/{id}");
            let result: Value = client.send_json(client.request(reqwest::Method::GET, &path)).await?;
            print_result(&result, json);
        }
        ExecutionsCommand::Resume { id, input, no_suspend, deadline_secs } => {
            let inputs = read_inputs(&input)?;
            let path = format!("/executions/{id}/resume");
            let body = serde_json::json!({
                "additionalInputs": inputs,
                "resolvedNodes": {},
                "options": { "allowSuspend": !no_suspend, "deadlineSecs": deadline_secs },
            });
            let result: Value = client.send_json(client.request(reqwest::Method::POST, &path).json(&body)).await?;
            print_result(&result, json);
        }
        ExecutionsCommand::Rm { id } => {
            let path = format!("/executions/{id}");
            client.send_no_body(client.request(reqwest::Method::DELETE, &path)).await?;
            if json {
                println!("{}", serde_json::json!({ "removed": id }));
            } else {
                println!("removed: {id}");
            }
        }
    }
    Ok(())
}

async fn cmd_deploy(client: &ApiClient, args: DeployArgs, json: bool) -> Result<(), CliError> {
    match args.command {
        CanaryCommand::Start {
            name,
            old_hash,
            new_hash,
            min_requests,
            error_threshold,
            initial_weight,
            promotion_steps,
            observation_window_secs,
            latency_threshold_ms,
            auto_promote,
        } => {
            let path = format!("/deploy/canary/{name}");
            let body = serde_json::json!({
                "oldHash": old_hash,
                "newHash": new_hash,
                "config": {
                    "minRequests": min_requests,
                    "errorThreshold": error_threshold,
                    "initialWeight": initial_weight,
                    "promotionSteps": promotion_steps,
                    "observationWindowSecs": observation_window_secs,
                    "latencyThresholdMs": latency_threshold_ms,
                    "autoPromote": auto_promote,
                },
            });
            let result: Value = client.send_json(client.request(reqwest::Method::POST, &path).json(&body)).await?;
            print_result(&result, json);
        }
        CanaryCommand::Promote { name } => {
            let path = format!("/deploy/canary/{name}/promote");
            let result: Value = client.send_json(client.request(reqwest::Method::POST, &path)).await?;
            print_result(&result, json);
        }
        CanaryCommand::Rollback { name } => {
            let path = format!("/deploy/canary/{name}/rollback");
            let result: Value = client.send_json(client.request(reqwest::Method::POST, &path)).await?;
            print_result(&result, json);
        }
        CanaryCommand::Status { name } => {
            let path = format!("/deploy/canary/{name}");
            let result: Value = client.send_json(client.request(reqwest::Method::GET, &path)).await?;
            print_result(&result, json);
        }
    }
    Ok(())
}

async fn run_serve(config_path: Option<&Path>, args: ServeArgs) -> Result<(), CliError> {
    let default_config_path = dirs_config_path();
    let path = config_path.or(default_config_path.as_deref());
    let mut config =
        Config::load(path).map_err(|e| CliError { code: exit::RUNTIME_ERROR, message: format!("failed to load config: {e}") })?;
    if let Some(bind_addr) = args.bind_addr {
        config.bind_addr = bind_addr;
    }

    let state = constellation::api::AppState::new(config)
        .await
        .map_err(|e| CliError { code: exit::RUNTIME_ERROR, message: format!("failed to initialize: {e}") })?;

    constellation::api::serve(state).await.map_err(|e| CliError { code: exit::RUNTIME_ERROR, message: format!("server error: {e}") })
}

/// `~/.constellation/config.json`, the lowest-precedence config source
/// (spec.md §6.5: flag > env > this file > built-in default).
fn dirs_config_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".constellation").join("config.json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_with_flags() {
        let cli = Cli::try_parse_from(["constellation", "run", "pipeline.csl", "--input", "in.json", "--json"]).unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.source, PathBuf::from("pipeline.csl"));
                assert_eq!(args.input, Some(PathBuf::from("in.json")));
            }
            _ => panic!("expected Run"),
        }
    }

    #[test]
    fn parses_nested_pipelines_subcommand() {
        let cli = Cli::try_parse_from(["constellation", "pipelines", "get", "my-pipeline"]).unwrap();
        match cli.command {
            Commands::Pipelines(PipelinesCommand::Get { name }) => assert_eq!(name, "my-pipeline"),
            _ => panic!("expected Pipelines::Get"),
        }
    }

    #[test]
    fn parses_deploy_canary_start() {
        let cli = Cli::try_parse_from(["constellation", "deploy", "canary", "start", "my-pipeline", "--new-hash", "abcd"]).unwrap();
        match cli.command {
            Commands::Deploy(DeployArgs { command: CanaryCommand::Start { name, new_hash, .. } }) => {
                assert_eq!(name, "my-pipeline");
                assert_eq!(new_hash, "abcd");
            }
            _ => panic!("expected Deploy(Canary::Start)"),
        }
    }

    #[test]
    fn rejects_unknown_subcommand() {
        assert!(Cli::try_parse_from(["constellation", "bogus"]).is_err());
    }

    #[test]
    fn exit_code_maps_compile_error_to_one() {
        let err = CliError::from_status_and_kind(400, "CompileError", "bad syntax".to_string());
        assert_eq!(err.code, exit::COMPILE_ERROR);
    }

    #[test]
    fn exit_code_maps_not_found_to_five() {
        let err = CliError::from_status_and_kind(404, "PipelineNotFound", "missing".to_string());
        assert_eq!(err.code, exit::NOT_FOUND);
    }

    #[test]
    fn exit_code_maps_conflict_to_six() {
        let err = CliError::from_status_and_kind(409, "ResumeInProgress", "locked".to_string());
        assert_eq!(err.code, exit::CONFLICT);
    }
}
