//! Handler that runs an external command and records it in the job's execution log.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, warn};

use sluice_core::{ExecutionLogEntry, JobRecord, JobStage};

use super::handler::{HandlerError, JobContext, JobHandler};

const DEFAULT_MAX_OUTPUT_BYTES: usize = 64 * 1024;

/// Program plus arguments.
///
/// Arguments may contain `{job_id}`, `{payload}` and `{stage}` placeholders,
/// filled in from the leased job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Parse a whitespace-separated command line; `None` when empty.
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }

    fn render_args(&self, job: &JobRecord) -> Vec<String> {
        let stage = job.stage.map(|s| s.as_str()).unwrap_or_default();
        self.args
            .iter()
            .map(|a| {
                a.replace("{job_id}", &job.id.to_string())
                    .replace("{payload}", job.payload_ref.as_str())
                    .replace("{stage}", stage)
            })
            .collect()
    }
}

/// Runs a configured command per job (optionally per stage).
///
/// Exit code 0 succeeds, any other exit is retryable, and a command that
/// cannot be spawned at all is fatal. The child is killed when the job is
/// cancelled. Every attempt is logged; `exit_code` stays empty when the
/// command never ran to completion.
#[derive(Debug, Clone)]
pub struct CommandHandler {
    default: CommandSpec,
    stages: HashMap<JobStage, CommandSpec>,
    timeout: Option<Duration>,
    max_output_bytes: usize,
}

impl CommandHandler {
    pub fn new(default: CommandSpec) -> Self {
        Self {
            default,
            stages: HashMap::new(),
            timeout: None,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }

    pub fn with_stage(mut self, stage: JobStage, spec: CommandSpec) -> Self {
        self.stages.insert(stage, spec);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_output_bytes(mut self, max: usize) -> Self {
        self.max_output_bytes = max;
        self
    }

    fn spec_for(&self, job: &JobRecord) -> &CommandSpec {
        job.stage
            .and_then(|s| self.stages.get(&s))
            .unwrap_or(&self.default)
    }

    /// Run the command; every attempt yields a log entry, even one that never started.
    async fn run(
        &self,
        job: &JobRecord,
        ctx: &JobContext,
    ) -> (ExecutionLogEntry, Result<(), HandlerError>) {
        let spec = self.spec_for(job);
        let args = spec.render_args(job);

        let mut command = tokio::process::Command::new(&spec.program);
        command.kill_on_drop(true);
        command.args(&args);
        command.env("SLUICE_JOB_ID", job.id.to_string());
        command.env("SLUICE_JOB_KIND", job.kind.as_str());
        command.env("SLUICE_PAYLOAD_REF", job.payload_ref.as_str());
        if let Some(stage) = job.stage {
            command.env("SLUICE_JOB_STAGE", stage.as_str());
        }
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        let started_at = Utc::now();
        let started = Instant::now();
        debug!(job_id = %job.id, program = %spec.program, args = ?args, "running command");

        let output = tokio::select! {
            output = wait_for_output(&mut command, self.timeout, &spec.program) => output,
            () = ctx.cancellation().cancelled() => {
                Err(HandlerError::retryable(format!("{} cancelled", spec.program)))
            }
        };

        let (output, exit_code, result) = match output {
            Ok(output) => {
                let exit_code = output.status.code();
                let result = match exit_code {
                    Some(0) => Ok(()),
                    Some(code) => Err(HandlerError::retryable(format!(
                        "{} exited with status {code}",
                        spec.program
                    ))),
                    None => Err(HandlerError::retryable(format!(
                        "{} was terminated by a signal",
                        spec.program
                    ))),
                };
                (self.combined_output(&output), exit_code, result)
            }
            Err(e) => (e.message().to_string(), None, Err(e)),
        };

        let entry = ExecutionLogEntry {
            key: log_key(job),
            command: spec.program.clone(),
            args,
            output,
            exit_code,
            started_at,
            duration_ms: Some(started.elapsed().as_millis() as u64),
        };
        (entry, result)
    }

    fn combined_output(&self, output: &std::process::Output) -> String {
        let mut combined = truncate_to_limit(&output.stdout, self.max_output_bytes);
        let stderr = truncate_to_limit(&output.stderr, self.max_output_bytes);
        if !stderr.is_empty() {
            if !combined.is_empty() && !combined.ends_with('\n') {
                combined.push('\n');
            }
            combined.push_str(&stderr);
        }
        combined
    }
}

#[async_trait::async_trait]
impl JobHandler for CommandHandler {
    async fn handle(&self, job: &JobRecord, ctx: &JobContext) -> Result<(), HandlerError> {
        let (entry, result) = self.run(job, ctx).await;

        if let Err(e) = ctx.logs().record(entry).await {
            // The lease may be gone; the worker notices on its next heartbeat.
            warn!(job_id = %job.id, error = %e, "failed to record execution log");
        }
        result
    }
}

async fn wait_for_output(
    command: &mut tokio::process::Command,
    timeout: Option<Duration>,
    program: &str,
) -> Result<std::process::Output, HandlerError> {
    let result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, command.output()).await {
            Ok(result) => result,
            Err(_) => {
                return Err(HandlerError::retryable(format!(
                    "{program} timed out after {limit:?}"
                )));
            }
        },
        None => command.output().await,
    };
    result.map_err(|e| HandlerError::fatal(format!("failed to run {program}: {e}")))
}

fn log_key(job: &JobRecord) -> String {
    match job.stage {
        Some(stage) => format!("{}.{}", job.kind, stage),
        None => format!("{}.run", job.kind),
    }
}

fn truncate_to_limit(bytes: &[u8], max: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= max {
        return text.into_owned();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n[output truncated]", &text[..end])
}
