//! Collaborators backed by external commands.
//!
//! Each stage is a shell command from the `[collaborators]` config section.
//! Inputs are passed as `SARLAYER_*` environment variables and the command
//! reports its result as a JSON document on stdout (the whole output, or its
//! last non-empty line so progress messages may precede it).
//!
//! | Stage      | Environment                                                       | stdout JSON                         |
//! |------------|-------------------------------------------------------------------|-------------------------------------|
//! | acquire    | `BOUNDS`, `WKT`, `START`, `END`, `DATE`, `PHASE`, `OUTPUT_DIR`    | `{scene_id, footprint, acquisition_date?, local_path}` |
//! | ancillary  | `BOUNDS`, `OUTPUT_DIR`                                            | `{path}`                            |
//! | correction | `SCENE_ID`, `SCENE_PATH`, `ANCILLARY`, `OUTPUT_DIR`, `SLOT`       | `{outputs: {kind: path}}` or empty  |
//! | clip       | `INPUTS` (JSON map), `REFERENCE`, `BOUNDS`, `OUTPUT`              | `{path}` or empty                   |
//!
//! `SARLAYER_STAGE` and `SARLAYER_REQUEST_ID` are always set. The correction
//! command additionally gets `CUDA_VISIBLE_DEVICES` set to its slot. When
//! the correction command prints nothing, `*VV*.tif` / `*VH*.tif` are picked
//! up from its output directory; a single-polarization result reuses VV for
//! VH.

use std::path::PathBuf;
use std::process::Stdio;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info};

use super::{
    AcquireInput, AcquiredScene, AcquisitionSource, AncillaryInput, AncillarySource, BoxFuture,
    ClipInput, Clipper, CollaboratorError, CollaboratorResult, CorrectionInput, CorrectionRunner,
    Stage,
};
use crate::config::CollaboratorSettings;
use crate::geo::BoundingBox;
use crate::layout::find_polarization_outputs;
use crate::registry::{OutputMap, OUTPUT_VH, OUTPUT_VV};

/// Maximum number of stderr bytes kept in a failure message.
const STDERR_TAIL_BYTES: usize = 2048;

/// Shell commands for each stage. `None` means the stage is not available.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSet {
    pub acquire: Option<String>,
    pub ancillary: Option<String>,
    pub correction: Option<String>,
    pub clip: Option<String>,
}

impl From<&CollaboratorSettings> for CommandSet {
    fn from(settings: &CollaboratorSettings) -> Self {
        Self {
            acquire: settings.acquire.clone(),
            ancillary: settings.ancillary.clone(),
            correction: settings.correction.clone(),
            clip: settings.clip.clone(),
        }
    }
}

impl CommandSet {
    /// Stages without a configured command.
    pub fn missing_stages(&self) -> Vec<Stage> {
        [
            (Stage::Acquire, &self.acquire),
            (Stage::Ancillary, &self.ancillary),
            (Stage::Correction, &self.correction),
            (Stage::Clip, &self.clip),
        ]
        .into_iter()
        .filter(|(_, command)| command.is_none())
        .map(|(stage, _)| stage)
        .collect()
    }
}

#[derive(Deserialize)]
struct PathReply {
    path: PathBuf,
}

#[derive(Deserialize)]
struct OutputsReply {
    #[serde(default)]
    outputs: OutputMap,
}

/// Runs each stage as `sh -c <command>`.
#[derive(Debug, Clone)]
pub struct CommandCollaborators {
    commands: CommandSet,
    shell: String,
}

impl CommandCollaborators {
    pub fn new(commands: CommandSet) -> Self {
        Self {
            commands,
            shell: "sh".to_string(),
        }
    }

    /// Use a different shell (must accept `-c <command>`).
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn commands(&self) -> &CommandSet {
        &self.commands
    }

    fn command_for(&self, stage: Stage) -> CollaboratorResult<&str> {
        let command = match stage {
            Stage::Acquire => &self.commands.acquire,
            Stage::Ancillary => &self.commands.ancillary,
            Stage::Correction => &self.commands.correction,
            Stage::Clip => &self.commands.clip,
        };
        command
            .as_deref()
            .ok_or(CollaboratorError::NotConfigured { stage })
    }

    /// Run the stage command and return its stdout.
    async fn run(
        &self,
        stage: Stage,
        request_id: &str,
        env: Vec<(&'static str, String)>,
    ) -> CollaboratorResult<String> {
        let command = self.command_for(stage)?;
        debug!(stage = %stage, request_id, command, "Running collaborator command");

        let output = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .env("SARLAYER_STAGE", stage.as_str())
            .env("SARLAYER_REQUEST_ID", request_id)
            .envs(env)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| CollaboratorError::Spawn { stage, source })?;

        if !output.status.success() {
            return Err(CollaboratorError::Failed {
                stage,
                status: output.status.to_string(),
                stderr: stderr_tail(&output.stderr),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl AcquisitionSource for CommandCollaborators {
    fn acquire(&self, input: AcquireInput) -> BoxFuture<'_, CollaboratorResult<AcquiredScene>> {
        Box::pin(async move {
            let mut env = vec![
                ("SARLAYER_BOUNDS", bounds_env(&input.footprint)),
                ("SARLAYER_WKT", input.footprint.to_wkt()),
                ("SARLAYER_START", input.window.start.to_rfc3339()),
                ("SARLAYER_END", input.window.end.to_rfc3339()),
                ("SARLAYER_PHASE", input.phase.to_string()),
                ("SARLAYER_OUTPUT_DIR", path_env(&input.dest_dir)),
            ];
            if let Some(date) = input.reference_date {
                env.push(("SARLAYER_DATE", date.to_rfc3339()));
            }

            let stdout = self.run(Stage::Acquire, &input.request_id, env).await?;
            let scene: AcquiredScene = parse_reply(Stage::Acquire, &stdout)?;
            info!(request_id = %input.request_id, scene_id = %scene.scene_id, "Acquired scene");
            Ok(scene)
        })
    }
}

impl AncillarySource for CommandCollaborators {
    fn fetch_ancillary(&self, input: AncillaryInput) -> BoxFuture<'_, CollaboratorResult<PathBuf>> {
        Box::pin(async move {
            let env = vec![
                ("SARLAYER_BOUNDS", bounds_env(&input.footprint)),
                ("SARLAYER_OUTPUT_DIR", path_env(&input.dest_dir)),
            ];
            let stdout = self.run(Stage::Ancillary, &input.request_id, env).await?;
            let reply: PathReply = parse_reply(Stage::Ancillary, &stdout)?;
            Ok(reply.path)
        })
    }
}

impl CorrectionRunner for CommandCollaborators {
    fn run_correction(
        &self,
        input: CorrectionInput,
    ) -> BoxFuture<'_, CollaboratorResult<OutputMap>> {
        Box::pin(async move {
            let env = vec![
                ("SARLAYER_SCENE_ID", input.scene.scene_id.clone()),
                ("SARLAYER_SCENE_PATH", path_env(&input.scene.local_path)),
                ("SARLAYER_ANCILLARY", path_env(&input.ancillary)),
                ("SARLAYER_OUTPUT_DIR", path_env(&input.output_dir)),
                ("SARLAYER_SLOT", input.slot.to_string()),
                ("CUDA_VISIBLE_DEVICES", input.slot.to_string()),
            ];
            let stdout = self.run(Stage::Correction, &input.request_id, env).await?;

            let mut outputs = if stdout.trim().is_empty() {
                OutputMap::new()
            } else {
                parse_reply::<OutputsReply>(Stage::Correction, &stdout)?.outputs
            };
            if outputs.is_empty() {
                outputs = find_polarization_outputs(&input.output_dir);
            }
            complete_polarizations(outputs)
        })
    }
}

impl Clipper for CommandCollaborators {
    fn produce_clipped(&self, input: ClipInput) -> BoxFuture<'_, CollaboratorResult<PathBuf>> {
        Box::pin(async move {
            let inputs = serde_json::to_string(&input.outputs).map_err(|e| {
                CollaboratorError::InvalidOutput {
                    stage: Stage::Clip,
                    reason: e.to_string(),
                }
            })?;
            let env = vec![
                ("SARLAYER_INPUTS", inputs),
                ("SARLAYER_REFERENCE", path_env(&input.reference)),
                ("SARLAYER_BOUNDS", bounds_env(&input.footprint)),
                ("SARLAYER_OUTPUT", path_env(&input.destination)),
            ];
            let stdout = self.run(Stage::Clip, &input.request_id, env).await?;

            if stdout.trim().is_empty() {
                if input.destination.is_file() {
                    return Ok(input.destination);
                }
                return Err(CollaboratorError::InvalidOutput {
                    stage: Stage::Clip,
                    reason: format!("{} was not written", input.destination.display()),
                });
            }
            let reply: PathReply = parse_reply(Stage::Clip, &stdout)?;
            Ok(reply.path)
        })
    }
}

/// VV is required; a missing VH reuses VV (single-polarization scenes).
fn complete_polarizations(mut outputs: OutputMap) -> CollaboratorResult<OutputMap> {
    let vv = outputs
        .get(OUTPUT_VV)
        .cloned()
        .ok_or_else(|| CollaboratorError::InvalidOutput {
            stage: Stage::Correction,
            reason: "no VV output produced".to_string(),
        })?;
    outputs.entry(OUTPUT_VH.to_string()).or_insert(vv);
    Ok(outputs)
}

fn parse_reply<T: DeserializeOwned>(stage: Stage, stdout: &str) -> CollaboratorResult<T> {
    if let Ok(value) = serde_json::from_str(stdout) {
        return Ok(value);
    }
    let last_line = stdout
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("");
    serde_json::from_str(last_line).map_err(|e| CollaboratorError::InvalidOutput {
        stage,
        reason: format!("expected JSON result on stdout: {}", e),
    })
}

fn bounds_env(bounds: &BoundingBox) -> String {
    let [w, s, e, n] = bounds.to_array();
    format!("{},{},{},{}", w, s, e, n)
}

fn path_env(path: &std::path::Path) -> String {
    path.to_string_lossy().into_owned()
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    if text.len() <= STDERR_TAIL_BYTES {
        return text.to_string();
    }
    let mut start = text.len() - STDERR_TAIL_BYTES;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &text[start..])
}
