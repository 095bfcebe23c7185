//! Batch job submission
//!
//! Renders a SLURM batch script that runs one training process with the
//! given dataset and config, and hands it to `sbatch`. Resource arbitration
//! is left to the scheduler.

use anyhow::{Context, Result};
use std::io::Write;
use std::process::{Command, Stdio};
use thiserror::Error;

/// Argument errors for a submission
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("No dataset path provided")]
    MissingDataset,
    #[error("No config file provided")]
    MissingConfig,
}

/// Declarative resource request for one training job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlurmResources {
    pub job_name: String,
    pub nodes: u32,
    pub partition: String,
    /// Hardware constraint, e.g. a GPU model
    pub constraint: Option<String>,
    /// CPU cores for the single training task
    pub cores: u32,
    pub gpus: u32,
    /// Memory ceiling in `sbatch` syntax, e.g. `32G`
    pub mem: String,
    /// Wall-clock limit in `sbatch` syntax, e.g. `2-00:00:00`
    pub time: String,
    /// Log file path; `%j` expands to the job id
    pub log_path: String,
}

impl Default for SlurmResources {
    fn default() -> Self {
        Self {
            job_name: "gerbilizer".to_string(),
            nodes: 1,
            partition: "gpu".to_string(),
            constraint: Some("a100".to_string()),
            cores: 1,
            gpus: 1,
            mem: "32G".to_string(),
            time: "2-00:00:00".to_string(),
            log_path: "logs/gerbilizer_%j.log".to_string(),
        }
    }
}

impl SlurmResources {
    /// `#SBATCH` lines for these resources
    pub fn directives(&self) -> Vec<String> {
        let mut lines = vec![
            format!("#SBATCH --job-name={}", self.job_name),
            format!("#SBATCH --nodes={}", self.nodes),
            format!("#SBATCH --partition={}", self.partition),
        ];
        if let Some(constraint) = &self.constraint {
            lines.push(format!("#SBATCH --constraint={}", constraint));
        }
        lines.extend([
            "#SBATCH --ntasks=1".to_string(),
            format!("#SBATCH --cpus-per-task={}", self.cores),
            format!("#SBATCH --gres=gpu:{}", self.gpus),
            format!("#SBATCH --mem={}", self.mem),
            format!("#SBATCH --time={}", self.time),
            format!("#SBATCH --output={}", self.log_path),
        ]);
        lines
    }
}

/// A validated submission: dataset path and config path or name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub data_file: String,
    pub config: String,
}

impl JobRequest {
    /// Validate the two positional arguments; the dataset is checked first
    pub fn from_args(data_file: Option<&str>, config: Option<&str>) -> Result<Self, JobError> {
        let data_file = data_file
            .filter(|s| !s.is_empty())
            .ok_or(JobError::MissingDataset)?;
        let config = config
            .filter(|s| !s.is_empty())
            .ok_or(JobError::MissingConfig)?;
        Ok(Self {
            data_file: data_file.to_string(),
            config: config.to_string(),
        })
    }

    /// Training invocation run inside the job
    pub fn forward_command(&self, program: &str) -> Vec<String> {
        vec![
            program.to_string(),
            "run".to_string(),
            "--datafile".to_string(),
            self.data_file.clone(),
            "--config_fil".to_string(),
            self.config.clone(),
            "--pretrained".to_string(),
        ]
    }

    /// Complete batch script text
    pub fn render_script(&self, resources: &SlurmResources, program: &str) -> String {
        let mut script = String::from("#!/bin/bash\n");
        for line in resources.directives() {
            script.push_str(&line);
            script.push('\n');
        }
        script.push('\n');
        let command: Vec<String> = self
            .forward_command(program)
            .iter()
            .map(|arg| shell_quote(arg))
            .collect();
        script.push_str(&command.join(" "));
        script.push('\n');
        script
    }
}

/// Quote `arg` for a POSIX shell when it holds anything beyond plain path characters
pub fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+%@".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Pipe `script` to `sbatch`, returning its stdout (the job id line)
pub fn submit(script: &str) -> Result<String> {
    let mut child = Command::new("sbatch")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("Failed to run sbatch; is SLURM available on this machine?")?;

    child
        .stdin
        .take()
        .ok_or_else(|| anyhow::anyhow!("sbatch stdin unavailable"))?
        .write_all(script.as_bytes())
        .context("Failed to write batch script to sbatch")?;

    let output = child.wait_with_output().context("Failed to wait for sbatch")?;
    if !output.status.success() {
        anyhow::bail!(
            "sbatch exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    tracing::info!("{}", stdout);
    Ok(stdout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_arguments_in_order() {
        assert_eq!(JobRequest::from_args(None, None), Err(JobError::MissingDataset));
        assert_eq!(
            JobRequest::from_args(None, Some("default")),
            Err(JobError::MissingDataset)
        );
        assert_eq!(
            JobRequest::from_args(Some("data/"), None),
            Err(JobError::MissingConfig)
        );
        assert_eq!(
            JobRequest::from_args(Some(""), Some("default")),
            Err(JobError::MissingDataset)
        );
        assert_eq!(
            JobRequest::from_args(Some("data/"), Some("")),
            Err(JobError::MissingConfig)
        );
        assert_eq!(JobError::MissingDataset.to_string(), "No dataset path provided");
        assert_eq!(JobError::MissingConfig.to_string(), "No config file provided");
    }

    #[test]
    fn test_forward_command() {
        let job = JobRequest::from_args(Some("data/gerbil"), Some("default")).unwrap();
        assert_eq!(
            job.forward_command("gerbilizer"),
            vec![
                "gerbilizer",
                "run",
                "--datafile",
                "data/gerbil",
                "--config_fil",
                "default",
                "--pretrained"
            ]
        );
    }

    #[test]
    fn test_render_script() {
        let job = JobRequest::from_args(Some("my data"), Some("default")).unwrap();
        let script = job.render_script(&SlurmResources::default(), "/opt/bin/gerbilizer");
        assert!(script.starts_with("#!/bin/bash\n"));
        assert!(script.contains("#SBATCH --nodes=1\n"));
        assert!(script.contains("#SBATCH --ntasks=1\n"));
        assert!(script.contains("#SBATCH --cpus-per-task=1\n"));
        assert!(script.contains("#SBATCH --gres=gpu:1\n"));
        assert!(script.contains("#SBATCH --constraint=a100\n"));
        assert!(script.ends_with(
            "/opt/bin/gerbilizer run --datafile 'my data' --config_fil default --pretrained\n"
        ));

        let no_constraint = SlurmResources {
            constraint: None,
            ..Default::default()
        };
        assert!(!job.render_script(&no_constraint, "g").contains("--constraint"));

        let more_cores = SlurmResources {
            cores: 4,
            ..Default::default()
        };
        let script = job.render_script(&more_cores, "g");
        assert!(script.contains("#SBATCH --ntasks=1\n"));
        assert!(script.contains("#SBATCH --cpus-per-task=4\n"));
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("a/b-c.h5"), "a/b-c.h5");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
