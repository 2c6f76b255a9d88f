//! Per-flavour knowledge (spec §4.2): script rendering, submit/cancel/
//! accounting command templates, and status parsing, one implementation
//! per Grid Engine, Torque/PBS, LSF and SLURM.

use std::collections::BTreeMap;

use crate::resource::batch::CommonState;
use crate::task::Task;

/// Rendered submission script plus the command used to submit it.
#[derive(Debug, Clone)]
pub struct RenderedSubmission {
    pub script: String,
    pub submit_command: String,
}

/// Per-application-tag and global prologue/epilogue snippets (§4.2, §6).
#[derive(Debug, Clone, Default)]
pub struct ScriptHooks {
    pub prologue_global: Option<String>,
    pub prologue_per_tag: BTreeMap<String, String>,
    pub epilogue_global: Option<String>,
    pub epilogue_per_tag: BTreeMap<String, String>,
}

impl ScriptHooks {
    /// Ordered as §4.2 mandates: prologue-global, prologue-per-tag,
    /// prologue-inline, user command, epilogue-global, epilogue-per-tag,
    /// epilogue-inline.
    fn ordered_prologue(&self, tags: &[String], inline: Option<&str>) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(g) = &self.prologue_global {
            out.push(g.clone());
        }
        for tag in tags {
            if let Some(p) = self.prologue_per_tag.get(tag) {
                out.push(p.clone());
            }
        }
        if let Some(i) = inline {
            out.push(i.to_string());
        }
        out
    }

    fn ordered_epilogue(&self, tags: &[String], inline: Option<&str>) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(g) = &self.epilogue_global {
            out.push(g.clone());
        }
        for tag in tags {
            if let Some(e) = self.epilogue_per_tag.get(tag) {
                out.push(e.clone());
            }
        }
        if let Some(i) = inline {
            out.push(i.to_string());
        }
        out
    }
}

/// Per-flavour behaviour (§4.2). Implementations are stateless; all mutable
/// bookkeeping (grace windows, wrap-prefix overrides) lives in `BatchAdapter`.
pub trait BatchFlavour: std::fmt::Debug + Send + Sync {
    /// Emit a complete POSIX shell script for this flavour's batch language,
    /// with hook snippets inserted in §4.2's mandated order.
    fn render_script(&self, task: &Task, remote_dir: &str, hooks: &ScriptHooks) -> RenderedSubmission;

    /// Shell command (with arguments) to cancel a submitted job.
    fn cancel_command(&self, job_id: &str) -> String;

    /// Shell command that queries the live queue for a single job.
    fn live_queue_command(&self, job_id: &str) -> String;

    /// Shell command that queries the accounting log for a single job.
    fn accounting_command(&self, job_id: &str) -> String;

    /// Extract the back-end job id from the submit command's stdout.
    fn parse_job_id(&self, submit_stdout: &str) -> Option<String>;

    /// Parse live-queue output into a common state, or `None` if the job is
    /// unknown to the live queue (§4.2 step 2).
    fn parse_live_queue(&self, output: &str) -> Option<CommonState>;

    /// Parse accounting output into a common state plus exit info, or
    /// `None` if accounting has no rows yet for this job.
    fn parse_accounting(&self, output: &str) -> Option<CommonState>;
}

fn render_generic(
    task: &Task,
    hooks: &ScriptHooks,
    shebang: &str,
    directives: &[String],
) -> String {
    let mut script = String::new();
    script.push_str(shebang);
    script.push('\n');
    for d in directives {
        script.push_str(d);
        script.push('\n');
    }
    for line in hooks.ordered_prologue(&task.spec.requirements.tags, None) {
        script.push_str(&line);
        script.push('\n');
    }
    for (k, v) in &task.spec.environment {
        script.push_str(&format!("export {k}={v}\n"));
    }
    script.push_str(&format!("{} {}\n", task.spec.command, task.spec.arguments.join(" ")));
    for line in hooks.ordered_epilogue(&task.spec.requirements.tags, None) {
        script.push_str(&line);
        script.push('\n');
    }
    script
}

#[derive(Debug, Default)]
pub struct GridEngine;

impl BatchFlavour for GridEngine {
    fn render_script(&self, task: &Task, remote_dir: &str, hooks: &ScriptHooks) -> RenderedSubmission {
        let directives = vec![
            format!("#$ -wd {remote_dir}"),
            format!("#$ -pe smp {}", task.spec.requirements.cores),
            "#$ -j y".to_string(),
        ];
        let script = render_generic(task, hooks, "#!/bin/sh", &directives);
        RenderedSubmission {
            script,
            submit_command: "qsub".to_string(),
        }
    }

    fn cancel_command(&self, job_id: &str) -> String {
        format!("qdel {job_id}")
    }

    fn live_queue_command(&self, job_id: &str) -> String {
        format!("qstat -j {job_id}")
    }

    fn accounting_command(&self, job_id: &str) -> String {
        format!("qacct -j {job_id}")
    }

    fn parse_job_id(&self, submit_stdout: &str) -> Option<String> {
        // "Your job 12345 (\"name\") has been submitted"
        submit_stdout.split_whitespace().nth(2).map(str::to_string)
    }

    fn parse_live_queue(&self, output: &str) -> Option<CommonState> {
        if output.contains("Following jobs do not exist") || output.trim().is_empty() {
            return None;
        }
        if output.contains("job_state") && output.contains('r') {
            Some(CommonState::Running)
        } else {
            Some(CommonState::Submitted)
        }
    }

    fn parse_accounting(&self, output: &str) -> Option<CommonState> {
        if output.contains("error: failed to get the account") {
            return None;
        }
        let exit = output
            .lines()
            .find(|l| l.trim_start().starts_with("exit_status"))
            .and_then(|l| l.split_whitespace().nth(1))
            .and_then(|s| s.parse::<i32>().ok())
            .unwrap_or(0);
        Some(CommonState::Terminated { exit_status: exit })
    }
}

#[derive(Debug, Default)]
pub struct Pbs;

impl BatchFlavour for Pbs {
    fn render_script(&self, task: &Task, remote_dir: &str, hooks: &ScriptHooks) -> RenderedSubmission {
        let directives = vec![
            format!("#PBS -d {remote_dir}"),
            format!("#PBS -l nodes=1:ppn={}", task.spec.requirements.cores),
            "#PBS -j oe".to_string(),
        ];
        let script = render_generic(task, hooks, "#!/bin/sh", &directives);
        RenderedSubmission {
            script,
            submit_command: "qsub".to_string(),
        }
    }

    fn cancel_command(&self, job_id: &str) -> String {
        format!("qdel {job_id}")
    }

    fn live_queue_command(&self, job_id: &str) -> String {
        format!("qstat {job_id}")
    }

    fn accounting_command(&self, job_id: &str) -> String {
        format!("tracejob {job_id}")
    }

    fn parse_job_id(&self, submit_stdout: &str) -> Option<String> {
        submit_stdout.lines().next().map(|l| l.trim().to_string())
    }

    fn parse_live_queue(&self, output: &str) -> Option<CommonState> {
        if output.contains("Unknown Job Id") {
            return None;
        }
        if output.contains(" R ") {
            Some(CommonState::Running)
        } else if output.contains(" Q ") {
            Some(CommonState::Submitted)
        } else {
            Some(CommonState::Submitted)
        }
    }

    fn parse_accounting(&self, output: &str) -> Option<CommonState> {
        if output.trim().is_empty() {
            return None;
        }
        let exit = output
            .lines()
            .find_map(|l| l.split("Exit_status=").nth(1))
            .and_then(|s| s.split_whitespace().next())
            .and_then(|s| s.parse::<i32>().ok())
            .unwrap_or(0);
        Some(CommonState::Terminated { exit_status: exit })
    }
}

/// LSF formats long lines with ambiguous wrapping; `wrap_prefix_len` is
/// auto-detected from the header line unless overridden (§4.2 tie-break).
#[derive(Debug)]
pub struct Lsf {
    pub wrap_prefix_override: Option<usize>,
}

impl Default for Lsf {
    fn default() -> Self {
        Lsf { wrap_prefix_override: None }
    }
}

impl Lsf {
    fn unwrap_lines(&self, output: &str) -> String {
        let Some(header) = output.lines().next() else {
            return output.to_string();
        };
        let prefix_len = self.wrap_prefix_override.unwrap_or_else(|| {
            header.find("STAT").unwrap_or(0)
        });
        let mut joined = String::new();
        for line in output.lines() {
            if line.starts_with(' ') && line.len() > prefix_len {
                joined.push_str(line[prefix_len..].trim_start());
            } else {
                if !joined.is_empty() {
                    joined.push('\n');
                }
                joined.push_str(line);
            }
        }
        joined
    }
}

impl BatchFlavour for Lsf {
    fn render_script(&self, task: &Task, remote_dir: &str, hooks: &ScriptHooks) -> RenderedSubmission {
        let directives = vec![
            format!("#BSUB -cwd {remote_dir}"),
            format!("#BSUB -n {}", task.spec.requirements.cores),
            "#BSUB -oo lsf.out".to_string(),
        ];
        let script = render_generic(task, hooks, "#!/bin/sh", &directives);
        RenderedSubmission {
            script,
            submit_command: "bsub".to_string(),
        }
    }

    fn cancel_command(&self, job_id: &str) -> String {
        format!("bkill {job_id}")
    }

    fn live_queue_command(&self, job_id: &str) -> String {
        format!("bjobs -w {job_id}")
    }

    fn accounting_command(&self, job_id: &str) -> String {
        format!("bacct -l {job_id}")
    }

    fn parse_job_id(&self, submit_stdout: &str) -> Option<String> {
        // "Job <12345> is submitted to queue <normal>."
        let start = submit_stdout.find('<')? + 1;
        let end = submit_stdout[start..].find('>')? + start;
        Some(submit_stdout[start..end].to_string())
    }

    fn parse_live_queue(&self, output: &str) -> Option<CommonState> {
        let unwrapped = self.unwrap_lines(output);
        if unwrapped.contains("is not found") {
            return None;
        }
        if unwrapped.contains(" RUN ") {
            Some(CommonState::Running)
        } else if unwrapped.contains(" DONE ") || unwrapped.contains(" EXIT ") {
            Some(CommonState::Terminating)
        } else {
            Some(CommonState::Submitted)
        }
    }

    fn parse_accounting(&self, output: &str) -> Option<CommonState> {
        if output.contains("No matching job found") {
            return None;
        }
        let exit = if output.contains("Exited with exit code") {
            output
                .split("Exited with exit code")
                .nth(1)
                .and_then(|s| s.split('.').next())
                .and_then(|s| s.trim().parse::<i32>().ok())
                .unwrap_or(1)
        } else {
            0
        };
        Some(CommonState::Terminated { exit_status: exit })
    }
}

#[derive(Debug, Default)]
pub struct Slurm;

impl BatchFlavour for Slurm {
    fn render_script(&self, task: &Task, remote_dir: &str, hooks: &ScriptHooks) -> RenderedSubmission {
        let directives = vec![
            format!("#SBATCH --chdir={remote_dir}"),
            format!("#SBATCH --ntasks=1 --cpus-per-task={}", task.spec.requirements.cores),
            "#SBATCH --output=slurm.out".to_string(),
        ];
        let script = render_generic(task, hooks, "#!/bin/sh", &directives);
        RenderedSubmission {
            script,
            submit_command: "sbatch".to_string(),
        }
    }

    fn cancel_command(&self, job_id: &str) -> String {
        format!("scancel {job_id}")
    }

    fn live_queue_command(&self, job_id: &str) -> String {
        format!("squeue -h -j {job_id} -o %T")
    }

    fn accounting_command(&self, job_id: &str) -> String {
        format!("sacct -n -j {job_id} -o State,ExitCode")
    }

    fn parse_job_id(&self, submit_stdout: &str) -> Option<String> {
        // "Submitted batch job 12345"
        submit_stdout.split_whitespace().last().map(str::to_string)
    }

    fn parse_live_queue(&self, output: &str) -> Option<CommonState> {
        let trimmed = output.trim();
        if trimmed.is_empty() {
            return None;
        }
        match trimmed {
            "RUNNING" => Some(CommonState::Running),
            "PENDING" => Some(CommonState::Submitted),
            "COMPLETED" | "COMPLETING" => Some(CommonState::Terminating),
            "SUSPENDED" => Some(CommonState::Stopped),
            _ => Some(CommonState::Submitted),
        }
    }

    fn parse_accounting(&self, output: &str) -> Option<CommonState> {
        let line = output.lines().next()?.trim();
        if line.is_empty() {
            return None;
        }
        let mut parts = line.split_whitespace();
        let state = parts.next()?;
        let exit_code = parts.next().unwrap_or("0:0");
        let exit: i32 = exit_code.split(':').next().and_then(|s| s.parse().ok()).unwrap_or(0);
        if state.starts_with("RUNNING") || state.starts_with("PENDING") {
            return None;
        }
        Some(CommonState::Terminated { exit_status: exit })
    }
}
