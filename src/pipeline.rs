//! Ordered, resumable step scheduling over a shared context.
//!
//! A [`Schedule`] runs its steps strictly in order. Resuming from a named step runs every
//! earlier step in skip mode: skipped steps must still fill the context fields later steps read,
//! but should not redo their expensive work.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::{debug, error, info};

use crate::error::{NmtError, Result};
use crate::metrics::StepTiming;

/// Context shared by the steps of a [`Schedule`].
pub trait StepContext {
    /// Called by the scheduler after every step.
    fn bump_revision(&mut self);
}

/// Per-invocation options handed to a step.
#[derive(Debug, Clone, Copy, Default)]
pub struct StepOptions<'a> {
    /// Populate the context without doing the work.
    pub skip: bool,
    /// Remove intermediate outputs once the step is done.
    pub delete_on_exit: bool,
    /// Log file for steps running external tools.
    pub log: Option<&'a Path>,
}

type StepFn<'s, C> = Box<dyn FnMut(&mut C, &StepOptions<'_>) -> Result<()> + 's>;

/// Named unit of work.
pub struct Step<'s, C> {
    name: String,
    run: StepFn<'s, C>,
}

impl<'s, C> Step<'s, C> {
    /// Wraps `run` under `name`.
    pub fn new<F>(name: impl Into<String>, run: F) -> Self
    where
        F: FnMut(&mut C, &StepOptions<'_>) -> Result<()> + 's,
    {
        Self {
            name: name.into(),
            run: Box::new(run),
        }
    }

    /// Step name, also used to resume.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<C> std::fmt::Debug for Step<'_, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step").field("name", &self.name).finish()
    }
}

/// Options for one [`Schedule::run`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions<'a> {
    /// Name of the first step that really runs; earlier steps are skipped.
    pub resume_from: Option<&'a str>,
    /// Forwarded to every step.
    pub delete_on_exit: bool,
    /// Forwarded to every step.
    pub log_file: Option<&'a Path>,
}

/// Timings collected by [`Schedule::run`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunReport {
    /// One entry per step, in order.
    pub steps: Vec<StepTiming>,
    /// Wall-clock duration of the whole run.
    pub total: Duration,
}

/// Ordered list of steps.
#[derive(Debug)]
pub struct Schedule<'s, C> {
    steps: Vec<Step<'s, C>>,
}

impl<C> Default for Schedule<'_, C> {
    fn default() -> Self {
        Self { steps: Vec::new() }
    }
}

impl<'s, C: StepContext> Schedule<'s, C> {
    /// Empty schedule.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a step.
    #[must_use]
    pub fn then<F>(mut self, name: impl Into<String>, run: F) -> Self
    where
        F: FnMut(&mut C, &StepOptions<'_>) -> Result<()> + 's,
    {
        self.steps.push(Step::new(name, run));
        self
    }

    /// Appends every step of `other`.
    #[must_use]
    pub fn chain(mut self, other: Schedule<'s, C>) -> Self {
        self.steps.extend(other.steps);
        self
    }

    /// Step names in execution order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.steps.iter().map(Step::name).collect()
    }

    /// Number of steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// True when the schedule holds no step.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    fn resume_index(&self, resume_from: Option<&str>) -> Result<usize> {
        let Some(name) = resume_from else {
            return Ok(0);
        };
        self.steps
            .iter()
            .position(|step| step.name == name)
            .ok_or_else(|| {
                NmtError::InvalidConfig(format!(
                    "unknown step {name:?}; available steps: {}",
                    self.names().join(", ")
                ))
            })
    }

    /// Runs every step in order. The first failing step aborts the run with its error.
    pub fn run(&mut self, ctx: &mut C, opts: &RunOptions<'_>) -> Result<RunReport> {
        let resume_index = self.resume_index(opts.resume_from)?;
        let started = Instant::now();
        let mut report = RunReport::default();

        for (idx, step) in self.steps.iter_mut().enumerate() {
            let options = StepOptions {
                skip: idx < resume_index,
                delete_on_exit: opts.delete_on_exit,
                log: opts.log_file,
            };
            if options.skip {
                debug!("{} runs in skip mode", step.name);
            }
            let start = Instant::now();
            info!("{}... START", step.name);
            let outcome = (step.run)(ctx, &options);
            let elapsed = start.elapsed();
            info!("{} END {:.2}s", step.name, elapsed.as_secs_f64());
            if let Err(err) = outcome {
                error!("{} failed: {err}", step.name);
                return Err(err);
            }
            ctx.bump_revision();
            report.steps.push(StepTiming {
                name: step.name.clone(),
                skipped: options.skip,
                elapsed,
            });
        }

        report.total = started.elapsed();
        Ok(report)
    }
}

/// Temporary directory tree owned by one build.
#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
    keep_temp: bool,
}

impl Workspace {
    /// Creates `root` if needed.
    pub fn new(root: impl Into<PathBuf>, keep_temp: bool) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|err| NmtError::io_at(err, &root))?;
        Ok(Self { root, keep_temp })
    }

    /// Workspace root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates and returns `<root>/<name>`.
    pub fn temp_dir(&self, name: &str) -> Result<PathBuf> {
        let dir = self.root.join(name);
        fs::create_dir_all(&dir).map_err(|err| NmtError::io_at(err, &dir))?;
        Ok(dir)
    }

    /// Deletes the workspace unless it was created with `keep_temp`.
    pub fn close(self) -> Result<()> {
        if self.keep_temp {
            info!("keeping workspace {}", self.root.display());
            return Ok(());
        }
        match fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(NmtError::io_at(err, &self.root)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct Trace {
        calls: Vec<(String, bool)>,
        revision: usize,
    }

    impl StepContext for Trace {
        fn bump_revision(&mut self) {
            self.revision += 1;
        }
    }

    fn record(name: &'static str) -> impl FnMut(&mut Trace, &StepOptions<'_>) -> Result<()> {
        move |ctx, opts| {
            ctx.calls.push((name.to_string(), opts.skip));
            Ok(())
        }
    }

    fn schedule() -> Schedule<'static, Trace> {
        let base = Schedule::new()
            .then("collect", record("collect"))
            .then("filter", record("filter"));
        base.chain(
            Schedule::new()
                .then("prepare", record("prepare"))
                .then("train", record("train")),
        )
    }

    #[test]
    fn steps_before_resume_point_are_skipped() {
        let mut trace = Trace::default();
        let report = schedule()
            .run(
                &mut trace,
                &RunOptions {
                    resume_from: Some("prepare"),
                    ..RunOptions::default()
                },
            )
            .expect("run");
        assert_eq!(
            trace.calls,
            vec![
                ("collect".to_string(), true),
                ("filter".to_string(), true),
                ("prepare".to_string(), false),
                ("train".to_string(), false),
            ]
        );
        assert_eq!(trace.revision, 4);
        assert_eq!(report.steps.iter().filter(|s| s.skipped).count(), 2);
    }

    #[test]
    fn unknown_resume_step_is_rejected_before_running() {
        let mut trace = Trace::default();
        let err = schedule()
            .run(
                &mut trace,
                &RunOptions {
                    resume_from: Some("tune"),
                    ..RunOptions::default()
                },
            )
            .expect_err("unknown step");
        assert!(matches!(err, NmtError::InvalidConfig(message) if message.contains("tune")));
        assert!(trace.calls.is_empty());
    }

    #[test]
    fn failing_step_aborts_the_run() {
        let mut trace = Trace::default();
        let mut schedule = Schedule::new()
            .then("first", record("first"))
            .then("broken", |_: &mut Trace, _: &StepOptions<'_>| {
                Err(NmtError::ExternalTool("boom".into()))
            })
            .then("never", record("never"));
        assert!(schedule.run(&mut trace, &RunOptions::default()).is_err());
        assert_eq!(trace.calls, vec![("first".to_string(), false)]);
        assert_eq!(trace.revision, 1);
    }

    struct Capture;

    static CAPTURED: Mutex<Vec<String>> = Mutex::new(Vec::new());
    static CAPTURE: Capture = Capture;

    impl log::Log for Capture {
        fn enabled(&self, _metadata: &log::Metadata<'_>) -> bool {
            true
        }

        fn log(&self, record: &log::Record<'_>) {
            if let Ok(mut lines) = CAPTURED.lock() {
                lines.push(record.args().to_string());
            }
        }

        fn flush(&self) {}
    }

    #[test]
    fn failing_step_still_logs_its_end() {
        let _ = log::set_logger(&CAPTURE);
        log::set_max_level(log::LevelFilter::Info);

        let mut trace = Trace::default();
        let mut schedule = Schedule::new().then(
            "exploding step",
            |_: &mut Trace, _: &StepOptions<'_>| Err(NmtError::ExternalTool("boom".into())),
        );
        assert!(schedule.run(&mut trace, &RunOptions::default()).is_err());

        let lines: Vec<String> = CAPTURED
            .lock()
            .expect("captured lines")
            .iter()
            .filter(|line| line.starts_with("exploding step"))
            .cloned()
            .collect();
        assert_eq!(lines.len(), 3, "{lines:?}");
        assert_eq!(lines[0], "exploding step... START");
        assert!(lines[1].starts_with("exploding step END "));
        assert!(lines[2].contains("boom"));
    }

    #[test]
    fn workspace_close_respects_keep_temp() {
        let dir = tempdir().expect("tempdir");
        let root = dir.path().join("tmp");
        let workspace = Workspace::new(&root, false).expect("workspace");
        let nested = workspace.temp_dir("onmt_training").expect("temp dir");
        assert!(nested.is_dir());
        workspace.close().expect("close");
        assert!(!root.exists());

        let kept = Workspace::new(&root, true).expect("workspace");
        kept.close().expect("close");
        assert!(root.is_dir());
    }
}
