//! Whole-job orchestration: load a container, deobfuscate every unit on the
//! rayon pool and stream the results to the output as they finish.

use std::fs::File;
use std::io::Write;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Condvar, Mutex};

use crossbeam::channel;
use log::{error, info, warn};
use rayon::prelude::*;

use crate::container::{Container, ContainerWriter, Entry};
use crate::error::Error;
use crate::strings::DecryptedString;
use crate::unit::CompiledUnit;
use crate::Deobfuscator;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Failed,
    Completed,
}

/// Tri-state completion signal other threads can block on.
#[derive(Debug)]
pub struct CompletionFlag {
    state: Mutex<JobState>,
    changed: Condvar,
}

impl Default for CompletionFlag {
    fn default() -> Self {
        CompletionFlag::new()
    }
}

impl CompletionFlag {
    pub fn new() -> CompletionFlag {
        CompletionFlag {
            state: Mutex::new(JobState::Pending),
            changed: Condvar::new(),
        }
    }

    pub fn state(&self) -> JobState {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set(&self, state: JobState) {
        let mut current = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *current = state;
        self.changed.notify_all();
    }

    /// Blocks until the state leaves `Pending`.
    pub fn wait(&self) -> JobState {
        let mut current = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        while *current == JobState::Pending {
            current = self
                .changed
                .wait(current)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        *current
    }
}

/// Where a job's output goes.
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    pub input: PathBuf,
    /// Output container. `None` writes no container.
    pub output: Option<PathBuf>,
    /// Decrypted strings CSV
    pub strings_csv: Option<PathBuf>,
    /// Directory for dot graphs; only used when graphs are enabled
    pub graphs_dir: Option<PathBuf>,
    /// Process everything but write nothing
    pub dry: bool,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct JobSummary {
    pub units: usize,
    pub deobfuscated: usize,
    /// Units passed through unmodified after an error or panic
    pub isolated: usize,
    pub strings: usize,
    pub resources: usize,
}

/// What a worker hands the writer for one unit.
struct Finished {
    entry: Entry,
    modified: bool,
    isolated: bool,
    decrypted: Vec<DecryptedString>,
    graphs: Vec<(String, String)>,
}

fn process(deobfuscator: &Deobfuscator, entry: Entry, unit: CompiledUnit) -> Finished {
    let outcome = catch_unwind(AssertUnwindSafe(|| deobfuscator.deobfuscate_parsed(unit, &entry.data)));
    match outcome {
        Ok(Ok(result)) => Finished {
            entry: Entry {
                name: entry.name,
                data: result.data,
                is_dir: false,
            },
            modified: result.modified,
            isolated: false,
            decrypted: result.decrypted,
            graphs: result.graphviz_graphs.into_iter().collect(),
        },
        Ok(Err(e)) => {
            warn!("{} | deobfuscation failed, keeping the original: {}", entry.name, e);
            Finished::passthrough(entry)
        }
        Err(_) => {
            warn!("{} | a pass panicked, keeping the original", entry.name);
            Finished::passthrough(entry)
        }
    }
}

impl Finished {
    fn passthrough(entry: Entry) -> Finished {
        Finished {
            entry,
            modified: false,
            isolated: true,
            decrypted: vec![],
            graphs: vec![],
        }
    }
}

/// Parses every unit up front. Any failure here fails the whole job before
/// a single byte is written.
fn load(container: Container) -> Result<(Vec<(Entry, CompiledUnit)>, Vec<Entry>), Error> {
    let units = container
        .units
        .into_par_iter()
        .map(|entry| match CompiledUnit::parse(&entry.data) {
            Ok(unit) => Ok((entry, unit)),
            Err(source) => Err(Error::Load {
                name: entry.name.clone(),
                source: Box::new(source),
            }),
        })
        .collect::<Result<Vec<_>, Error>>()?;
    Ok((units, container.resources))
}

struct Outputs {
    container: Option<ContainerWriter>,
    strings: Option<csv::Writer<File>>,
    graphs_dir: Option<PathBuf>,
}

impl Outputs {
    fn open(options: &JobOptions, kind: crate::container::ContainerKind) -> Result<Outputs, Error> {
        if options.dry {
            return Ok(Outputs {
                container: None,
                strings: None,
                graphs_dir: None,
            });
        }
        let container = match &options.output {
            Some(path) => Some(ContainerWriter::create(path, kind)?),
            None => None,
        };
        let strings = match &options.strings_csv {
            Some(path) => Some(csv::Writer::from_path(path).map_err(|e| Error::Write(e.to_string()))?),
            None => None,
        };
        Ok(Outputs {
            container,
            strings,
            graphs_dir: options.graphs_dir.clone(),
        })
    }

    fn write(&mut self, finished: &Finished) -> Result<(), Error> {
        if let Some(container) = self.container.as_mut() {
            container.write_entry(&finished.entry)?;
        }
        if let Some(strings) = self.strings.as_mut() {
            for record in &finished.decrypted {
                strings.serialize(record).map_err(|e| Error::Write(e.to_string()))?;
            }
        }
        if let Some(dir) = &self.graphs_dir {
            for (name, dot) in &finished.graphs {
                let mut file = File::create(dir.join(name))?;
                file.write_all(dot.as_bytes())?;
            }
        }
        Ok(())
    }

    fn finish(self) -> Result<(), Error> {
        if let Some(container) = self.container {
            container.finish()?;
        }
        if let Some(mut strings) = self.strings {
            strings.flush()?;
        }
        Ok(())
    }
}

/// Writes resources, then every finished unit as it arrives.
fn stream(outputs: &mut Outputs, resources: &[Entry], rx: channel::Receiver<Finished>) -> Result<JobSummary, Error> {
    let mut tally = JobSummary::default();
    if let Some(container) = outputs.container.as_mut() {
        for resource in resources {
            container.write_entry(resource)?;
        }
    }
    for finished in rx {
        outputs.write(&finished)?;
        if finished.modified {
            tally.deobfuscated += 1;
        }
        if finished.isolated {
            tally.isolated += 1;
        }
        tally.strings += finished.decrypted.len();
    }
    Ok(tally)
}

/// Runs a whole job and records the outcome on `flag`, which is always
/// released whether the job succeeds or not.
pub fn run_job(deobfuscator: &Deobfuscator, options: &JobOptions, flag: &CompletionFlag) -> Result<JobSummary, Error> {
    let result = run(deobfuscator, options);
    match &result {
        Ok(summary) => {
            info!(
                "deobfuscated {} of {} units ({} passed through after errors), {} strings",
                summary.deobfuscated, summary.units, summary.isolated, summary.strings
            );
            flag.set(JobState::Completed);
        }
        Err(e) => {
            error!("job failed: {}", e);
            flag.set(JobState::Failed);
        }
    }
    result
}

fn run(deobfuscator: &Deobfuscator, options: &JobOptions) -> Result<JobSummary, Error> {
    let container = Container::read(&options.input)?;
    let kind = container.kind;
    let (units, resources) = load(container)?;
    let mut outputs = Outputs::open(options, kind)?;

    let mut summary = JobSummary {
        units: units.len(),
        resources: resources.len(),
        ..JobSummary::default()
    };

    let scope_result = crossbeam::scope(|s| -> Result<JobSummary, Error> {
        let (tx, rx) = channel::unbounded::<Finished>();

        let writer = s.spawn(move |_| -> Result<(Outputs, JobSummary), Error> {
            match stream(&mut outputs, &resources, rx) {
                Ok(tally) => Ok((outputs, tally)),
                Err(e) => {
                    // close the container so the entries already written stay readable
                    if let Err(close) = outputs.finish() {
                        warn!("could not close partial output: {}", close);
                    }
                    Err(e)
                }
            }
        });

        // A send only fails once the writer has given up; its error wins
        units.into_par_iter().for_each_with(tx, |tx, (entry, unit)| {
            let finished = process(deobfuscator, entry, unit);
            let _ = tx.send(finished);
        });

        let (outputs, tally) = writer
            .join()
            .map_err(|_| Error::Write("writer thread panicked".to_string()))??;
        outputs.finish()?;
        Ok(tally)
    });

    let tally = scope_result.map_err(|_| Error::Write("output thread panicked".to_string()))??;
    summary.deobfuscated = tally.deobfuscated;
    summary.isolated = tally.isolated;
    summary.strings = tally.strings;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::MethodBody;
    use crate::container::tests::scratch_dir;
    use crate::container::{ContainerKind, OUTPUT_COMMENT};
    use crate::insn::{ConstValue, Insn, ValueKind};
    use crate::unit::tests::class_with_method;
    use std::sync::Arc;

    fn jump_chain_class(name: &str) -> Vec<u8> {
        let mut body = MethodBody::new(1, 0);
        let a = body.insns.new_label();
        let b = body.insns.new_label();
        body.insns.push(Insn::Jump(a));
        body.insns.push(Insn::Label(a));
        body.insns.push(Insn::Jump(b));
        body.insns.push(Insn::Label(b));
        body.insns.push(Insn::Const(ConstValue::Int(1)));
        body.insns.push(Insn::Return(Some(ValueKind::Int)));
        class_with_method(name, "one", "()I", body)
    }

    fn write_jar(path: &std::path::Path, entries: &[Entry]) {
        let mut writer = ContainerWriter::create(path, ContainerKind::Archive).unwrap();
        for entry in entries {
            writer.write_entry(entry).unwrap();
        }
        writer.finish().unwrap();
    }

    fn entry(name: &str, data: Vec<u8>) -> Entry {
        Entry {
            name: name.to_string(),
            data,
            is_dir: false,
        }
    }

    #[test]
    fn flag_releases_waiters() {
        let flag = Arc::new(CompletionFlag::new());
        assert_eq!(flag.state(), JobState::Pending);
        let waiter = {
            let flag = Arc::clone(&flag);
            std::thread::spawn(move || flag.wait())
        };
        flag.set(JobState::Completed);
        assert_eq!(waiter.join().unwrap(), JobState::Completed);
    }

    #[test]
    fn jar_is_processed_and_resources_pass_through() {
        crate::test_support::init_logging();
        let dir = scratch_dir("job");
        let input = dir.join("app.jar");
        write_jar(
            &input,
            &[
                entry("a/Chain.class", jump_chain_class("a/Chain")),
                entry("plugin.yml", b"main: a.Chain\n".to_vec()),
            ],
        );

        let output = dir.join("app-deobf.jar");
        let options = JobOptions {
            input,
            output: Some(output.clone()),
            strings_csv: Some(dir.join("strings.csv")),
            ..JobOptions::default()
        };
        let flag = CompletionFlag::new();
        let summary = run_job(&Deobfuscator::new(), &options, &flag).unwrap();
        assert_eq!(flag.state(), JobState::Completed);
        assert_eq!(summary.units, 1);
        assert_eq!(summary.deobfuscated, 1);
        assert_eq!(summary.resources, 1);

        let written = Container::read(&output).unwrap();
        assert_eq!(written.units.len(), 1);
        assert_eq!(written.resources[0].data, b"main: a.Chain\n".to_vec());
        assert!(CompiledUnit::parse(&written.units[0].data).is_ok());

        let raw = std::fs::read(&output).unwrap();
        let zip = zip::ZipArchive::new(std::io::Cursor::new(raw)).unwrap();
        assert_eq!(zip.comment(), OUTPUT_COMMENT.as_bytes());
    }

    #[test]
    fn undecodable_unit_fails_the_job_without_output() {
        let dir = scratch_dir("job-fail");
        let input = dir.join("bad.jar");
        let mut truncated = jump_chain_class("a/Cut");
        truncated.truncate(20);
        write_jar(&input, &[entry("a/Cut.class", truncated)]);

        let output = dir.join("bad-deobf.jar");
        let options = JobOptions {
            input,
            output: Some(output.clone()),
            ..JobOptions::default()
        };
        let flag = CompletionFlag::new();
        let err = run_job(&Deobfuscator::new(), &options, &flag).unwrap_err();
        assert!(matches!(err, Error::Load { .. }));
        assert_eq!(flag.wait(), JobState::Failed);
        assert!(!output.exists());
    }

    #[test]
    fn dry_run_writes_nothing() {
        let dir = scratch_dir("job-dry");
        let input = dir.join("Main.class");
        std::fs::write(&input, jump_chain_class("Main")).unwrap();

        let output = dir.join("Main-deobf.class");
        let options = JobOptions {
            input,
            output: Some(output.clone()),
            dry: true,
            ..JobOptions::default()
        };
        let summary = run_job(&Deobfuscator::new(), &options, &CompletionFlag::new()).unwrap();
        assert_eq!(summary.units, 1);
        assert!(!output.exists());
    }

    #[test]
    fn failed_write_leaves_a_readable_container() {
        let dir = scratch_dir("job-partial");
        let input = dir.join("app.jar");
        write_jar(
            &input,
            &[
                entry("plugin.yml", b"main: a.Chain\n".to_vec()),
                entry("a/Chain.class", jump_chain_class("a/Chain")),
            ],
        );

        // graphs go to a directory that doesn't exist, so the first unit's
        // graph write fails right after its entry is written
        let output = dir.join("app-deobf.jar");
        let options = JobOptions {
            input,
            output: Some(output.clone()),
            graphs_dir: Some(dir.join("missing").join("graphs")),
            ..JobOptions::default()
        };
        let flag = CompletionFlag::new();
        let deobfuscator = Deobfuscator::new().enable_graphs();
        assert!(run_job(&deobfuscator, &options, &flag).is_err());
        assert_eq!(flag.state(), JobState::Failed);

        let written = Container::read(&output).unwrap();
        assert_eq!(written.resources.len(), 1);
        assert_eq!(written.units.len(), 1);
        assert_eq!(written.units[0].name, "a/Chain.class");
    }

    struct Exploding;

    impl crate::pass::UnitPass for Exploding {
        fn name(&self) -> &'static str {
            "exploding"
        }

        fn run(&self, unit: &mut CompiledUnit, _ctx: &mut crate::pass::PassContext) -> usize {
            panic!("{} is cursed", unit.name)
        }
    }

    #[test]
    fn panicking_pass_passes_the_unit_through() {
        let original = jump_chain_class("Main");
        let engine = crate::pass::PassEngine::new(
            crate::pass::Pipeline::new("boom").unit_pass(Box::new(Exploding), crate::pass::Repeat::Once),
            crate::pass::DEFAULT_ITERATION_CAP,
        );
        let deobfuscator = Deobfuscator::with_engine(engine);

        let unit = CompiledUnit::parse(&original).unwrap();
        let finished = process(&deobfuscator, entry("Main.class", original.clone()), unit);
        assert!(finished.isolated);
        assert!(!finished.modified);
        assert_eq!(finished.entry.data, original);

        let unit = CompiledUnit::parse(&original).unwrap();
        let finished = process(&Deobfuscator::new(), entry("Main.class", original.clone()), unit);
        assert!(!finished.isolated);
        assert!(finished.modified);
    }
}
