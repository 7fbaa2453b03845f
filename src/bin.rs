use anyhow::Context;
use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use structopt::StructOpt;

use unskid::container::output_path;
use unskid::job::{run_job, CompletionFlag, JobOptions, JobState};
use unskid::Deobfuscator;

#[derive(Debug, Clone, StructOpt)]
struct Opt {
    /// Input file. This may be either a `.jar`/`.zip` container holding
    /// compiled classes, or a single `.class` file.
    #[structopt(parse(from_os_str))]
    input: PathBuf,

    /// Output directory. Defaults to the input's directory; the output is
    /// always named with a `-deobf` suffix.
    #[structopt(short = "o", long = "output-dir", parse(from_os_str))]
    output_dir: Option<PathBuf>,

    /// Number of worker threads
    #[structopt(short = "j", long = "threads")]
    threads: Option<usize>,

    /// Upper bound on fixed-point iterations per method
    #[structopt(long = "max-iterations", default_value = "1000")]
    max_iterations: usize,

    /// Enable verbose logging
    #[structopt(short = "v")]
    verbose: bool,

    /// Enable verbose debug logging
    #[structopt(short = "m", long = "more-verbose")]
    more_verbose: bool,

    /// Disable all logging
    #[structopt(short = "q")]
    quiet: bool,

    /// Enable outputting code graphs to dot format
    #[structopt(short = "g")]
    graphs: bool,

    /// An optional directory for graphs to be written to
    #[structopt(long = "graphs-dir", default_value = ".", parse(from_os_str))]
    graphs_dir: PathBuf,

    /// Dry run only -- do not write any files
    #[structopt(long = "dry")]
    dry: bool,

    /// Write every decrypted string to this CSV file
    #[structopt(long = "strings", parse(from_os_str))]
    strings: Option<PathBuf>,

    #[structopt(subcommand)]
    cmd: Option<Command>,
}

#[derive(Debug, Clone, StructOpt)]
enum Command {
    /// Only dump decrypted strings to `strings.csv`. Do not write the
    /// deobfuscated container.
    StringsOnly,
}

fn main() -> Result<()> {
    let opt = Opt::from_args();

    if opt.quiet {
        // do not initialize the logger
    } else if opt.more_verbose {
        simple_logger::SimpleLogger::new()
            .with_level(log::LevelFilter::Trace)
            .with_module_level("unskid::bytecode", log::LevelFilter::Debug)
            .init()
            .context("initializing logger")?;
    } else if opt.verbose {
        simple_logger::SimpleLogger::new()
            .with_level(log::LevelFilter::Debug)
            .init()
            .context("initializing logger")?;
    } else {
        simple_logger::SimpleLogger::new()
            .with_level(log::LevelFilter::Error)
            .init()
            .context("initializing logger")?;
    }

    rayon::ThreadPoolBuilder::new()
        .num_threads(opt.threads.unwrap_or_else(num_cpus::get))
        .build_global()
        .context("configuring the worker pool")?;

    let strings_only = matches!(opt.cmd, Some(Command::StringsOnly));
    if opt.graphs && !opt.dry {
        std::fs::create_dir_all(&opt.graphs_dir)
            .with_context(|| format!("creating graph directory {:?}", opt.graphs_dir))?;
    }
    if let Some(dir) = opt.output_dir.as_ref().filter(|_| !opt.dry) {
        std::fs::create_dir_all(dir).with_context(|| format!("creating output directory {:?}", dir))?;
    }

    let options = JobOptions {
        input: opt.input.clone(),
        output: if strings_only {
            None
        } else {
            Some(output_path(&opt.input, opt.output_dir.as_deref()))
        },
        strings_csv: if strings_only {
            Some(opt.strings.clone().unwrap_or_else(|| PathBuf::from("strings.csv")))
        } else {
            opt.strings.clone()
        },
        graphs_dir: if opt.graphs { Some(opt.graphs_dir.clone()) } else { None },
        dry: opt.dry,
    };

    let deobfuscator = Deobfuscator::new().iteration_cap(opt.max_iterations);
    let deobfuscator = if opt.graphs {
        deobfuscator.enable_graphs()
    } else {
        deobfuscator
    };

    let flag = Arc::new(CompletionFlag::new());
    let worker = {
        let flag = Arc::clone(&flag);
        std::thread::spawn(move || run_job(&deobfuscator, &options, &flag))
    };

    let state = flag.wait();
    let summary = worker
        .join()
        .map_err(|_| anyhow::anyhow!("job thread panicked"))?
        .with_context(|| format!("deobfuscating {:?}", opt.input))?;

    if state == JobState::Completed {
        println!(
            "Deobfuscated {} of {} classes ({} decrypted strings)",
            summary.deobfuscated, summary.units, summary.strings
        );
    }

    Ok(())
}
