use std::{path::PathBuf, process::exit, time::Duration};

use structopt::StructOpt;
use wptnn_bridge::Bridge;
use wptnn_harness::{
    options::{BackendCommand, RunOptions},
    orchestrator::{self, select_files},
    report::RunReport,
    source::{DirectorySource, FixtureSource},
};

#[derive(Debug, StructOpt)]
#[structopt(name = "wptnn", about = "Runs WebNN conformance fixtures against a backend")]
pub struct Opt {
    #[structopt(long = "fixtures", parse(from_os_str), help = "Directory of fixture scripts")]
    pub fixtures: PathBuf,

    #[structopt(long = "backend", parse(from_os_str), help = "Backend worker executable")]
    pub backend: PathBuf,

    #[structopt(
        long = "backend-arg",
        number_of_values = 1,
        help = "Argument passed to the backend worker (repeatable)"
    )]
    pub backend_args: Vec<String>,

    #[structopt(long = "op", help = "Only run test cases using this operator")]
    pub op: Option<String>,

    #[structopt(long = "file", help = "Only run fixture files whose name contains this")]
    pub file: Option<String>,

    #[structopt(long = "max-tests", help = "Maximum number of test cases per file")]
    pub max_tests: Option<usize>,

    #[structopt(long = "max-files", help = "Maximum number of fixture files")]
    pub max_files: Option<usize>,

    #[structopt(
        long = "variants",
        use_delimiter = true,
        default_value = "cpu",
        help = "Device variants to run, comma separated"
    )]
    pub variants: Vec<String>,

    #[structopt(long = "skip-unimplemented", help = "Skip operators the backend lacks")]
    pub skip_unimplemented: bool,

    #[structopt(long = "stop-on-fail", help = "Stop at the first failing test case")]
    pub stop_on_fail: bool,

    #[structopt(long = "json-report", parse(from_os_str))]
    pub json_report: Option<PathBuf>,

    #[structopt(long = "text-report", parse(from_os_str))]
    pub text_report: Option<PathBuf>,

    #[structopt(long = "exit-zero", help = "Exit with 0 even if test cases fail")]
    pub exit_zero: bool,

    #[structopt(long = "extraction-timeout-ms", default_value = "5000")]
    pub extraction_timeout_ms: u64,
}

fn main() {
    env_logger::init();
    color_backtrace::install();

    let opt = Opt::from_args();
    exit(run(opt));
}

fn run(opt: Opt) -> i32 {
    if !opt.fixtures.is_dir() {
        log::error!("fixture directory {:?} does not exist", opt.fixtures);
        return 2;
    }

    let command = BackendCommand::new(&opt.backend).with_args(opt.backend_args.iter().cloned());
    let mut options = RunOptions::new(&opt.fixtures)
        .with_backend(command.clone())
        .with_variants(opt.variants.iter().map(|v| v.trim()).filter(|v| !v.is_empty()))
        .with_skip_unimplemented(opt.skip_unimplemented)
        .with_stop_on_fail(opt.stop_on_fail)
        .with_extraction_timeout(Duration::from_millis(opt.extraction_timeout_ms));
    if let Some(op) = &opt.op {
        options = options.with_op_filter(op);
    }
    if let Some(file) = &opt.file {
        options = options.with_file_filter(file);
    }
    if let Some(max) = opt.max_tests {
        options = options.with_max_tests(max);
    }
    if let Some(max) = opt.max_files {
        options = options.with_max_files(max);
    }

    let source = DirectorySource::new(&opt.fixtures);
    match source.list() {
        Ok(files) => {
            if select_files(files, &options).is_empty() {
                log::error!("no fixture file matches the selection");
                return 2;
            }
        }
        Err(err) => {
            log::error!("cannot list {:?}: {err}", opt.fixtures);
            return 2;
        }
    }

    log::info!("spawning backend: {command}");
    let report = match Bridge::spawn(&command) {
        Ok(bridge) => orchestrator::run(&options, &source, &bridge),
        Err(err) => {
            log::error!("{err}");
            let mut report = RunReport::new(&options);
            report.set_fatal_error(err.to_string());
            report.finish();
            report
        }
    };

    write_reports(&opt, &report);

    if report.succeeded() || opt.exit_zero {
        0
    } else {
        1
    }
}

fn write_reports(opt: &Opt, report: &RunReport) {
    let text = report.render_text();
    print!("{text}");
    if let Some(path) = &opt.text_report {
        if let Err(err) = std::fs::write(path, &text) {
            log::error!("cannot write {path:?}: {err}");
        }
    }
    if let Some(path) = &opt.json_report {
        if let Err(err) = report.write_json(path) {
            log::error!("cannot write {path:?}: {err}");
        }
    }
}
