//! Drives fixture files through extraction, execution and verification.
//!
//! Everything runs on the calling thread, one execution request at a time.

use std::{io, time::Instant};

use thiserror::Error;
use wptnn_bridge::{ExecutionError, Executor, GraphExecution};
use wptnn_core::{
    normalize::{normalize, NormalizeError},
    verify::{verify_outputs, VerificationError},
};
use wptnn_fixture::{extract_test_cases, TestCase};

use crate::{
    classify::classify,
    options::RunOptions,
    report::{CaseReport, FileReport, RunReport},
    source::FixtureSource,
};

/// Ends the whole run.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("Cannot list fixtures: {0}")]
    ListFixtures(#[source] io::Error),

    #[error("Backend is gone: {0}")]
    BackendExited(ExecutionError),
}

/// Fails a single test case.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CaseError {
    #[error("{0}")]
    Normalize(#[from] NormalizeError),

    #[error("{0}")]
    Execution(#[from] ExecutionError),

    #[error("{0}")]
    Verification(#[from] VerificationError),
}

enum Flow {
    Continue,
    Stop,
}

/// Closes the executor however the run ends.
struct CloseGuard<'a, E: Executor + ?Sized>(&'a E);

impl<E: Executor + ?Sized> Drop for CloseGuard<'_, E> {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// Runs every selected fixture file against `executor` and closes it
/// afterwards.
pub fn run<S, E>(options: &RunOptions, source: &S, executor: &E) -> RunReport
where
    S: FixtureSource + ?Sized,
    E: Executor + ?Sized,
{
    let _guard = CloseGuard(executor);
    let mut report = RunReport::new(options);

    if let Err(err) = run_files(options, source, executor, &mut report) {
        log::error!("run aborted: {err}");
        report.set_fatal_error(err.to_string());
    }

    report.finish();
    log::info!(
        "run finished: {} passed, {} failed, {} skipped",
        report.summary.passed,
        report.summary.failed,
        report.summary.skipped
    );
    report
}

/// The fixture files `options` selects, in run order.
pub fn select_files(files: Vec<String>, options: &RunOptions) -> Vec<String> {
    let files = files.into_iter().filter(|name| match &options.file_filter {
        Some(filter) => name.contains(filter.as_str()),
        None => true,
    });
    match options.max_files {
        Some(max) => files.take(max).collect(),
        None => files.collect(),
    }
}

/// The test cases of one file that `options` selects.
pub fn select_cases(mut cases: Vec<TestCase>, options: &RunOptions) -> Vec<TestCase> {
    if let Some(op) = &options.op_filter {
        cases.retain(|case| case.resources.uses_operator(op));
    }
    if let Some(max) = options.max_tests {
        cases.truncate(max);
    }
    cases
}

fn run_files<S, E>(
    options: &RunOptions,
    source: &S,
    executor: &E,
    report: &mut RunReport,
) -> Result<(), FatalError>
where
    S: FixtureSource + ?Sized,
    E: Executor + ?Sized,
{
    let files = select_files(source.list().map_err(FatalError::ListFixtures)?, options);
    log::info!("{} fixture files selected", files.len());

    for name in files {
        let mut file = FileReport::new(name.as_str());

        let cases = match load_cases(source, &name, options) {
            Ok(cases) => cases,
            Err(err) => {
                log::warn!("{name}: {err}");
                file.file_error = Some(err);
                report.push_file(file);
                continue;
            }
        };
        file.selected_tests = cases.len();
        log::debug!("{name}: {} test cases selected", cases.len());

        let flow = run_file(&cases, options, executor, &mut file);
        report.push_file(file);
        if let Flow::Stop = flow? {
            log::info!("stopping at the first failure");
            break;
        }
    }
    Ok(())
}

fn load_cases<S: FixtureSource + ?Sized>(
    source: &S,
    name: &str,
    options: &RunOptions,
) -> Result<Vec<TestCase>, String> {
    let text = source
        .read(name)
        .map_err(|err| format!("Cannot read fixture: {err}"))?;
    let cases = extract_test_cases(&text, options.extraction_timeout()).map_err(|err| err.to_string())?;
    Ok(select_cases(cases, options))
}

fn run_file<E: Executor + ?Sized>(
    cases: &[TestCase],
    options: &RunOptions,
    executor: &E,
    file: &mut FileReport,
) -> Result<Flow, FatalError> {
    for variant in &options.variants {
        for case in cases {
            let started = Instant::now();

            if let Some(reason) = classify(&case.resources, options) {
                log::debug!("skip {} [{variant}]: {reason}", case.name);
                file.push(CaseReport::skipped(
                    &case.name,
                    variant,
                    reason.to_string(),
                    started.elapsed(),
                ));
                continue;
            }

            match run_case(case, variant, executor) {
                Ok(()) => {
                    log::info!("pass {} [{variant}]", case.name);
                    file.push(CaseReport::passed(&case.name, variant, started.elapsed()));
                }
                Err(err) => {
                    log::warn!("fail {} [{variant}]: {err}", case.name);
                    file.push(CaseReport::failed(
                        &case.name,
                        variant,
                        err.to_string(),
                        started.elapsed(),
                    ));
                    if let CaseError::Execution(err) = err {
                        if err.is_fatal() {
                            return Err(FatalError::BackendExited(err));
                        }
                    }
                    if options.stop_on_fail {
                        return Ok(Flow::Stop);
                    }
                }
            }
        }
    }
    Ok(Flow::Continue)
}

/// Normalizes, executes and verifies one test case on one variant.
pub fn run_case<E: Executor + ?Sized>(
    case: &TestCase,
    variant: &str,
    executor: &E,
) -> Result<(), CaseError> {
    let graph = normalize(&case.resources)?;
    let execution = GraphExecution::new(graph.document.clone(), graph.inputs.clone())
        .with_expected_outputs(graph.expected_outputs.clone())
        .with_context_option("deviceType", variant);
    let outputs = executor.execute(execution)?;
    verify_outputs(&graph, &outputs)?;
    Ok(())
}
