//! Run orchestration: drive one job through the interpreter host.
//!
//! Stages run in a fixed order, each under its own measurement. A
//! recoverable failure in a source unit is reported and the next unit runs;
//! one in the decode, inject or library stage skips the remaining units.
//! Either way the output and stat records are always written. Fatal
//! failures are handed back to the caller untouched.

use std::io::Write;

use tracing::{debug, info};

use crate::error::{Failure, Fatal, StatusCode};
use crate::host::InterpreterHost;
use crate::intake::Job;
use crate::timer::StageTimer;
use crate::wire::validate;
use crate::writer::{ExecutionStats, OutputWriter};

/// Global the job input is bound to
pub const INPUT: &str = "input";
/// Global read back as the job result
pub const OUTPUT: &str = "output";

/// Sequences the stages of a run.
pub struct Orchestrator<'r, 's, W: Write> {
    host: &'r InterpreterHost,
    writer: &'r OutputWriter<W>,
    timer: &'r StageTimer<'s>,
}

impl<'r, 's, W: Write> Orchestrator<'r, 's, W> {
    /// Create an orchestrator over an initialized host
    pub const fn new(
        host: &'r InterpreterHost,
        writer: &'r OutputWriter<W>,
        timer: &'r StageTimer<'s>,
    ) -> Self {
        Self {
            host,
            writer,
            timer,
        }
    }

    /// Run `job`, leaving the first `quota_start` source units unmetered.
    ///
    /// # Errors
    /// Any fatal condition raised along the way; the caller is expected to
    /// terminate with its status
    pub fn run(&self, job: &Job, quota_start: u32) -> Result<ExecutionStats, Fatal> {
        let meter = self.host.meter();
        meter.set_limit(quota_start == 0);

        match self.prepare(job) {
            Ok(()) => self.run_units(job, quota_start)?,
            Err(Failure::Recoverable(record)) => {
                info!(kind = record.kind(), "run aborted before source units");
                self.writer.emit_error(&record)?;
            }
            Err(Failure::Fatal(fatal)) => return Err(fatal),
        }

        meter.set_limit(true);
        self.emit_output()?;

        let stats = ExecutionStats {
            instructions: meter.count(),
            total_instructions: meter.total(),
            memory: u64::try_from(self.host.memory_usage().used).unwrap_or(u64::MAX),
            bytes_in: job.bytes_read(),
        };
        self.writer.emit_stats(&stats)?;
        debug!(?stats, "run finished");
        Ok(stats)
    }

    /// Decode and inject the input, then load the library.
    fn prepare(&self, job: &Job) -> Result<(), Failure> {
        self.timer.time("decode", || validate(job.input()))?;
        self.timer.time("inject", || self.host.inject(INPUT, job.input()))?;
        self.timer.time("lib", || match job.library() {
            Some(chunk) => self.host.load_precompiled(chunk),
            None => Ok(()),
        })
    }

    fn run_units(&self, job: &Job, quota_start: u32) -> Result<(), Fatal> {
        let meter = self.host.meter();

        for (index, unit) in job.sources().iter().enumerate() {
            if !meter.limited() && index >= quota_start as usize {
                debug!(index, "instruction metering on");
                meter.set_limit(true);
            }

            let outcome = self
                .timer
                .time("compile", || self.host.compile(unit))
                .and_then(|compiled| self.timer.time("eval", || self.host.evaluate(&compiled)));

            match outcome {
                Ok(()) => {}
                Err(Failure::Recoverable(record)) => {
                    debug!(path = %unit.path, kind = record.kind(), "source unit failed");
                    self.writer.emit_error(&record)?;
                }
                Err(Failure::Fatal(fatal)) => return Err(fatal),
            }
        }

        Ok(())
    }

    fn emit_output(&self) -> Result<(), Fatal> {
        let _out = self.timer.measure("out");
        let extracted = self.host.export(OUTPUT).map_err(fatal_only)?;
        let stdout = self.host.export_stdout().map_err(fatal_only)?;
        self.writer.emit_output(&extracted, &stdout)
    }
}

/// Output extraction has no recoverable tier.
fn fatal_only(failure: Failure) -> Fatal {
    match failure {
        Failure::Fatal(fatal) => fatal,
        Failure::Recoverable(_) => Fatal(StatusCode::TypeError),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use crate::config::Options;
    use crate::intake::SourceUnit;
    use crate::wire::{read_value, Value, SYMBOL_EXT};

    fn records(bytes: &[u8]) -> Vec<Value> {
        let mut rd = bytes;
        let mut out = Vec::new();
        while !rd.is_empty() {
            out.push(read_value(&mut rd).unwrap());
        }
        out
    }

    fn tagged<'a>(records: &'a [Value], tag: &str) -> Vec<&'a Value> {
        records
            .iter()
            .filter_map(|r| match r.as_array() {
                Some([t, payload]) if *t == Value::symbol(tag) => Some(payload),
                _ => None,
            })
            .collect()
    }

    fn measurement_names(records: &[Value]) -> Vec<String> {
        tagged(records, "measurement")
            .into_iter()
            .map(|m| match &m.as_array().unwrap()[0] {
                Value::Symbol(sym) => sym.as_str().to_owned(),
                other => panic!("bad measurement name {other:?}"),
            })
            .collect()
    }

    fn execute(job: &Job, options: Options) -> (Result<ExecutionStats, Fatal>, Vec<Value>) {
        let arena = Arena::new(options.memory_quota()).unwrap();
        let host = InterpreterHost::new(arena, options.instruction_quota()).unwrap();
        let writer = OutputWriter::new(Vec::new());
        let result = {
            let timer = StageTimer::new(&writer);
            Orchestrator::new(&host, &writer, &timer).run(job, options.instruction_quota_start())
        };
        (result, records(&writer.into_inner()))
    }

    fn job(sources: &[&str]) -> Job {
        let units = sources
            .iter()
            .enumerate()
            .map(|(i, text)| SourceUnit::new(format!("unit{i}"), *text))
            .collect();
        Job::new(rmpv::Value::Nil, units)
    }

    #[test]
    fn test_output_is_extracted() {
        let (result, records) = execute(&job(&["output = 'x'"]), Options::default());
        assert!(result.is_ok());
        let output = tagged(&records, "output");
        assert_eq!(output.len(), 1);
        assert_eq!(output[0].get("extracted"), Some(&Value::str("x")));
    }

    #[test]
    fn test_syntax_error_does_not_stop_later_units() {
        let (result, records) = execute(&job(&["output = = 1", "output = 2"]), Options::default());
        assert!(result.is_ok());

        let errors = tagged(&records, "error");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].get("__type"), Some(&Value::symbol("syntax")));
        assert_eq!(errors[0].get("filename"), Some(&Value::str("unit0")));

        let output = tagged(&records, "output");
        assert_eq!(output.len(), 1);
        assert_eq!(output[0].get("extracted"), Some(&Value::Int(2)));

        assert_eq!(tagged(&records, "stat").len(), 1);
        assert_eq!(tagged(&[records.last().unwrap().clone()], "stat").len(), 1);
    }

    #[test]
    fn test_runtime_error_is_reported() {
        let (_, records) = execute(&job(&["error('nope')", "output = 1"]), Options::default());
        let errors = tagged(&records, "error");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].get("__type"), Some(&Value::symbol("runtime")));
        assert_eq!(errors[0].get("message"), Some(&Value::str("unit0:1: nope")));
        assert_eq!(
            tagged(&records, "output")[0].get("extracted"),
            Some(&Value::Int(1))
        );
    }

    #[test]
    fn test_measurement_order() {
        let (_, records) = execute(&job(&["a = 1", "b = 2"]), Options::default());
        assert_eq!(
            measurement_names(&records),
            vec!["decode", "inject", "lib", "compile", "eval", "compile", "eval", "out"]
        );
    }

    #[test]
    fn test_default_meters_everything() {
        let (result, _) = execute(&job(&["for i = 1, 50 do end"]), Options::default());
        let stats = result.unwrap();
        assert!(stats.instructions > 50);
        assert_eq!(stats.instructions, stats.total_instructions);
    }

    #[test]
    fn test_deferred_units_are_not_charged() {
        let options = Options::default().with_instruction_quota_start(1);
        let (result, _) = execute(
            &job(&["for i = 1, 500 do end", "for i = 1, 10 do end"]),
            options,
        );
        let stats = result.unwrap();
        assert!(stats.instructions > 0);
        assert!(stats.instructions < stats.total_instructions);
        assert!(stats.total_instructions - stats.instructions >= 500);
    }

    #[test]
    fn test_deferred_unit_may_exceed_quota() {
        let options = Options::default()
            .with_instruction_quota(6_000)
            .with_instruction_quota_start(1);
        let (result, records) = execute(
            &job(&["for i = 1, 10000 do end", "output = 1"]),
            options,
        );
        let stats = result.unwrap();
        assert!(stats.instructions <= 6_000);
        assert!(stats.total_instructions > 10_000);
        assert!(stats.total_instructions > stats.instructions);
        assert!(tagged(&records, "error").is_empty());
        assert_eq!(
            tagged(&records, "output")[0].get("extracted"),
            Some(&Value::Int(1))
        );
    }

    #[test]
    fn test_bytes_in_reported() {
        let job = job(&["output = 1"]).with_bytes_read(42);
        let (result, records) = execute(&job, Options::default());
        assert_eq!(result.unwrap().bytes_in, 42);
        assert_eq!(
            tagged(&records, "stat")[0].get("bytes_in"),
            Some(&Value::Int(42))
        );
    }

    #[test]
    fn test_exit_ends_only_its_unit() {
        let (_, records) = execute(
            &job(&["output = 1 exit() output = 99", "output = output + 1"]),
            Options::default(),
        );
        assert!(tagged(&records, "error").is_empty());
        assert_eq!(
            tagged(&records, "output")[0].get("extracted"),
            Some(&Value::Int(2))
        );
    }

    #[test]
    fn test_input_is_injected() {
        let input = rmpv::Value::Map(vec![(
            rmpv::Value::Ext(SYMBOL_EXT, b"n".to_vec()),
            rmpv::Value::from(5),
        )]);
        let job = Job::new(input, vec![SourceUnit::new("A", "output = input[sym('n')] * 2")]);
        let (_, records) = execute(&job, Options::default());
        assert_eq!(
            tagged(&records, "output")[0].get("extracted"),
            Some(&Value::Int(10))
        );
    }

    #[test]
    fn test_bad_input_value_skips_sources() {
        let input = rmpv::Value::Array(vec![rmpv::Value::Ext(4, vec![1, 2])]);
        let job = Job::new(input, vec![SourceUnit::new("A", "output = 'ran'")]);
        let (result, records) = execute(&job, Options::default());
        assert!(result.is_ok());

        let errors = tagged(&records, "error");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].get("__type"), Some(&Value::symbol("unknown_ext")));
        assert_eq!(errors[0].get("type"), Some(&Value::Int(4)));
        assert_eq!(tagged(&records, "output")[0].get("extracted"), Some(&Value::Nil));
        assert_eq!(tagged(&records, "stat").len(), 1);
        assert!(!measurement_names(&records).contains(&"compile".to_string()));
    }

    #[test]
    fn test_library_runs_before_sources() {
        let chunk = {
            let arena = Arena::new(Options::default().memory_quota()).unwrap();
            let builder = InterpreterHost::new(arena, 1_000_000).unwrap();
            let bytes = builder
                .compile(&SourceUnit::new("lib", "function twice(n) return n * 2 end"))
                .unwrap()
                .dump();
            bytes
        };
        let job = Job::new(rmpv::Value::Nil, vec![SourceUnit::new("A", "output = twice(4)")])
            .with_library(chunk);
        let (_, records) = execute(&job, Options::default());
        assert!(tagged(&records, "error").is_empty());
        assert_eq!(
            tagged(&records, "output")[0].get("extracted"),
            Some(&Value::Int(8))
        );
    }

    #[test]
    fn test_failing_library_skips_sources() {
        let chunk = {
            let arena = Arena::new(Options::default().memory_quota()).unwrap();
            let builder = InterpreterHost::new(arena, 1_000_000).unwrap();
            let bytes = builder
                .compile(&SourceUnit::new("lib", "error('lib broke')"))
                .unwrap()
                .dump();
            bytes
        };
        let job = Job::new(rmpv::Value::Nil, vec![SourceUnit::new("A", "output = 1")])
            .with_library(chunk);
        let (result, records) = execute(&job, Options::default());
        assert!(result.is_ok());
        let errors = tagged(&records, "error");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].get("__type"), Some(&Value::symbol("runtime")));
        assert_eq!(tagged(&records, "output")[0].get("extracted"), Some(&Value::Nil));
    }

    #[test]
    fn test_stdout_reported() {
        let (_, records) = execute(&job(&["print('hello')"]), Options::default());
        assert_eq!(
            tagged(&records, "output")[0].get("stdout"),
            Some(&Value::str("hello\n"))
        );
    }

    #[test]
    fn test_too_deep_input_is_fatal() {
        let mut input = rmpv::Value::Nil;
        for _ in 0..=crate::MAX_DEPTH {
            input = rmpv::Value::Array(vec![input]);
        }
        let (result, records) = execute(&Job::new(input, vec![]), Options::default());
        assert_eq!(result, Err(Fatal(StatusCode::StructureTooDeep)));
        assert!(tagged(&records, "stat").is_empty());
    }

    #[test]
    fn test_unextractable_output_is_fatal() {
        let (result, _) = execute(&job(&["output = print"]), Options::default());
        assert_eq!(result, Err(Fatal(StatusCode::UnknownType)));
    }
}
