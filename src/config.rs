//! Run options: quotas handed to the host on the command line.

use thiserror::Error;

use crate::arena::MIB;

/// Instruction quota when `-i` is not given
pub const DEFAULT_INSTRUCTION_QUOTA: u64 = 100_000;
/// Lowest instruction quota accepted; smaller requests are raised to it
pub const MIN_INSTRUCTION_QUOTA: u64 = 6_000;
/// Arena capacity request when `-m` is not given
pub const DEFAULT_MEMORY_QUOTA: usize = 8 * MIB;

/// Option parsing errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Flag given without its value
    #[error("missing value for {0}")]
    MissingValue(&'static str),

    /// Value is not a non-negative integer
    #[error("could not parse {option} from: {value}")]
    InvalidValue {
        /// Human-readable option name
        option: &'static str,
        /// Offending text
        value: String,
    },
}

/// Quotas for one run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Options {
    instruction_quota: u64,
    instruction_quota_start: u32,
    memory_quota: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            instruction_quota: DEFAULT_INSTRUCTION_QUOTA,
            instruction_quota_start: 0,
            memory_quota: DEFAULT_MEMORY_QUOTA,
        }
    }
}

/// What the command line asks for
#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    /// Run a job with these options
    Run(Options),
    /// Print usage and exit
    Help,
}

impl Options {
    /// Set the instruction quota, applying the floor
    #[must_use]
    pub fn with_instruction_quota(mut self, quota: u64) -> Self {
        self.instruction_quota = quota.max(MIN_INSTRUCTION_QUOTA);
        self
    }

    /// Set how many leading source units run unmetered, saturating at `u32::MAX`
    #[must_use]
    pub fn with_instruction_quota_start(mut self, start: u64) -> Self {
        self.instruction_quota_start = u32::try_from(start).unwrap_or(u32::MAX);
        self
    }

    /// Set the arena capacity request; validated when the arena is created
    #[must_use]
    pub const fn with_memory_quota(mut self, bytes: usize) -> Self {
        self.memory_quota = bytes;
        self
    }

    /// Instruction budget for metered execution
    #[must_use]
    pub const fn instruction_quota(&self) -> u64 {
        self.instruction_quota
    }

    /// Number of leading source units exempt from metering
    #[must_use]
    pub const fn instruction_quota_start(&self) -> u32 {
        self.instruction_quota_start
    }

    /// Requested arena capacity in bytes
    #[must_use]
    pub const fn memory_quota(&self) -> usize {
        self.memory_quota
    }

    /// Parse options from `args` (program name excluded).
    ///
    /// A value that fails to parse is reported through `on_error` and the
    /// option keeps its previous value. Unknown arguments are ignored.
    pub fn parse<I, S>(args: I, mut on_error: impl FnMut(ConfigError)) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut options = Self::default();
        let mut args = args.into_iter();

        while let Some(arg) = args.next() {
            let arg = arg.as_ref();
            let (flag, option) = match arg {
                "-h" | "--help" => return Command::Help,
                "-i" => ("-i", "instruction quota (-i)"),
                "-C" => ("-C", "instruction quota start (-C)"),
                "-m" => ("-m", "memory quota (-m)"),
                _ => continue,
            };

            let Some(value) = args.next() else {
                on_error(ConfigError::MissingValue(option));
                break;
            };
            let value = value.as_ref();
            let Ok(number) = value.parse::<u64>() else {
                on_error(ConfigError::InvalidValue {
                    option,
                    value: value.to_string(),
                });
                continue;
            };

            options = match flag {
                "-i" => options.with_instruction_quota(number),
                "-C" => options.with_instruction_quota_start(number),
                _ => options.with_memory_quota(usize::try_from(number).unwrap_or(usize::MAX)),
            };
        }

        Command::Run(options)
    }
}

/// Usage text for `-h`
pub const USAGE: &str = "\
script-host: run one job from stdin under memory and instruction quotas

USAGE:
    script-host [OPTIONS] < job.msgpack

OPTIONS:
    -i <N>        Instruction quota (default: 100000, minimum: 6000)
    -C <N>        Number of leading source units exempt from the quota (default: 0)
    -m <BYTES>    Memory quota (default: 8388608)
    -h, --help    Print help";
