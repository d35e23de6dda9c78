//! Configuration for flows and the parallel scheduler.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Where, if anywhere, to persist the flow when training or execution fails.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum CrashRecovery {
    /// Failures are reported without persisting anything.
    #[default]
    Off,
    /// Persist into a fresh file in the system temporary directory.
    TempDir,
    /// Persist to this file, replacing any earlier snapshot.
    Path(PathBuf),
}

impl CrashRecovery {
    /// The file a snapshot taken now should be written to, if recovery is enabled.
    pub fn target(&self) -> Option<PathBuf> {
        match self {
            CrashRecovery::Off => None,
            CrashRecovery::TempDir => {
                let nanos = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|elapsed| elapsed.as_nanos())
                    .unwrap_or(0);
                let name = format!("trainflow-crash-{}-{}.bin", std::process::id(), nanos);
                Some(std::env::temp_dir().join(name))
            }
            CrashRecovery::Path(path) => Some(path.clone()),
        }
    }
}

impl FromStr for CrashRecovery {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Err("empty crash recovery target".to_owned()),
            "off" => Ok(CrashRecovery::Off),
            "tmp" => Ok(CrashRecovery::TempDir),
            path => Ok(CrashRecovery::Path(PathBuf::from(path))),
        }
    }
}

/// Flow and scheduler configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Config {
    /// Persistence of the flow on failure.
    pub crash_recovery: CrashRecovery,
    /// If set, jobs cover at most this many rows; longer chunks are split.
    pub job_rows: Option<usize>,
    /// Print logged events to standard error.
    pub log_stderr: bool,
}

impl Config {

    /// Sets the crash recovery target.
    pub fn crash_recovery(mut self, crash_recovery: CrashRecovery) -> Self {
        self.crash_recovery = crash_recovery;
        self
    }

    /// Bounds the rows covered by each job.
    pub fn job_rows(mut self, rows: usize) -> Self {
        self.job_rows = Some(rows);
        self
    }

    /// Enables printing logged events to standard error.
    pub fn log_stderr(mut self, enabled: bool) -> Self {
        self.log_stderr = enabled;
        self
    }

    /// Installs options into a [`getopts::Options`] struct that correspond
    /// to the parameters in the configuration.
    ///
    /// It is the caller's responsibility to ensure that the installed options
    /// do not conflict with any other options that may exist in `opts`, or
    /// that may be installed into `opts` in the future.
    #[cfg(feature = "getopts")]
    pub fn install_options(opts: &mut getopts::Options) {
        opts.optopt("", "crash-recovery", "persist the flow on failure (off, tmp, or a file)", "TARGET");
        opts.optopt("", "job-rows", "largest number of rows per job", "NUM");
        opts.optflag("", "log-stderr", "print logged events to standard error");
    }

    /// Instantiates a configuration based upon the parsed options in `matches`.
    ///
    /// The `matches` object must have been constructed from a
    /// [`getopts::Options`] which contained at least the options installed by
    /// [`Self::install_options`].
    #[cfg(feature = "getopts")]
    pub fn from_matches(matches: &getopts::Matches) -> Result<Config, String> {
        let crash_recovery = matches
            .opt_get_default("crash-recovery", CrashRecovery::Off)
            .map_err(|e| e.to_string())?;
        let job_rows = matches
            .opt_get::<usize>("job-rows")
            .map_err(|e| e.to_string())?
            .filter(|rows| *rows > 0);
        Ok(Config {
            crash_recovery,
            job_rows,
            log_stderr: matches.opt_present("log-stderr"),
        })
    }

    /// Constructs a configuration by parsing supplied text arguments.
    ///
    /// Most commonly, this uses `std::env::args().skip(1)` as the supplied iterator.
    #[cfg(feature = "getopts")]
    pub fn from_args<I: IntoIterator<Item = String>>(args: I) -> Result<Config, String> {
        let mut opts = getopts::Options::new();
        Config::install_options(&mut opts);
        let matches = opts.parse(args).map_err(|e| e.to_string())?;
        Config::from_matches(&matches)
    }
}

#[cfg(test)]
mod tests {

    use std::path::PathBuf;

    use super::{Config, CrashRecovery};

    #[test]
    fn parse_targets() {
        assert_eq!("off".parse::<CrashRecovery>(), Ok(CrashRecovery::Off));
        assert_eq!("tmp".parse::<CrashRecovery>(), Ok(CrashRecovery::TempDir));
        assert_eq!("/x/y".parse::<CrashRecovery>(), Ok(CrashRecovery::Path(PathBuf::from("/x/y"))));
        assert!(CrashRecovery::Off.target().is_none());
        assert!(CrashRecovery::TempDir.target().unwrap().starts_with(std::env::temp_dir()));
    }

    #[cfg(feature = "getopts")]
    #[test]
    fn from_args() {
        let args = ["--crash-recovery", "tmp", "--job-rows", "5", "--log-stderr"];
        let config = Config::from_args(args.iter().map(|s| s.to_string())).unwrap();
        assert_eq!(config, Config::default().crash_recovery(CrashRecovery::TempDir).job_rows(5).log_stderr(true));

        assert_eq!(Config::from_args(Vec::new()).unwrap(), Config::default());
        assert!(Config::from_args(vec!["--job-rows".to_owned(), "many".to_owned()]).is_err());
    }
}
