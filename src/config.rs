//! Configuration for the queue processor binary: CLI flags layered over an
//! optional INI file, layered over defaults.
//!
//! Precedence, highest to lowest: explicit CLI flags, the `[app:mailrelay]`
//! section of `--config <path>` if given, then the built-in defaults.
//! `queue_path` follows the same rule: the positional CLI argument wins if
//! given, otherwise the INI file's `queue_path` key, otherwise it's an error.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;

use crate::transport::smtp::TlsPolicy;

/// Errors raised while assembling a [`Settings`].
#[derive(Debug, Error)]
pub enum Error {
    /// Neither `--config`'s `queue_path` nor a positional argument named a
    /// spool directory.
    #[error("a queue path is required, either as a positional argument or as queue_path in --config")]
    MissingQueuePath,

    /// `--username` was given without `--password` (or vice versa via INI).
    #[error("a username was given without a password")]
    UsernameWithoutPassword,

    /// `--force-tls` and `--no-tls` are mutually exclusive.
    #[error("--force-tls and --no-tls cannot both be set")]
    ConflictingTlsFlags,

    /// The `--config` file could not be read or parsed.
    #[error("failed to read config file {path}: {source}")]
    Ini {
        path: PathBuf,
        #[source]
        source: ini::Error,
    },
}

#[derive(Parser, Debug)]
#[command(name = "mailrelay", about = "Drains a Maildir spool over SMTP")]
struct Cli {
    /// Directory of the Maildir spool to drain. Required unless supplied
    /// as `queue_path` in `--config`.
    queue_path: Option<PathBuf>,

    /// Load defaults from the `[app:mailrelay]` section of an INI file;
    /// any CLI flag given explicitly still overrides it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Keep running, sleeping `--interval` seconds between scans, instead
    /// of draining the spool once and exiting.
    #[arg(long)]
    daemon: bool,

    #[arg(long)]
    interval: Option<u64>,

    #[arg(long)]
    hostname: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    #[arg(long)]
    username: Option<String>,

    #[arg(long)]
    password: Option<String>,

    #[arg(long)]
    force_tls: bool,

    #[arg(long)]
    no_tls: bool,
}

/// Fully resolved configuration for one run of the queue processor.
#[derive(Debug, Clone)]
pub struct Settings {
    pub queue_path: PathBuf,
    pub daemon: bool,
    pub interval: Duration,
    pub hostname: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: TlsPolicy,
}

/// Fields as read from an INI file, all optional: CLI flags that were
/// actually given take priority over these.
#[derive(Debug, Clone, Default)]
struct IniSettings {
    queue_path: Option<String>,
    daemon: Option<bool>,
    interval: Option<u64>,
    hostname: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    password: Option<String>,
    force_tls: Option<bool>,
    no_tls: Option<bool>,
}

const INI_SECTION: &str = "app:mailrelay";

fn load_ini(path: &std::path::Path) -> Result<IniSettings, Error> {
    let conf = ini::Ini::load_from_file(path).map_err(|source| Error::Ini {
        path: path.to_path_buf(),
        source,
    })?;
    let section = conf.section(Some(INI_SECTION));

    let get = |key: &str| section.and_then(|s| s.get(key)).map(str::to_string);
    let get_bool = |key: &str| get(key).map(|v| v.eq_ignore_ascii_case("true") || v == "1");
    let get_u64 = |key: &str| get(key).and_then(|v| v.parse().ok());
    let get_u16 = |key: &str| get(key).and_then(|v| v.parse().ok());

    Ok(IniSettings {
        queue_path: get("queue_path"),
        daemon: get_bool("daemon"),
        interval: get_u64("interval"),
        hostname: get("hostname"),
        port: get_u16("port"),
        username: get("username"),
        password: get("password"),
        force_tls: get_bool("force_tls"),
        no_tls: get_bool("no_tls"),
    })
}

impl Settings {
    /// Parses `args` (as `std::env::args_os()` would, with argv\[0\] at
    /// index 0) into a fully resolved [`Settings`], reading `--config`'s
    /// INI file if present.
    pub fn from_args<I, T>(args: I) -> Result<Settings, Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli = Cli::parse_from(args);
        Self::resolve(cli)
    }

    fn resolve(cli: Cli) -> Result<Settings, Error> {
        let ini = match &cli.config {
            Some(path) => load_ini(path)?,
            None => IniSettings::default(),
        };

        let queue_path = cli
            .queue_path
            .clone()
            .or_else(|| ini.queue_path.clone().map(PathBuf::from))
            .ok_or(Error::MissingQueuePath)?;

        let daemon = cli.daemon || ini.daemon.unwrap_or(false);
        let interval = cli.interval.or(ini.interval).unwrap_or(3);
        let hostname = cli
            .hostname
            .or(ini.hostname)
            .unwrap_or_else(|| "localhost".to_string());
        let port = cli.port.or(ini.port).unwrap_or(25);
        let username = cli.username.or(ini.username);
        let password = cli.password.or(ini.password);
        let force_tls = cli.force_tls || ini.force_tls.unwrap_or(false);
        let no_tls = cli.no_tls || ini.no_tls.unwrap_or(false);

        if username.is_some() != password.is_some() {
            return Err(Error::UsernameWithoutPassword);
        }
        if force_tls && no_tls {
            return Err(Error::ConflictingTlsFlags);
        }

        let tls = if no_tls {
            TlsPolicy::Never
        } else if force_tls {
            TlsPolicy::Required
        } else {
            TlsPolicy::Opportunistic
        };

        Ok(Settings {
            queue_path,
            daemon,
            interval: Duration::from_secs(interval),
            hostname,
            port,
            username,
            password,
            tls,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn args(s: &str) -> Vec<String> {
        std::iter::once("mailrelay".to_string())
            .chain(s.split_whitespace().map(str::to_string))
            .collect()
    }

    #[test]
    fn simplest_case_uses_defaults() {
        let dir = tempdir().unwrap();
        let settings = Settings::from_args(args(&dir.path().display().to_string())).unwrap();
        assert_eq!(settings.queue_path, dir.path());
        assert!(!settings.daemon);
        assert_eq!(settings.interval, Duration::from_secs(3));
        assert_eq!(settings.hostname, "localhost");
        assert_eq!(settings.port, 25);
        assert_eq!(settings.username, None);
        assert_eq!(settings.tls, TlsPolicy::Opportunistic);
    }

    #[test]
    fn missing_queue_path_is_an_error() {
        assert!(matches!(
            Settings::from_args(args("")),
            Err(Error::MissingQueuePath)
        ));
    }

    #[test]
    fn almost_all_options_override_defaults() {
        let dir = tempdir().unwrap();
        let cmdline = format!(
            "--daemon --interval 7 --hostname foo --port 75 --username chris --password rossi --force-tls {}",
            dir.path().display()
        );
        let settings = Settings::from_args(args(&cmdline)).unwrap();
        assert!(settings.daemon);
        assert_eq!(settings.interval, Duration::from_secs(7));
        assert_eq!(settings.hostname, "foo");
        assert_eq!(settings.port, 75);
        assert_eq!(settings.username.as_deref(), Some("chris"));
        assert_eq!(settings.password.as_deref(), Some("rossi"));
        assert_eq!(settings.tls, TlsPolicy::Required);
    }

    #[test]
    fn username_without_password_is_an_error() {
        let dir = tempdir().unwrap();
        let cmdline = format!("--username chris {}", dir.path().display());
        assert!(matches!(
            Settings::from_args(args(&cmdline)),
            Err(Error::UsernameWithoutPassword)
        ));
    }

    #[test]
    fn force_tls_and_no_tls_conflict() {
        let dir = tempdir().unwrap();
        let cmdline = format!("--force-tls --no-tls {}", dir.path().display());
        assert!(matches!(
            Settings::from_args(args(&cmdline)),
            Err(Error::ConflictingTlsFlags)
        ));
    }

    #[test]
    fn ini_file_supplies_overrides_and_cli_queue_path_wins() {
        let dir = tempdir().unwrap();
        let ini_path = dir.path().join("mailrelay.ini");
        let mut f = std::fs::File::create(&ini_path).unwrap();
        writeln!(
            f,
            "[app:mailrelay]\ninterval = 33\nhostname = testhost\nport = 2525\n\
             username = Chris\npassword = Rossi\nforce_tls = False\nno_tls = True\n\
             queue_path = hammer/dont/hurt/em\n"
        )
        .unwrap();

        // --config alone: queue_path comes from the INI file.
        let settings =
            Settings::from_args(args(&format!("--config {}", ini_path.display()))).unwrap();
        assert_eq!(settings.queue_path, PathBuf::from("hammer/dont/hurt/em"));
        assert!(!settings.daemon);
        assert_eq!(settings.interval, Duration::from_secs(33));
        assert_eq!(settings.hostname, "testhost");
        assert_eq!(settings.port, 2525);
        assert_eq!(settings.username.as_deref(), Some("Chris"));
        assert_eq!(settings.password.as_deref(), Some("Rossi"));
        assert_eq!(settings.tls, TlsPolicy::Never);

        // A positional queue path overrides the INI file's.
        let settings = Settings::from_args(args(&format!(
            "--config {} {}",
            ini_path.display(),
            dir.path().display()
        )))
        .unwrap();
        assert_eq!(settings.queue_path, dir.path());
    }

    #[test]
    fn empty_ini_section_falls_back_to_defaults_except_queue_path() {
        let dir = tempdir().unwrap();
        let ini_path = dir.path().join("mailrelay.ini");
        std::fs::write(&ini_path, "[app:mailrelay]\n\nqueue_path=foo\n").unwrap();

        let settings = Settings::from_args(args(&format!(
            "--config {} {}",
            ini_path.display(),
            dir.path().display()
        )))
        .unwrap();
        assert_eq!(settings.queue_path, dir.path());
        assert!(!settings.daemon);
        assert_eq!(settings.interval, Duration::from_secs(3));
        assert_eq!(settings.hostname, "localhost");
        assert_eq!(settings.port, 25);
        assert_eq!(settings.username, None);
        assert_eq!(settings.password, None);
        assert_eq!(settings.tls, TlsPolicy::Opportunistic);
    }
}
