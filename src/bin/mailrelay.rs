//! CLI entry point: parses configuration, builds a queue processor, and
//! either drains the spool once or runs forever as a daemon.

use std::process::ExitCode;

use mailrelay::config::Settings;
use mailrelay::queue::{QueueProcessor, QueueProcessorConfig};
use mailrelay::spool::Maildir;
use mailrelay::transport::smtp::{Credentials, SmtpMailer, SmtpMailerConfig};

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let settings = match Settings::from_args(std::env::args_os()) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("mailrelay: {err}");
            return ExitCode::FAILURE;
        }
    };

    let maildir = match Maildir::open(&settings.queue_path, true) {
        Ok(maildir) => maildir,
        Err(err) => {
            eprintln!("mailrelay: {err}");
            return ExitCode::FAILURE;
        }
    };

    let credentials = match (&settings.username, &settings.password) {
        (Some(username), Some(password)) => {
            Some(Credentials::new(username.clone(), password.clone()))
        }
        _ => None,
    };

    let mailer = SmtpMailer::new(SmtpMailerConfig {
        hostname: settings.hostname.clone(),
        port: settings.port,
        credentials,
        tls: settings.tls,
        ..Default::default()
    });

    let mut processor = QueueProcessor::new(
        maildir,
        mailer,
        QueueProcessorConfig {
            interval: settings.interval,
            retry_interval: settings.interval,
            clean_lock_links_on_start: true,
            ..Default::default()
        },
    );

    if settings.daemon {
        processor.run();
    } else {
        processor.tick();
    }

    ExitCode::SUCCESS
}
