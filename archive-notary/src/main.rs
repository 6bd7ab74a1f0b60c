// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    archive_notary::{
        config::{ensure_entitlements_file, Credentials, PipelineSettings, ToolPrograms},
        tools::Toolchain,
        ArchiveNotaryError, ArchiveSpec, Manifest, NotarizationStatus, NotaryClient, Pipeline,
        RunLog, RunLogDirectory, SystemClock, SystemCommandRunner, WorkingDirectory,
    },
    chrono::Utc,
    clap::{Arg, ArgMatches, Command},
    log::LevelFilter,
    std::{
        path::{Path, PathBuf},
        time::Duration,
    },
};

const RUN_ABOUT: &str = "\
Sign, notarize, and publish every archive in the manifest.

Each archive is downloaded from <remote base>/<commit>/<path>, the binaries
listed for it are signed (recursing into nested archives), and the repacked
archive is submitted for notarization. Once Apple accepts a submission the
archive is uploaded to <publish base>/<commit>/<path>.

The following environment variables must be set:

CODESIGN_USERNAME      Apple ID used for notarization.
CODESIGN_CERT_NAME     Name of the signing certificate in the keychain.
APP_SPECIFIC_PASSWORD  App-specific password for the Apple ID.

CODESIGN_PRIMARY_BUNDLE_ID optionally overrides the bundle ID sent with
submissions.

Archives that cannot be downloaded or unpacked are skipped. Any other error
stops the run. The working directory is left behind on failure; pass it to
--work-dir on the next attempt to reuse the downloads.
";

fn manifest_from_args(args: &ArgMatches) -> Result<Manifest, ArchiveNotaryError> {
    match args.value_of("manifest") {
        Some(path) => Manifest::from_path(Path::new(path)),
        None => Manifest::builtin(),
    }
}

/// Upper bound for any delay given on the command line: one week.
const MAX_DELAY_SECONDS: u64 = 7 * 24 * 60 * 60;

fn seconds_from_args(
    args: &ArgMatches,
    name: &str,
) -> Result<Option<Duration>, ArchiveNotaryError> {
    args.value_of(name)
        .map(|value| {
            match value.parse::<u64>() {
                Ok(seconds) if seconds <= MAX_DELAY_SECONDS => Ok(Duration::from_secs(seconds)),
                _ => Err(ArchiveNotaryError::CliBadArgument(format!(
                    "--{} must be a number of seconds no greater than {}; got {}",
                    name.replace('_', "-"),
                    MAX_DELAY_SECONDS,
                    value
                ))),
            }
        })
        .transpose()
}

fn settings_from_args(args: &ArgMatches) -> Result<PipelineSettings, ArchiveNotaryError> {
    let mut settings = PipelineSettings::default();

    if let Some(value) = args.value_of("remote_base") {
        settings.remote_base = value.to_string();
    }
    settings.publish_base = args.value_of("publish_base").map(|x| x.to_string());
    if let Some(value) = args.value_of("work_root") {
        settings.work_root = PathBuf::from(value);
    }
    if let Some(value) = args.value_of("log_root") {
        settings.log_root = PathBuf::from(value);
    }
    if let Some(value) = args.value_of("entitlements") {
        settings.entitlements_path = PathBuf::from(value);
    }

    if let Some(value) = args.value_of("submit_attempts") {
        settings.submit.max_attempts = match value.parse::<u32>() {
            Ok(attempts) if attempts > 0 => attempts,
            _ => {
                return Err(ArchiveNotaryError::CliBadArgument(format!(
                    "--submit-attempts must be a positive integer; got {}",
                    value
                )))
            }
        };
    }
    if let Some(delay) = seconds_from_args(args, "submit_delay_seconds")? {
        settings.submit.retry_delay = delay;
    }
    if let Some(warm_up) = seconds_from_args(args, "warm_up_seconds")? {
        settings.poll.warm_up = warm_up;
    }
    if let Some(interval) = seconds_from_args(args, "min_interval_seconds")? {
        settings.poll.min_interval = interval;
    }

    Ok(settings)
}

fn required<'a>(args: &'a ArgMatches, name: &str) -> Result<&'a str, ArchiveNotaryError> {
    args.value_of(name)
        .ok_or_else(|| ArchiveNotaryError::CliBadArgument(format!("{} is required", name)))
}

fn run_archives(
    args: &ArgMatches,
    archives: &[ArchiveSpec],
    commit: &str,
) -> Result<(), ArchiveNotaryError> {
    let settings = settings_from_args(args)?;
    let credentials = Credentials::from_env()?;
    let programs = ToolPrograms::default();
    ToolPrograms::verify_installed(programs.processing_programs())?;
    ensure_entitlements_file(&settings.entitlements_path)?;

    let started = Utc::now();
    let log_dir = RunLogDirectory::create(&settings.log_root, started, commit)?;
    let mut log = RunLog::with_transcript(log_dir.transcript_path());

    let work_dir = log.record_fatal(match args.value_of("work_dir") {
        Some(path) => WorkingDirectory::reuse(path),
        None => WorkingDirectory::create(&settings.work_root, started),
    })?;
    log.info(format!(
        "processing {} archives for {} in {}; logging to {}",
        archives.len(),
        commit,
        work_dir.path().display(),
        log_dir.path().display()
    ));

    let runner = SystemCommandRunner;
    let clock = SystemClock;
    let toolchain = Toolchain::new(
        &runner,
        programs.clone(),
        &credentials.signing_identity,
        &settings.entitlements_path,
    );
    let notary = NotaryClient::new(
        &runner,
        &clock,
        &programs.xcrun,
        credentials,
        settings.submit,
    );
    let pipeline = Pipeline::new(&settings, &toolchain, &notary, &clock).with_listings(&log_dir);

    let summary = pipeline.execute(archives, commit, work_dir.path(), &mut log)?;

    for line in summary.lines() {
        println!("{}", line);
    }

    log.record_fatal(work_dir.remove())
}

fn command_run(args: &ArgMatches) -> Result<(), ArchiveNotaryError> {
    let manifest = manifest_from_args(args)?;
    let commit = required(args, "commit")?;

    run_archives(args, &manifest.archives, commit)
}

fn command_run_side(args: &ArgMatches) -> Result<(), ArchiveNotaryError> {
    let manifest = manifest_from_args(args)?;
    let name = required(args, "name")?;
    let commit = required(args, "commit")?;

    run_archives(args, manifest.side_manifest(name)?, commit)
}

fn command_verify(args: &ArgMatches) -> Result<(), ArchiveNotaryError> {
    let settings = settings_from_args(args)?;
    let credentials = Credentials::from_env()?;
    let programs = ToolPrograms::default();
    ToolPrograms::verify_installed([programs.xcrun.as_str()])?;

    let request_id = required(args, "request_id")?;

    let runner = SystemCommandRunner;
    let clock = SystemClock;
    let toolchain = Toolchain::new(
        &runner,
        programs.clone(),
        &credentials.signing_identity,
        &settings.entitlements_path,
    );
    let notary = NotaryClient::new(
        &runner,
        &clock,
        &programs.xcrun,
        credentials,
        settings.submit,
    );
    let pipeline = Pipeline::new(&settings, &toolchain, &notary, &clock);

    match pipeline.verify(request_id, &mut RunLog::new())? {
        NotarizationStatus::Completed => println!("{}: success", request_id),
        NotarizationStatus::Pending => println!("{}: in progress", request_id),
    }

    Ok(())
}

fn command_list(args: &ArgMatches) -> Result<(), ArchiveNotaryError> {
    let manifest = manifest_from_args(args)?;

    let archives = match args.value_of("side") {
        Some(name) => manifest.side_manifest(name)?,
        None => manifest.archives.as_slice(),
    };

    for spec in archives {
        for line in spec.tree_lines() {
            println!("{}", line);
        }
    }

    if args.value_of("side").is_none() && !manifest.side_manifests.is_empty() {
        println!();
        println!("side manifests:");
        for (name, specs) in &manifest.side_manifests {
            println!("  {} ({} archives)", name, specs.len());
        }
    }

    Ok(())
}

fn main_impl() -> Result<(), ArchiveNotaryError> {
    let app = Command::new("archive-notary")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Gregory Szorc <gregory.szorc@gmail.com>")
        .about("Sign and notarize trees of nested macOS zip archives")
        .arg_required_else_help(true)
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .global(true)
                .multiple_occurrences(true)
                .help("Increase logging verbosity. Can be specified multiple times."),
        )
        .arg(
            Arg::new("manifest")
                .long("manifest")
                .global(true)
                .takes_value(true)
                .help("JSON or YAML manifest to use instead of the built-in one"),
        )
        .arg(
            Arg::new("work_dir")
                .long("work-dir")
                .global(true)
                .takes_value(true)
                .help("Existing working directory to reuse (e.g. from a failed run)"),
        )
        .arg(
            Arg::new("work_root")
                .long("work-root")
                .global(true)
                .takes_value(true)
                .help("Directory new working directories are created in [default: work]"),
        )
        .arg(
            Arg::new("log_root")
                .long("log-root")
                .global(true)
                .takes_value(true)
                .help("Directory run logs are written to [default: logs]"),
        )
        .arg(
            Arg::new("remote_base")
                .long("remote-base")
                .global(true)
                .takes_value(true)
                .help("Storage prefix archives are downloaded from [default: gs://flutter_infra/flutter]"),
        )
        .arg(
            Arg::new("publish_base")
                .long("publish-base")
                .global(true)
                .takes_value(true)
                .help("Storage prefix signed archives are uploaded to [default: the remote base]"),
        )
        .arg(
            Arg::new("entitlements")
                .long("entitlements")
                .global(true)
                .takes_value(true)
                .help("Entitlements plist, created if missing [default: Entitlements.plist]"),
        )
        .arg(
            Arg::new("submit_attempts")
                .long("submit-attempts")
                .global(true)
                .takes_value(true)
                .help("Notarization submission attempts before giving up [default: 3]"),
        )
        .arg(
            Arg::new("submit_delay_seconds")
                .long("submit-delay-seconds")
                .global(true)
                .takes_value(true)
                .help("Pause between submission attempts [default: 10]"),
        )
        .arg(
            Arg::new("warm_up_seconds")
                .long("warm-up-seconds")
                .global(true)
                .takes_value(true)
                .help("Minimum wait between submission and first status check [default: 45]"),
        )
        .arg(
            Arg::new("min_interval_seconds")
                .long("min-interval-seconds")
                .global(true)
                .takes_value(true)
                .help("Minimum wait between status checks [default: 20]"),
        );

    let app = app.subcommand(
        Command::new("run")
            .about("Sign, notarize, and publish the archives of a commit")
            .long_about(RUN_ABOUT)
            .arg(
                Arg::new("commit")
                    .required(true)
                    .help("Revision whose archives to process"),
            ),
    );

    let app = app.subcommand(
        Command::new("run-side")
            .about("Sign, notarize, and publish the archives of a side manifest")
            .long_about(RUN_ABOUT)
            .arg(
                Arg::new("name")
                    .required(true)
                    .help("Name of the side manifest"),
            )
            .arg(
                Arg::new("commit")
                    .required(true)
                    .help("Revision whose archives to process"),
            ),
    );

    let app = app.subcommand(
        Command::new("verify")
            .about("Check the status of a notarization request once")
            .arg(
                Arg::new("request_id")
                    .required(true)
                    .help("RequestUUID reported when the archive was submitted"),
            ),
    );

    let app = app.subcommand(
        Command::new("list")
            .about("Print the archives of a manifest")
            .arg(
                Arg::new("side")
                    .long("side")
                    .takes_value(true)
                    .help("Print this side manifest instead of the main archive list"),
            ),
    );

    let matches = app.get_matches();

    let log_level = match matches.occurrences_of("verbose") {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(log_level.as_str()),
    );

    // Disable log context except at higher log levels.
    if log_level <= LevelFilter::Info {
        builder
            .format_timestamp(None)
            .format_level(false)
            .format_target(false);
    }

    builder.init();

    match matches.subcommand() {
        Some(("list", args)) => command_list(args),
        Some(("run", args)) => command_run(args),
        Some(("run-side", args)) => command_run_side(args),
        Some(("verify", args)) => command_verify(args),
        _ => Err(ArchiveNotaryError::CliUnknownCommand),
    }
}

fn main() {
    let exit_code = match main_impl() {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("Error: {}", err);
            1
        }
    };

    std::process::exit(exit_code)
}
