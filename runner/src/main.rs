use clap::{Args, Parser, Subcommand};
use genscan::{
    builder::{self, BuildError, BuildOptions},
    config::{BackendConfig, ConfigErrors, SubmitConfig},
    coordinator::{
        BackendResolver, ConfiguredBackends, Coordinator, CoordinatorError, SubmitPolicy,
    },
    executors::{Context, HtcFlavor, SubmissionType},
};
use inquire::{Confirm, Select};
use std::{collections::BTreeMap, path::PathBuf, process::ExitCode, time::Duration};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "genscan", version, about = "Generate and submit parametric job studies")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build (or extend) the study described by a scan file.
    Create(CreateArgs),
    /// Build a study made of one job per generation, without scans.
    Single(CreateArgs),
    /// Run submission cycles on a study.
    Submit(SubmitArgs),
    /// Poll submitted jobs and report the study status.
    Status(StatusArgs),
}

#[derive(Args, Debug)]
struct CreateArgs {
    /// Scan file describing the study.
    scan: PathBuf,
    /// Remove an existing study folder before building.
    #[arg(long)]
    force_overwrite: bool,
    /// YAML mapping replacing the scans of whole generations.
    #[arg(long)]
    overrides: Option<PathBuf>,
    /// Folder receiving the study, defaults to the folder of the scan file.
    #[arg(long)]
    output_dir: Option<PathBuf>,
    /// File name of the per-node configuration.
    #[arg(long, default_value = "config.yaml")]
    name_config: String,
}

#[derive(Args, Debug)]
struct SubmitArgs {
    /// Manifest of the study (tree.yaml).
    manifest: PathBuf,
    /// Submission configuration (backends, environments, per generation settings).
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    python_environment: Option<PathBuf>,
    #[arg(long)]
    python_environment_container: Option<PathBuf>,
    #[arg(long)]
    container_image: Option<PathBuf>,
    /// Only dispatch a generation once the previous one is entirely done.
    #[arg(long)]
    one_generation_at_a_time: bool,
    /// Keep cycling until every job is done.
    #[arg(long)]
    keep_alive: bool,
    /// Minutes between two cycles.
    #[arg(long, default_value_t = 30.0)]
    wait_minutes: f64,
    /// Stop after this many cycles.
    #[arg(long)]
    max_cycles: Option<usize>,
    /// Ask for the backend of generations missing from the configuration.
    #[arg(long)]
    interactive: bool,
}

#[derive(Args, Debug)]
struct StatusArgs {
    /// Manifest of the study (tree.yaml).
    manifest: PathBuf,
    /// Submission configuration, needed for cleanup commands.
    #[arg(long)]
    config: Option<PathBuf>,
}

/// Ask for missing backends on the terminal, once per generation
struct InteractiveBackends {
    configured: ConfiguredBackends,
    answered: BTreeMap<String, BackendConfig>,
}

impl InteractiveBackends {
    fn prompt(generation: &str) -> Result<BackendConfig, inquire::InquireError> {
        let submission_type = Select::new(
            &format!("Submission type for generation {generation}:"),
            SubmissionType::ALL.to_vec(),
        )
        .prompt()?;

        let context = if Confirm::new("Does the job need a GPU?")
            .with_default(false)
            .prompt()?
        {
            Select::new("GPU context:", vec![Context::Cupy, Context::Opencl])
                .prompt()?
        } else {
            Context::Cpu
        };

        let htc_flavor = if submission_type.is_htc() {
            let flavors = vec![
                HtcFlavor::Espresso,
                HtcFlavor::Microcentury,
                HtcFlavor::Longlunch,
                HtcFlavor::Workday,
                HtcFlavor::Tomorrow,
                HtcFlavor::Testmatch,
                HtcFlavor::Nextweek,
            ];
            Some(Select::new("HTCondor flavour:", flavors).prompt()?)
        } else {
            None
        };

        Ok(BackendConfig {
            submission_type,
            context,
            htc_flavor,
            interpreter: None,
        })
    }
}

impl BackendResolver for InteractiveBackends {
    fn resolve(&mut self, generation: &str, file_name: &str) -> Result<BackendConfig, ConfigErrors> {
        if let Some(backend) = self.configured.lookup(generation, file_name) {
            return Ok(backend);
        }
        if let Some(backend) = self.answered.get(generation) {
            return Ok(backend.clone());
        }

        let backend = Self::prompt(generation).map_err(|error| {
            error!("Failed to read the backend of {generation}: {error}");
            ConfigErrors::UnresolvedBackend(generation.to_string())
        })?;
        self.answered.insert(generation.to_string(), backend.clone());
        Ok(backend)
    }
}

fn load_submit_config(path: Option<&PathBuf>) -> Result<SubmitConfig, ConfigErrors> {
    let config = match path {
        Some(path) => SubmitConfig::load(path)?,
        None => SubmitConfig::default(),
    };

    if config.preflight_checks() {
        return Err(ConfigErrors::InvalidSpec(
            path.cloned().unwrap_or_default(),
        ));
    }
    Ok(config)
}

fn create(args: CreateArgs, single: bool) -> Result<(), BuildError> {
    let options = BuildOptions {
        force_overwrite: args.force_overwrite,
        name_config: args.name_config,
        output_dir: args.output_dir,
    };

    let tree = builder::create_study(&args.scan, &options, single, args.overrides.as_deref())?;
    info!(
        nodes = tree.nodes().len(),
        manifest = ?tree.manifest_path(),
        "Study created"
    );
    Ok(())
}

fn submit(args: SubmitArgs) -> Result<(), CoordinatorError> {
    let mut config = load_submit_config(args.config.as_ref())?;
    if args.python_environment.is_some() {
        config.python_environment = args.python_environment;
    }
    if args.python_environment_container.is_some() {
        config.python_environment_container = args.python_environment_container;
    }
    if args.container_image.is_some() {
        config.container_image = args.container_image;
    }

    let policy = SubmitPolicy {
        one_generation_at_a_time: args.one_generation_at_a_time,
        keep_submit_until_done: args.keep_alive,
        wait: Duration::from_secs_f64(args.wait_minutes.max(0.0) * 60.0),
        max_cycles: args.max_cycles,
    };

    let summary = if args.interactive {
        let resolver = InteractiveBackends {
            configured: ConfiguredBackends::new(&config),
            answered: BTreeMap::new(),
        };
        Coordinator::new(&args.manifest, config, resolver, policy).submit()?
    } else {
        let resolver = ConfiguredBackends::new(&config);
        Coordinator::new(&args.manifest, config, resolver, policy).submit()?
    };

    println!("{summary}");
    Ok(())
}

fn status(args: StatusArgs) -> Result<(), CoordinatorError> {
    let config = load_submit_config(args.config.as_ref())?;
    let resolver = ConfiguredBackends::new(&config);
    let summary =
        Coordinator::new(&args.manifest, config, resolver, SubmitPolicy::default()).status()?;

    println!("{summary}");
    Ok(())
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // stdout only carries the summaries
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Create(args) => create(args, false).map_err(|error| error.to_string()),
        Command::Single(args) => create(args, true).map_err(|error| error.to_string()),
        Command::Submit(args) => submit(args).map_err(|error| error.to_string()),
        Command::Status(args) => status(args).map_err(|error| error.to_string()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            error!("{message}");
            ExitCode::FAILURE
        }
    }
}
