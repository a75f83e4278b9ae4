use clap::{Arg, ArgAction, ArgMatches, Command};
use std::error::Error;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, io, process};

use zkharness::config::{validate_port, validate_secret, Config};
use zkharness::controller;
use zkharness::launcher::{self, LaunchCommand, StartOptions, TokioSpawner};
use zkharness::layout::{InstanceLayout, InstanceRecord};
use zkharness::logging::{self, *};
use zkharness::supervised::{self, LaunchArgs};

/// Picked up from the working directory when no `-c` is given
const DEFAULT_CONFIG_FILE: &str = "zkharness.toml";

///////////////////////
// Utility functions //
///////////////////////

fn load_config(matches: &ArgMatches) -> Result<Config, Box<dyn Error>> {
	let config = match matches.get_one::<String>("config") {
		Some(path) => Config::load(Path::new(path))?,
		None if Path::new(DEFAULT_CONFIG_FILE).is_file() => Config::load(Path::new(DEFAULT_CONFIG_FILE))?,
		None => Config::default(),
	};
	Ok(config)
}

fn launch_args(matches: &ArgMatches) -> Result<LaunchArgs, Box<dyn Error>> {
	let defaults = LaunchArgs::default();
	let shutdown_port = *matches.get_one::<u16>("shutdownPort").ok_or("launch: --shutdownPort is required")?;
	validate_port("shutdownPort", shutdown_port)?;
	let shutdown_string =
		matches.get_one::<String>("shutdownString").cloned().unwrap_or(defaults.shutdown_string);
	validate_secret(&shutdown_string)?;

	Ok(LaunchArgs {
		host: matches.get_one::<String>("host").cloned().unwrap_or(defaults.host),
		shutdown_port,
		shutdown_string,
		token: matches.get_one::<String>("token").cloned(),
		zoocfg: matches.get_one::<String>("zoocfg").map(PathBuf::from),
		log_dir: matches.get_one::<String>("logdir").map(PathBuf::from),
		grace: matches.get_one::<u64>("grace").map(|s| Duration::from_secs(*s)).unwrap_or(defaults.grace),
		service_name: matches.get_one::<String>("name").cloned().unwrap_or(defaults.service_name),
		command: matches.get_many::<String>("command").ok_or("launch: service command required")?.cloned().collect(),
	})
}

/// The supervised-process command line for `config`
fn launch_command(config: &Config, layout: &InstanceLayout, token: &str) -> Result<LaunchCommand, Box<dyn Error>> {
	let program = match &config.launcher {
		Some(path) => path.clone(),
		None => env::current_exe()?,
	};
	let zoocfg = layout.config_file();
	let log_dir = layout.log_dir.clone();
	Ok(LaunchCommand::new(program)
		.args(config.launch_args.iter().cloned())
		.arg("launch")
		.args(["--host", config.client_port_address.as_str()])
		.args(["--shutdownPort".to_string(), config.shutdown_port.to_string()])
		.args(["--shutdownString", config.shutdown_string.as_str()])
		.args(["--token", token])
		.args(["--zoocfg".to_string(), zoocfg.display().to_string()])
		.args(["--logdir".to_string(), log_dir.display().to_string()])
		.args(["--grace".to_string(), config.grace_period.to_string()])
		.args(["--name", config.service.name.as_str()])
		.arg("--")
		.args(config.service.command.iter().cloned()))
}

//////////////
// Commands //
//////////////

async fn cmd_start(config: Config) -> Result<(), Box<dyn Error>> {
	let layout = InstanceLayout::prepare(&config)?;
	layout.write_service_config(&config)?;

	let token = launcher::new_token();
	let command = launch_command(&config, &layout, &token)?;
	let options = StartOptions {
		verify_lines: config.verify_limit(),
		readiness: config.readiness.clone().map(|readiness| (config.client_endpoint(), readiness)),
		shutdown: Some((config.shutdown_endpoint(), config.shutdown_string.clone())),
	};

	let outcome = launcher::start(&TokioSpawner, &command, &token, options).await?;
	let record = InstanceRecord::new(&config, outcome.process.id(), &token, outcome.verified);
	layout.write_record(&record)?;

	if outcome.verified {
		eprintln!("{} started (shutdown port {})", config.service.name, config.shutdown_port);
	} else {
		eprintln!("{} launched, but startup could not be verified", config.service.name);
	}
	Ok(())
}

async fn cmd_stop(config: Config, wait: Duration) -> Result<(), Box<dyn Error>> {
	let layout = InstanceLayout::for_config(&config);
	// the record holds what the running instance actually bound to
	let endpoint = match layout.read_record()? {
		Some(record) => zkharness::Endpoint::new(record.shutdown_host, record.shutdown_port),
		None => config.shutdown_endpoint(),
	};

	let outcome = controller::stop(&endpoint, &config.shutdown_string, wait).await?;
	// a sent but unconfirmed request still hands the instance over to its shutdown
	if outcome.is_success() {
		layout.remove_record()?;
	}
	eprintln!("{}: {}", config.service.name, outcome);
	if outcome.is_success() {
		Ok(())
	} else {
		Err(format!("stopping {} on {}: {}", config.service.name, endpoint, outcome).into())
	}
}

async fn cmd_launch(args: LaunchArgs) -> i32 {
	if let Some(dir) = &args.log_dir {
		if let Err(e) = logging::init_tracing_to(dir) {
			eprintln!("Cannot open log file in {}: {}", dir.display(), e);
			logging::init_tracing();
		}
	} else {
		logging::init_tracing();
	}
	supervised::install_fault_handler();
	info!("Launching {} with shutdown port {}", args.service_name, args.shutdown_port);

	let result = supervised::launch(&args, io::stderr()).await;
	result.exit_code()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
	let matches = Command::new("zkharness")
		.version(env!("CARGO_PKG_VERSION"))
		.author(env!("CARGO_PKG_AUTHORS"))
		.about("Start, verify and stop a ZooKeeper instance for builds and tests")
		.subcommand_required(true)
		.arg(
			Arg::new("config")
				.short('c')
				.long("config")
				.value_name("FILE")
				.global(true)
				.help("Config file (TOML)"),
		)
		.subcommand(
			Command::new("start")
				.about("Fork the supervised service and verify it started")
				.arg(
					Arg::new("keep-previous-state")
						.long("keep-previous-state")
						.action(ArgAction::SetTrue)
						.help("Keep data from a previous run"),
				),
		)
		.subcommand(
			Command::new("stop").about("Ask a running instance to shut down").arg(
				Arg::new("wait")
					.long("wait")
					.value_name("SECONDS")
					.value_parser(clap::value_parser!(u64))
					.help("Seconds to wait for confirmation (0 = don't wait)"),
			),
		)
		.subcommand(
			Command::new("launch")
				.about("Supervised process entry point (used internally)")
				.arg(Arg::new("host").long("host").value_name("ADDR").help("Shutdown listener address"))
				.arg(
					Arg::new("shutdownPort")
						.long("shutdownPort")
						.value_name("PORT")
						.required(true)
						.value_parser(clap::value_parser!(u16).range(1..)),
				)
				.arg(Arg::new("shutdownString").long("shutdownString").value_name("SECRET"))
				.arg(Arg::new("token").long("token").value_name("TOKEN"))
				.arg(Arg::new("zoocfg").long("zoocfg").value_name("FILE"))
				.arg(Arg::new("logdir").long("logdir").value_name("DIR"))
				.arg(
					Arg::new("grace")
						.long("grace")
						.value_name("SECONDS")
						.value_parser(clap::value_parser!(u64).range(1..)),
				)
				.arg(Arg::new("name").long("name").value_name("NAME"))
				.arg(Arg::new("command").required(true).num_args(1..).last(true)),
		)
		.get_matches();

	if let Some(sub_matches) = matches.subcommand_matches("launch") {
		let args = launch_args(sub_matches)?;
		process::exit(cmd_launch(args).await);
	}

	logging::init_tracing();

	if let Some(sub_matches) = matches.subcommand_matches("start") {
		let mut config = load_config(sub_matches)?;
		if sub_matches.get_flag("keep-previous-state") {
			config.keep_previous_state = true;
		}
		config.validate()?;
		if let Err(e) = cmd_start(config).await {
			error!("{}", e);
			process::exit(1);
		}
	} else if let Some(sub_matches) = matches.subcommand_matches("stop") {
		let config = load_config(sub_matches)?;
		let wait = sub_matches.get_one::<u64>("wait").map(|s| Duration::from_secs(*s)).unwrap_or(config.shutdown_wait());
		if let Err(e) = cmd_stop(config, wait).await {
			error!("{}", e);
			process::exit(1);
		}
	}

	Ok(())
}

// vim: ts=4
