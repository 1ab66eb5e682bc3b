use clap::{Arg, ArgAction, ArgMatches, Command};
use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use replicr::callbacks::DaemonListener;
use replicr::daemon::{DaemonEvent, Severity, SyncProgress};
use replicr::logging::*;
use replicr::{Config, RepoRegistry, SyncDaemon, TransportRegistry};

///////////////////////
// Utility functions //
///////////////////////

fn load_config(matches: &ArgMatches) -> Result<Config, Box<dyn Error>> {
	let config = match matches.get_one::<String>("config") {
		Some(path) => Config::load(Path::new(path))?,
		None => Config::default(),
	};
	Ok(config.apply_env()?)
}

fn dir_arg(matches: &ArgMatches) -> Result<PathBuf, Box<dyn Error>> {
	let dir = matches.get_one::<String>("dir").ok_or("directory argument required")?;
	Ok(PathBuf::from(dir))
}

fn id_arg(matches: &ArgMatches) -> Result<Uuid, Box<dyn Error>> {
	let id = matches.get_one::<String>("repository-id").ok_or("repository id argument required")?;
	Ok(Uuid::parse_str(id).map_err(|e| format!("invalid repository id '{}': {}", id, e))?)
}

//////////////
// Commands //
//////////////

fn create(registry: &RepoRegistry, dir: &Path) -> Result<(), Box<dyn Error>> {
	std::fs::create_dir_all(dir)?;
	let handle = registry.create(dir)?;
	println!("Created repository {} in {}", handle.repository_id(), handle.root().display());
	Ok(())
}

/// Register `url` as a peer of the local repository and ask it to accept us
async fn connect(
	registry: &RepoRegistry,
	transports: &TransportRegistry,
	dir: &Path,
	url: &str,
	prefix: &str,
) -> Result<(), Box<dyn Error>> {
	let handle = registry.open(dir)?;
	let local_id = handle.repository_id();
	let local_key = handle.public_key()?;

	let remote = transports.create(url, local_id).await?;
	let result = async {
		let remote_id = remote.repository_id().await?;
		let remote_key = remote.public_key().await?;
		remote.request_repo_connection(&local_key).await?;
		handle.put_remote_repository(remote_id, Some(url.to_string()), remote_key, prefix)?;
		Ok::<_, Box<dyn Error>>(remote_id)
	}
	.await;
	remote.close().await?;

	let remote_id = result?;
	println!("Connected {} to {} ({})", local_id, remote_id, url);
	println!("Run 'replicr accept <dir> {}' on the other side to allow syncing", local_id);
	Ok(())
}

fn requests(registry: &RepoRegistry, dir: &Path) -> Result<(), Box<dyn Error>> {
	let handle = registry.open(dir)?;
	let requests = handle.connection_requests()?;
	if requests.is_empty() {
		println!("No pending connection requests");
	}
	for request in requests {
		println!("{}  prefix {}", request.repository_id, request.local_path_prefix);
	}
	Ok(())
}

fn accept(registry: &RepoRegistry, dir: &Path, repository_id: Uuid) -> Result<(), Box<dyn Error>> {
	let handle = registry.open(dir)?;
	let remote = handle.accept_connection_request(repository_id)?;
	println!("Accepted {} (prefix {})", remote.repository_id, remote.local_path_prefix);
	Ok(())
}

fn scan(registry: &RepoRegistry, dir: &Path) -> Result<(), Box<dyn Error>> {
	let handle = registry.open(dir)?;
	let report = handle.scan()?;
	println!(
		"{} created, {} updated, {} deleted, {} bytes hashed (revision {})",
		report.created,
		report.updated,
		report.deleted,
		report.hashed_bytes,
		handle.local_revision()?
	);
	Ok(())
}

fn status(registry: &RepoRegistry, dir: &Path) -> Result<(), Box<dyn Error>> {
	let handle = registry.open(dir)?;
	println!("Repository {}", handle.repository_id());
	println!("Root:       {}", handle.root().display());
	println!("Revision:   {}", handle.local_revision()?);
	for remote in handle.remote_repositories()? {
		println!(
			"Peer {}  {}  prefix {}  revision {}/{}",
			remote.repository_id,
			remote.remote_root.as_deref().unwrap_or("(inbound only)"),
			remote.local_path_prefix,
			remote.revision,
			remote.local_revision
		);
	}
	Ok(())
}

/// Sync every given repository with all of its peers
async fn sync(daemon: &SyncDaemon, dirs: Vec<PathBuf>) -> Result<bool, Box<dyn Error>> {
	let requests = dirs.iter().map(|dir| daemon.start_sync(dir));
	let ids = futures::future::join_all(requests).await.into_iter().collect::<Result<Vec<_>, _>>()?;
	daemon.shutdown().await;

	let mut ok = true;
	for id in ids {
		let states = daemon.states(id);
		if states.is_empty() {
			println!("{}: no peers to sync with", id);
		}
		for state in states {
			let mark = match state.severity {
				Severity::Info => "ok",
				Severity::Error => {
					ok = false;
					"FAILED"
				}
			};
			println!("{} -> {} [{}] {}", id, state.url, mark, state.message);
			for cause in state.error.iter().flatten().skip(1) {
				println!("    caused by: {}", cause);
			}
		}
	}
	Ok(ok)
}

struct LogListener;

impl DaemonListener for LogListener {
	fn on_event(&self, event: &DaemonEvent) {
		match event {
			DaemonEvent::ActivitiesChanged { repository_id, added, .. } => {
				for activity in added {
					debug!("{}: {:?}", repository_id, activity.activity);
				}
			}
			DaemonEvent::Progress { remote_repository_id, progress, .. } => match progress {
				SyncProgress::Phase(phase) => debug!("{}: {}", remote_repository_id, phase),
				SyncProgress::FileTransferred { path, bytes } => debug!("{}: {} ({} bytes)", remote_repository_id, path, bytes),
				SyncProgress::Skipped { path, reason } => info!("{}: skipped {}: {}", remote_repository_id, path, reason),
			},
			DaemonEvent::StatesChanged { .. } => {}
		}
	}
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
	let dir = || Arg::new("dir").required(true).value_name("DIR");
	let matches = Command::new("Replicr")
		.version("0.1.0")
		.author("Szilard Hajba <szilu@symbion.hu>")
		.about("Peer-to-peer file repository replicator")
		.subcommand_required(true)
		.arg(Arg::new("config").short('c').long("config").value_name("FILE").global(true).help("Config file (TOML or JSON5)"))
		.subcommand(Command::new("create").about("Turn a directory into a repository").arg(dir()))
		.subcommand(
			Command::new("connect")
				.about("Connect a repository to another one")
				.arg(dir())
				.arg(Arg::new("url").required(true).value_name("URL").help("Remote repository URL (file://...)"))
				.arg(
					Arg::new("prefix")
						.long("prefix")
						.value_name("PATH")
						.default_value("/")
						.help("Local path the remote is mapped to"),
				),
		)
		.subcommand(Command::new("requests").about("List pending connection requests").arg(dir()))
		.subcommand(
			Command::new("accept")
				.about("Accept a connection request")
				.arg(dir())
				.arg(Arg::new("repository-id").required(true).value_name("ID")),
		)
		.subcommand(Command::new("scan").about("Rescan a repository").arg(dir()))
		.subcommand(Command::new("status").about("Show repository state and peers").arg(dir()))
		.subcommand(
			Command::new("sync")
				.about("Sync repositories with their peers")
				.arg(dir().action(ArgAction::Append).num_args(1..)),
		)
		.get_matches();

	let config = load_config(&matches)?;
	init_tracing_with_default(&config.log_level);
	let registry = RepoRegistry::new(Arc::new(config));
	let transports = TransportRegistry::with_local(registry.clone());

	match matches.subcommand() {
		Some(("create", sub)) => create(&registry, &dir_arg(sub)?)?,
		Some(("connect", sub)) => {
			let url = sub.get_one::<String>("url").ok_or("connect: URL argument required")?;
			let prefix = sub.get_one::<String>("prefix").map(|s| s.as_str()).unwrap_or("/");
			connect(&registry, &transports, &dir_arg(sub)?, url, prefix).await?
		}
		Some(("requests", sub)) => requests(&registry, &dir_arg(sub)?)?,
		Some(("accept", sub)) => accept(&registry, &dir_arg(sub)?, id_arg(sub)?)?,
		Some(("scan", sub)) => scan(&registry, &dir_arg(sub)?)?,
		Some(("status", sub)) => status(&registry, &dir_arg(sub)?)?,
		Some(("sync", sub)) => {
			let dirs: Vec<PathBuf> = sub
				.get_many::<String>("dir")
				.ok_or("sync: at least one directory argument required")?
				.map(PathBuf::from)
				.collect();
			let daemon = SyncDaemon::new(registry.clone(), transports);
			daemon.add_listener(Arc::new(LogListener));
			if !sync(&daemon, dirs).await? {
				std::process::exit(1);
			}
		}
		_ => unreachable!("subcommand_required"),
	}
	registry.close_all_idle();

	Ok(())
}

// vim: ts=4
