use std::{path::PathBuf, sync::Arc};

use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use tracing::{error, info, span, Level};
use tracing_subscriber::EnvFilter;

use kodofs::{
    adapters::kodo::KodoConfig,
    bucket::Bucket,
    fs::{CacheOptions, CachedFS},
    fuse::KodoFuse,
    model::fs::FSError,
    mount::{self, MountOptions, Mounter, Registry},
    util::{object, pool::PoolConfig, region},
};

fn command() -> Command {
    Command::new("kodofs")
        .about("Mounts a Kodo bucket as a read-only filesystem backed by a local cache")
        .arg(Arg::new("URL").required(true).index(1).help("kodo:<bucket>?<token>"))
        .arg(Arg::new("MOUNT_POINT").required(true).index(2))
        .arg(
            Arg::new("cache-dir")
                .long("cache-dir")
                .required(true)
                .value_parser(value_parser!(PathBuf))
                .help("Local mirror of the bucket"),
        )
        .arg(
            Arg::new("host")
                .long("host")
                .action(ArgAction::Append)
                .help("BUCKET=HOST download host of a bucket, repeatable"),
        )
        .arg(
            Arg::new("protected-key")
                .long("protected-key")
                .env("KODOFS_PROTECTED_KEY")
                .required(true)
                .hide_env_values(true),
        )
        .arg(Arg::new("offline").long("offline").action(ArgAction::SetTrue))
        .arg(
            Arg::new("cache-file")
                .long("cache-file")
                .action(ArgAction::SetTrue)
                .help("Keep file content locally once read"),
        )
        .arg(
            Arg::new("private")
                .long("private")
                .action(ArgAction::SetTrue)
                .help("Sign download URLs"),
        )
        .arg(
            Arg::new("backend")
                .long("backend")
                .default_value("kodo")
                .value_parser(["kodo", "s3"]),
        )
        .arg(Arg::new("s3-region").long("s3-region"))
        .arg(Arg::new("s3-endpoint").long("s3-endpoint"))
        .arg(
            Arg::new("uc-host")
                .long("uc-host")
                .default_value(region::DEFAULT_UC_HOST),
        )
        .arg(
            Arg::new("workers")
                .long("workers")
                .value_parser(value_parser!(usize))
                .help("Background stub writer threads [default: 4]"),
        )
        .arg(
            Arg::new("queue-size")
                .long("queue-size")
                .value_parser(value_parser!(usize))
                .help("Queued directory passes before writing inline [default: 256]"),
        )
}

fn main() {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let span = span!(Level::INFO, "main", context = "main");
    let _e = span.enter();
    info!("called");

    let matches = command().get_matches();
    if let Err(err) = run(&matches) {
        error!(error_message=%err, error_group="mount");
        std::process::exit(1);
    }
}

fn run(matches: &ArgMatches) -> Result<(), FSError> {
    let string = |id: &str| matches.get_one::<String>(id).cloned().unwrap_or_default();

    let url = string("URL");
    let mountpoint = string("MOUNT_POINT");
    let cache_dir = matches
        .get_one::<PathBuf>("cache-dir")
        .cloned()
        .unwrap_or_default();
    info!(mountpoint=%mountpoint, cache_dir=%cache_dir.display(), "args");

    let registry = Arc::new(Registry::new());
    let mut pairs = Vec::new();
    for arg in matches.get_many::<String>("host").into_iter().flatten() {
        pairs.push(mount::parse_host_pair(arg)?);
    }
    registry.register(pairs);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("kodofs-net")
        .enable_all()
        .build()?;

    let resolver = Arc::new(region::RegionResolver::new(
        &string("uc-host"),
        Some(region::RegionResolver::default_cache_path()),
    ));
    let mounter = Mounter::new(
        registry,
        resolver,
        runtime.handle().clone(),
        &string("protected-key"),
    );

    let opts = MountOptions {
        backend: object::parse_backend(&string("backend"))?,
        s3_region: matches.get_one::<String>("s3-region").cloned(),
        s3_endpoint: matches.get_one::<String>("s3-endpoint").cloned(),
        private: matches.get_flag("private"),
        kodo: KodoConfig::default(),
    };
    let bucket: Bucket = mounter.open(&url, &opts)?;

    let defaults = PoolConfig::default();
    let cache = CacheOptions {
        cache_file: matches.get_flag("cache-file"),
        offline: matches.get_flag("offline"),
        pool: PoolConfig {
            workers: matches
                .get_one::<usize>("workers")
                .copied()
                .unwrap_or(defaults.workers),
            queue_size: matches
                .get_one::<usize>("queue-size")
                .copied()
                .unwrap_or(defaults.queue_size),
        },
    };
    let fs = CachedFS::new(&cache_dir, bucket, None, &cache)?;

    let options = vec![
        fuser::MountOption::FSName("kodofs".to_string()),
        fuser::MountOption::RO,
        fuser::MountOption::AutoUnmount,
        fuser::MountOption::AllowRoot,
    ];

    fuser::mount2(KodoFuse::new(Arc::new(fs)), &mountpoint, &options)?;
    Ok(())
}
