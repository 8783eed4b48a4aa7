mod cli;

use clap::Parser;
use fuser::MountOption;
use log::info;

use cli::Cli;
use tarfs::{lifecycle, TarFs};

fn parse_fuse_options(raw: &str) -> Vec<MountOption> {
    raw.split(',')
        .filter(|s| !s.is_empty())
        .map(|opt| match opt {
            "allow_other" => MountOption::AllowOther,
            "allow_root" => MountOption::AllowRoot,
            "auto_unmount" => MountOption::AutoUnmount,
            "default_permissions" => MountOption::DefaultPermissions,
            "ro" => MountOption::RO,
            "rw" => MountOption::RW,
            "dev" => MountOption::Dev,
            "nodev" => MountOption::NoDev,
            "suid" => MountOption::Suid,
            "nosuid" => MountOption::NoSuid,
            "exec" => MountOption::Exec,
            "noexec" => MountOption::NoExec,
            "atime" => MountOption::Atime,
            "noatime" => MountOption::NoAtime,
            other => MountOption::CUSTOM(other.to_string()),
        })
        .collect()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let level = match cli.debug {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        _ => log::LevelFilter::Debug,
    };
    env_logger::Builder::new().filter_level(level).init();

    let config = cli.to_mount_config();
    let mount_path = cli.resolved_mount_path();

    info!("opening index for {}", cli.archive_path.display());
    let opened = lifecycle::open_or_create(&cli.archive_path, &config)?;
    let archive_mtime = opened.store.load_archive_stats()?.map(|s| s.st_mtime).unwrap_or(0);
    let reader = lifecycle::open_serving_reader(&cli.archive_path, &opened, &config)?;

    let read_path = tarfs::ReadPath::new(opened.store, reader);
    let fs = TarFs::new(read_path, archive_mtime, &config);

    std::fs::create_dir_all(&mount_path).ok();

    let mut options = vec![MountOption::RO, MountOption::FSName("tarfs".to_string())];
    if let Some(raw) = &cli.fuse_options {
        options.extend(parse_fuse_options(raw));
    }

    info!("mounting {} at {}", cli.archive_path.display(), mount_path.display());
    fuser::mount2(fs, &mount_path, &options)?;
    Ok(())
}
