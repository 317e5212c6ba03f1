use std::path::PathBuf;
use std::process::ExitCode;

use log::{error, info};

use mtpd::{
    DeviceInfoProvider, FunctionFsTransporter, NullThumbnailerService, Responder, StorageConfig,
    StorageFactory, StorageType,
};

/// Default FunctionFS mount point for the MTP function.
const FUNCTIONFS_DIR: &str = "/dev/mtp";

fn main() -> ExitCode {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let storage_root = args
        .next()
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(PathBuf::from));
    let Some(storage_root) = storage_root else {
        error!("no storage root given and HOME is unset");
        return ExitCode::FAILURE;
    };
    let functionfs_dir = args.next().map(PathBuf::from).unwrap_or_else(|| {
        PathBuf::from(FUNCTIONFS_DIR)
    });

    let mut factory = StorageFactory::new(None);
    let config = StorageConfig {
        path: storage_root.clone(),
        storage_type: StorageType::FixedRam,
        volume_label: storage_root
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "storage".into()),
        description: "Internal storage".into(),
        exclude_paths: Vec::new(),
    };
    if let Err(err) = factory.add_storage(config, Box::new(NullThumbnailerService)) {
        error!("could not set up storage at {}: {}", storage_root.display(), err);
        return ExitCode::FAILURE;
    }

    let (transporter, events) = FunctionFsTransporter::new(&functionfs_dir);
    let mut responder = Responder::new(factory, DeviceInfoProvider::new(), Box::new(transporter));

    info!(
        "exporting {} over {}",
        storage_root.display(),
        functionfs_dir.display()
    );
    responder.run(events);
    ExitCode::SUCCESS
}
